//! On-flash layout of pages and items.
//!
//! A page is one 4 KiB flash sector: a 32-byte header, a 32-byte entry-state
//! bitmap (2 bits per entry) and 126 entries of 32 bytes. Nothing in here
//! touches the flash except [`write_aligned`]; decoding works on buffers.

use crate::error::Error;
use crate::platform::{AlignedOps, FnCrc32, Platform};
use crate::u24::u24;
use crate::{CHUNK_ANY, Key};
use alloc::vec;
use core::mem::{size_of, transmute};

pub(crate) const SECTOR_SIZE: usize = 4096;
pub(crate) const ENTRY_SIZE: usize = size_of::<Item>();
pub(crate) const ENTRY_COUNT: usize = 126;
pub(crate) const BITMAP_SIZE: usize = 32;
pub(crate) const BITMAP_OFFSET: usize = size_of::<PageHeader>();
pub(crate) const ENTRIES_OFFSET: usize = BITMAP_OFFSET + BITMAP_SIZE;

/// Largest payload one var-length item can carry: the leading entry holds
/// the header, the rest of the page the data.
pub(crate) const CHUNK_MAX_SIZE: usize = (ENTRY_COUNT - 1) * ENTRY_SIZE;

pub(crate) const FORMAT_VERSION: u8 = 0xFE;

const _: () = assert!(
    size_of::<PageHeader>() + BITMAP_SIZE + ENTRY_COUNT * ENTRY_SIZE == SECTOR_SIZE,
    "page layout must fill a flash sector exactly"
);

const PSB_INIT: u32 = 0x1;
const PSB_FULL: u32 = 0x2;
const PSB_FREEING: u32 = 0x4;
const PSB_CORRUPT: u32 = 0x8;

/// Page lifecycle on flash. States only ever clear bits, so each transition
/// is a single word write on NOR flash.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u32)]
pub(crate) enum PageState {
    /// All ones, the state right after a sector erase.
    Uninitialized = u32::MAX,
    /// Initialized and accepting writes.
    Active = u32::MAX & !PSB_INIT,
    /// No further writes; entries may still be erased.
    Full = u32::MAX & !PSB_INIT & !PSB_FULL,
    /// Items are being moved off this page.
    Freeing = u32::MAX & !PSB_INIT & !PSB_FULL & !PSB_FREEING,
    /// Unrecoverable contents; kept around until the space is needed.
    Corrupt = u32::MAX & !PSB_INIT & !PSB_FULL & !PSB_FREEING & !PSB_CORRUPT,
    /// Not backed by flash contents.
    Invalid = 0,
}

impl From<u32> for PageState {
    fn from(raw: u32) -> Self {
        match raw {
            x if x == PageState::Uninitialized as u32 => PageState::Uninitialized,
            x if x == PageState::Active as u32 => PageState::Active,
            x if x == PageState::Full as u32 => PageState::Full,
            x if x == PageState::Freeing as u32 => PageState::Freeing,
            x if x == PageState::Invalid as u32 => PageState::Invalid,
            _ => PageState::Corrupt,
        }
    }
}

/// Per-entry state in the page bitmap.
#[derive(strum::FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum EntryState {
    Empty = 0b11,
    Written = 0b10,
    Erased = 0b00,
    Illegal = 0b01,
}

/// Discriminator of an item's payload.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ItemType {
    U8 = 0x01,
    I8 = 0x11,
    U16 = 0x02,
    I16 = 0x12,
    U32 = 0x04,
    I32 = 0x14,
    U64 = 0x08,
    I64 = 0x18,
    /// Single-page variable-length value, used for strings.
    Str = 0x21,
    /// User-facing blob type. Only pre-index writers stored it directly;
    /// current blobs live as `BlobData` chunks under a `BlobIndex`.
    Blob = 0x41,
    /// One chunk of a multi-page blob.
    BlobData = 0x42,
    /// The entry that commits a multi-page blob.
    BlobIndex = 0x48,
    /// Query wildcard; never stored.
    Any = 0xFF,
}

impl ItemType {
    pub(crate) fn primitive_width(self) -> Option<usize> {
        match self {
            ItemType::U8 | ItemType::I8 => Some(1),
            ItemType::U16 | ItemType::I16 => Some(2),
            ItemType::U32 | ItemType::I32 => Some(4),
            ItemType::U64 | ItemType::I64 => Some(8),
            _ => None,
        }
    }

    pub(crate) fn is_variable(self) -> bool {
        matches!(self, ItemType::Str | ItemType::Blob | ItemType::BlobData)
    }
}

/// Chunk-index range marker separating the two generations of a multi-page
/// blob, so that an overwrite never collides with the version it replaces.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum VerOffset {
    V0 = 0x00,
    V1 = 0x80,
}

impl VerOffset {
    pub(crate) fn invert(self) -> Self {
        match self {
            VerOffset::V0 => VerOffset::V1,
            VerOffset::V1 => VerOffset::V0,
        }
    }
}

impl From<u8> for VerOffset {
    fn from(chunk_index: u8) -> Self {
        if chunk_index < VerOffset::V1 as u8 {
            VerOffset::V0
        } else {
            VerOffset::V1
        }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct PageHeader {
    pub(crate) state: u32,
    pub(crate) sequence: u32,
    pub(crate) version: u8,
    pub(crate) _reserved: [u8; 19],
    pub(crate) crc: u32,
}

impl PageHeader {
    pub(crate) fn new(state: PageState, sequence: u32, crc32: FnCrc32) -> Self {
        let mut header = Self {
            state: state as u32,
            sequence,
            version: FORMAT_VERSION,
            _reserved: [0xFF; 19],
            crc: 0,
        };
        header.crc = header.calculate_crc32(crc32);
        header
    }

    pub(crate) fn from_raw(buf: [u8; size_of::<PageHeader>()]) -> Self {
        // Safety: every field tolerates arbitrary bit patterns.
        unsafe { transmute(buf) }
    }

    pub(crate) fn to_raw(self) -> [u8; size_of::<PageHeader>()] {
        unsafe { transmute(self) }
    }

    /// The state word and the CRC itself are not covered: the state mutates
    /// in place over the page's lifetime.
    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf = self.to_raw();
        crc32(u32::MAX, &buf[4..28])
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct Item {
    pub(crate) ns_index: u8,
    datatype: u8,
    pub(crate) span: u8,
    pub(crate) chunk_index: u8,
    pub(crate) crc: u32,
    pub(crate) key: Key,
    pub(crate) data: ItemData,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) union ItemData {
    pub(crate) raw: [u8; 8],
    pub(crate) primitive: u64,
    pub(crate) var: ItemDataVar,
    pub(crate) blob_index: ItemDataBlobIndex,
}

/// Payload of `Str`, `Blob` and `BlobData` items: the data itself lives in
/// the following `span - 1` entries.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct ItemDataVar {
    pub(crate) size: u16,
    _reserved: u16,
    pub(crate) crc: u32,
}

impl ItemDataVar {
    pub(crate) fn new(size: u16, crc: u32) -> Self {
        Self {
            size,
            _reserved: u16::MAX,
            crc,
        }
    }
}

/// Payload of a `BlobIndex` item, naming the committed chunk range.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct ItemDataBlobIndex {
    pub(crate) data_size: u32,
    pub(crate) chunk_count: u8,
    pub(crate) chunk_start: u8,
    _reserved: u16,
}

impl ItemDataBlobIndex {
    pub(crate) fn new(data_size: u32, chunk_count: u8, chunk_start: u8) -> Self {
        Self {
            data_size,
            chunk_count,
            chunk_start,
            _reserved: u16::MAX,
        }
    }
}

impl Item {
    pub(crate) fn new(
        ns_index: u8,
        typ: ItemType,
        span: u8,
        chunk_index: Option<u8>,
        key: Key,
        data: ItemData,
        crc32: FnCrc32,
    ) -> Self {
        let mut item = Self {
            ns_index,
            datatype: typ as u8,
            span,
            chunk_index: chunk_index.unwrap_or(CHUNK_ANY),
            crc: 0,
            key,
            data,
        };
        item.crc = item.calculate_crc32(crc32);
        item
    }

    /// Decodes a raw entry. Fails on an all-ones (never written) entry, an
    /// unknown type byte or a CRC mismatch.
    pub(crate) fn from_raw(buf: [u8; ENTRY_SIZE], crc32: FnCrc32) -> Result<Self, Error> {
        if buf.iter().all(|&b| b == 0xFF) {
            return Err(Error::NotFound);
        }
        // Safety: all fields tolerate arbitrary bit patterns; the type byte
        // is validated right below.
        let item = unsafe { transmute::<[u8; ENTRY_SIZE], Item>(buf) };
        match ItemType::from_repr(item.datatype) {
            None | Some(ItemType::Any) => return Err(Error::CorruptedData),
            Some(_) => {}
        }
        if item.crc != item.calculate_crc32(crc32) {
            return Err(Error::CorruptedData);
        }
        Ok(item)
    }

    pub(crate) fn to_raw(self) -> [u8; ENTRY_SIZE] {
        unsafe { transmute(self) }
    }

    /// Valid for every item that came through [`Item::from_raw`] or
    /// [`Item::new`].
    pub(crate) fn typ(&self) -> ItemType {
        ItemType::from_repr(self.datatype).unwrap_or(ItemType::Any)
    }

    /// Items are keyed by namespace, type, key and chunk index; the payload
    /// is not part of the identity.
    pub(crate) fn same_identity(&self, other: &Item) -> bool {
        self.ns_index == other.ns_index
            && self.datatype == other.datatype
            && self.key == other.key
            && self.chunk_index == other.chunk_index
    }

    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf = self.to_raw();
        let mut crc = crc32(u32::MAX, &buf[0..4]);
        crc = crc32(crc, self.key.as_bytes());
        crc = unsafe { crc32(crc, &self.data.raw) };
        crc
    }

    pub(crate) fn hash(&self, crc32: FnCrc32) -> u24 {
        Self::hash_of(crc32, self.ns_index, &self.key, self.chunk_index)
    }

    /// 24-bit lookup hash over the item identity minus the type. Follows the
    /// reference format, which trades collisions for RAM; collisions are
    /// resolved by loading the candidate.
    pub(crate) fn hash_of(crc32: FnCrc32, ns_index: u8, key: &Key, chunk_index: u8) -> u24 {
        let mut crc = crc32(u32::MAX, &[ns_index]);
        crc = crc32(crc, key.as_bytes());
        crc = crc32(crc, &[chunk_index]);
        u24::from_u32(crc & 0x00FF_FFFF)
    }
}

/// Widens a write to the platform write unit, padding with 0xFF which NOR
/// flash treats as "leave unchanged".
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        return hal.write(offset, bytes).map_err(|_| Error::Flash);
    }

    let pivot = T::align_write_floor(bytes.len());
    if pivot != 0 {
        hal.write(offset, &bytes[..pivot])
            .map_err(|_| Error::Flash)?;
    }

    let trailer = &bytes[pivot..];
    if trailer.iter().any(|&b| b != 0xFF) {
        let mut buf = vec![0xFFu8; T::WRITE_SIZE];
        buf[..trailer.len()].copy_from_slice(trailer);
        hal.write(offset + pivot as u32, &buf)
            .map_err(|_| Error::Flash)?;
    }

    Ok(())
}
