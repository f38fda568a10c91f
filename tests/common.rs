#![allow(dead_code)]

// Shared between the integration test binaries, see
// https://doc.rust-lang.org/book/ch11-03-test-organization.html

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const SECTOR_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 32;
pub const BITMAP_OFFSET: usize = PAGE_HEADER_SIZE;
pub const BITMAP_SIZE: usize = 32;
pub const ENTRIES_OFFSET: usize = BITMAP_OFFSET + BITMAP_SIZE;
pub const ENTRY_SIZE: usize = 32;
pub const ENTRY_COUNT: usize = 126;

pub const PAGE_STATE_ACTIVE: u32 = 0xFFFF_FFFE;
pub const PAGE_STATE_FULL: u32 = 0xFFFF_FFFC;
pub const PAGE_STATE_FREEING: u32 = 0xFFFF_FFF8;

pub const TYPE_U8: u8 = 0x01;
pub const TYPE_U32: u8 = 0x04;
pub const TYPE_STR: u8 = 0x21;
pub const TYPE_BLOB_DATA: u8 = 0x42;
pub const TYPE_BLOB_INDEX: u8 = 0x48;

/// In-memory NOR flash with AND-semantics writes, an operation log and
/// optional fault injection.
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xFFu8; SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn from_image(buf: Vec<u8>) -> Self {
        Self {
            buf,
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("operations:");
        for op in &self.operations {
            println!("  {op:?}");
        }
    }

    fn faulted(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as u32));
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(SECTOR_SIZE as u32));
        assert!(to.is_multiple_of(SECTOR_SIZE as u32));
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for byte in &mut self.buf[from as usize..to as usize] {
            *byte = 0xFF;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as u32));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE));
        assert!(!bytes.is_empty());
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &value) in bytes.iter().enumerate() {
            // NOR flash can only clear bits outside of a sector erase
            self.buf[offset + i] &= value;
        }
        Ok(())
    }
}

impl nor_nvs::platform::Crc for Flash {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        crc32(init, data)
    }
}

impl nor_nvs::platform::Crc for &mut Flash {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        crc32(init, data)
    }
}

pub fn crc32(init: u32, data: &[u8]) -> u32 {
    unsafe { libz_sys::crc32(init as u64, data.as_ptr(), data.len() as u32) as u32 }
}

/// Builds raw partition images byte by byte, for fabricating the exact
/// flash states a power cut can leave behind.
pub struct ImageBuilder {
    pub buf: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xFFu8; pages * SECTOR_SIZE],
        }
    }

    pub fn into_flash(self) -> Flash {
        Flash::from_image(self.buf)
    }

    pub fn page_header(&mut self, page: usize, state: u32, sequence: u32) {
        let off = page * SECTOR_SIZE;
        let mut header = [0xFFu8; PAGE_HEADER_SIZE];
        header[0..4].copy_from_slice(&state.to_le_bytes());
        header[4..8].copy_from_slice(&sequence.to_le_bytes());
        header[8] = 0xFE;
        let crc = crc32(u32::MAX, &header[4..28]);
        header[28..32].copy_from_slice(&crc.to_le_bytes());
        self.buf[off..off + PAGE_HEADER_SIZE].copy_from_slice(&header);
    }

    pub fn fill_page(&mut self, page: usize, value: u8) {
        let off = page * SECTOR_SIZE;
        for byte in &mut self.buf[off..off + SECTOR_SIZE] {
            *byte = value;
        }
    }

    fn mark_written(&mut self, page: usize, index: usize) {
        let off = page * SECTOR_SIZE + BITMAP_OFFSET + index / 4;
        let shift = (index % 4) * 2;
        let mask = 0b11u8 << shift;
        self.buf[off] &= (0b10 << shift) | !mask;
    }

    fn entry(ns: u8, typ: u8, span: u8, chunk: u8, key: &[u8], data: [u8; 8]) -> [u8; ENTRY_SIZE] {
        assert!(key.len() <= 15);
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = ns;
        raw[1] = typ;
        raw[2] = span;
        raw[3] = chunk;
        let mut padded_key = [0u8; 16];
        padded_key[..key.len()].copy_from_slice(key);
        raw[8..24].copy_from_slice(&padded_key);
        raw[24..32].copy_from_slice(&data);
        let mut crc = crc32(u32::MAX, &raw[0..4]);
        crc = crc32(crc, &padded_key);
        crc = crc32(crc, &data);
        raw[4..8].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    fn put_entry(&mut self, page: usize, index: usize, raw: &[u8; ENTRY_SIZE]) {
        let off = page * SECTOR_SIZE + ENTRIES_OFFSET + index * ENTRY_SIZE;
        self.buf[off..off + ENTRY_SIZE].copy_from_slice(raw);
        self.mark_written(page, index);
    }

    /// Directory entry registering `name` under `ns_index`.
    pub fn add_namespace(&mut self, page: usize, index: usize, name: &[u8], ns_index: u8) -> usize {
        let mut data = [0xFFu8; 8];
        data[0] = ns_index;
        let raw = Self::entry(0, TYPE_U8, 1, 0xFF, name, data);
        self.put_entry(page, index, &raw);
        index + 1
    }

    pub fn add_u32(&mut self, page: usize, index: usize, ns: u8, key: &[u8], value: u32) -> usize {
        let mut data = [0xFFu8; 8];
        data[..4].copy_from_slice(&value.to_le_bytes());
        let raw = Self::entry(ns, TYPE_U32, 1, 0xFF, key, data);
        self.put_entry(page, index, &raw);
        index + 1
    }

    /// One `BLOB_DATA` chunk plus its payload entries. Returns the next
    /// free entry index.
    pub fn add_blob_chunk(
        &mut self,
        page: usize,
        index: usize,
        ns: u8,
        key: &[u8],
        chunk_index: u8,
        payload: &[u8],
    ) -> usize {
        let span = 1 + payload.len().div_ceil(ENTRY_SIZE);
        let mut data = [0xFFu8; 8];
        data[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        data[4..8].copy_from_slice(&crc32(u32::MAX, payload).to_le_bytes());
        let raw = Self::entry(ns, TYPE_BLOB_DATA, span as u8, chunk_index, key, data);
        self.put_entry(page, index, &raw);

        let off = page * SECTOR_SIZE + ENTRIES_OFFSET + (index + 1) * ENTRY_SIZE;
        self.buf[off..off + payload.len()].copy_from_slice(payload);
        for slot in index + 1..index + span {
            self.mark_written(page, slot);
        }
        index + span
    }

    pub fn add_blob_index(
        &mut self,
        page: usize,
        index: usize,
        ns: u8,
        key: &[u8],
        data_size: u32,
        chunk_count: u8,
        chunk_start: u8,
    ) -> usize {
        let mut data = [0xFFu8; 8];
        data[0..4].copy_from_slice(&data_size.to_le_bytes());
        data[4] = chunk_count;
        data[5] = chunk_start;
        let raw = Self::entry(ns, TYPE_BLOB_INDEX, 1, 0xFF, key, data);
        self.put_entry(page, index, &raw);
        index + 1
    }
}

/// A live (written, CRC-intact header) item parsed straight from a raw
/// partition image.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub page: usize,
    pub index: usize,
    pub ns: u8,
    pub typ: u8,
    pub span: usize,
    pub chunk: u8,
    pub key: Vec<u8>,
}

/// Walks every ACTIVE/FULL page of an image and returns the live items.
pub fn live_items(buf: &[u8]) -> Vec<RawEntry> {
    let mut items = Vec::new();
    for page in 0..buf.len() / SECTOR_SIZE {
        let off = page * SECTOR_SIZE;
        let state = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if state != PAGE_STATE_ACTIVE && state != PAGE_STATE_FULL {
            continue;
        }
        let mut index = 0usize;
        while index < ENTRY_COUNT {
            let bits = (buf[off + BITMAP_OFFSET + index / 4] >> ((index % 4) * 2)) & 0b11;
            if bits != 0b10 {
                index += 1;
                continue;
            }
            let entry_off = off + ENTRIES_OFFSET + index * ENTRY_SIZE;
            let raw = &buf[entry_off..entry_off + ENTRY_SIZE];
            let span = (raw[2] as usize).max(1);
            items.push(RawEntry {
                page,
                index,
                ns: raw[0],
                typ: raw[1],
                span,
                chunk: raw[3],
                key: raw[8..24].to_vec(),
            });
            index += span;
        }
    }
    items
}

/// Asserts the cross-page invariants every settled partition must hold: no
/// two live items share an identity, and spans never overlap (implied by
/// the bitmap walk in [`live_items`]).
pub fn check_consistency(buf: &[u8]) {
    let mut seen = std::collections::HashSet::new();
    for item in live_items(buf) {
        let identity = (item.ns, item.typ, item.key.clone(), item.chunk);
        assert!(
            seen.insert(identity),
            "duplicate item on flash: page {} entry {} (ns {}, type {:#04x})",
            item.page,
            item.index,
            item.ns,
            item.typ
        );
    }
}

pub fn key_bytes(name: &str) -> Vec<u8> {
    let mut padded = vec![0u8; 16];
    padded[..name.len()].copy_from_slice(name.as_bytes());
    padded
}

/// Number of live `BLOB_DATA` chunks stored for `(ns, key)`.
pub fn count_blob_chunks(buf: &[u8], ns: u8, key: &str) -> usize {
    let key = key_bytes(key);
    live_items(buf)
        .into_iter()
        .filter(|item| item.typ == TYPE_BLOB_DATA && item.ns == ns && item.key == key)
        .count()
}

/// Live chunk indices stored for `(ns, key)`, sorted.
pub fn blob_chunk_indices(buf: &[u8], ns: u8, key: &str) -> Vec<u8> {
    let key = key_bytes(key);
    let mut indices: Vec<u8> = live_items(buf)
        .into_iter()
        .filter(|item| item.typ == TYPE_BLOB_DATA && item.ns == ns && item.key == key)
        .map(|item| item.chunk)
        .collect();
    indices.sort_unstable();
    indices
}

pub fn count_items_with_ns(buf: &[u8], ns: u8) -> usize {
    live_items(buf).into_iter().filter(|item| item.ns == ns).count()
}
