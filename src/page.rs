//! RAM-thin page objects.
//!
//! A [`Page`] keeps only what lookups need in memory: the decoded header,
//! a copy of the entry-state bitmap, a 24-bit hash list of user items and
//! the occupancy counters. Item payloads stay on flash and are read on
//! demand.

use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{
    BITMAP_OFFSET, BITMAP_SIZE, ENTRIES_OFFSET, ENTRY_COUNT, ENTRY_SIZE, EntryState, Item,
    ItemData, ItemDataVar, ItemType, PageHeader, PageState, SECTOR_SIZE, VerOffset, write_aligned,
};
use crate::u24::u24;
use crate::{CHUNK_ANY, Key, NS_ANY, NS_INDEX};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::mem::size_of;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) struct Page {
    pub(crate) address: u32,
    state: PageState,
    sequence: u32,
    bitmap: [u8; BITMAP_SIZE],
    hash_list: Vec<HashEntry>,
    /// First entry slot that was never written. Slots before it may be
    /// erased, but on NOR flash they cannot be reused until the sector is.
    next_free: u8,
    used_entries: u8,
    erased_entries: u8,
}

pub(crate) struct HashEntry {
    pub(crate) hash: u24,
    pub(crate) index: u8,
}

impl Page {
    pub(crate) fn blank(address: u32) -> Self {
        Self {
            address,
            state: PageState::Uninitialized,
            sequence: 0,
            bitmap: [0xFF; BITMAP_SIZE],
            hash_list: Vec::new(),
            next_free: 0,
            used_entries: 0,
            erased_entries: 0,
        }
    }

    /// Reads one sector and rebuilds the page state, repairing what a crash
    /// may have left behind: entries written but not marked, and marked
    /// entries that fail their CRC.
    pub(crate) fn load<T: Platform>(hal: &mut T, address: u32) -> Result<Self, Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        hal.read(address, &mut buf).map_err(|_| Error::Flash)?;

        let header_raw: [u8; size_of::<PageHeader>()] =
            buf[..size_of::<PageHeader>()].try_into().unwrap();
        if header_raw.iter().all(|&b| b == 0xFF) {
            let mut page = Self::blank(address);
            if !buf.iter().all(|&b| b == 0xFF) {
                // data without a header: the sector erase never finished
                page.state = PageState::Corrupt;
            }
            return Ok(page);
        }

        let header = PageHeader::from_raw(header_raw);
        let mut page = Self {
            address,
            state: PageState::from(header.state),
            sequence: header.sequence,
            bitmap: buf[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE]
                .try_into()
                .unwrap(),
            hash_list: Vec::new(),
            next_free: 0,
            used_entries: 0,
            erased_entries: 0,
        };

        #[cfg(feature = "debug-logs")]
        println!("page: load {:#08x} -> {}", address, page.state);

        match page.state {
            PageState::Active | PageState::Full | PageState::Freeing => {}
            PageState::Uninitialized => {
                // state word still all-ones but other header bytes are not
                page.state = PageState::Corrupt;
                return Ok(page);
            }
            _ => return Ok(page),
        }

        if header.crc != header.calculate_crc32(T::crc32) {
            page.state = PageState::Corrupt;
            return Ok(page);
        }

        let entry_raw = |idx: u8| -> [u8; ENTRY_SIZE] {
            let off = ENTRIES_OFFSET + idx as usize * ENTRY_SIZE;
            buf[off..off + ENTRY_SIZE].try_into().unwrap()
        };

        let mut idx: u8 = 0;
        while (idx as usize) < ENTRY_COUNT {
            let remaining = (ENTRY_COUNT - idx as usize) as u8;
            match page.entry_state(idx) {
                EntryState::Erased | EntryState::Illegal => {
                    page.erased_entries += 1;
                    page.note_occupied(idx, 1);
                    idx += 1;
                }
                EntryState::Empty => {
                    // The bitmap update trails the entry write; adopt
                    // complete entries that missed their mark.
                    match Item::from_raw(entry_raw(idx), T::crc32) {
                        Ok(item) if item.span >= 1 && item.span <= remaining => {
                            let healthy = if item.typ().is_variable() {
                                let var = unsafe { item.data.var };
                                let size = var.size as usize;
                                let off = ENTRIES_OFFSET + (idx as usize + 1) * ENTRY_SIZE;
                                size <= (item.span as usize - 1) * ENTRY_SIZE
                                    && var.crc == T::crc32(u32::MAX, &buf[off..off + size])
                            } else {
                                true
                            };

                            let span = item.span;
                            if healthy {
                                #[cfg(feature = "debug-logs")]
                                println!("page: adopting unmarked entry {idx}");
                                page.set_entry_state_range::<T>(
                                    hal,
                                    idx..idx + span,
                                    EntryState::Written,
                                )?;
                                page.accept(&item, idx, T::crc32);
                            } else {
                                page.set_entry_state_range::<T>(
                                    hal,
                                    idx..idx + span,
                                    EntryState::Erased,
                                )?;
                                page.erased_entries += span;
                                page.note_occupied(idx, span);
                            }
                            idx += span;
                        }
                        _ => {
                            idx += 1;
                        }
                    }
                }
                EntryState::Written => {
                    match Item::from_raw(entry_raw(idx), T::crc32) {
                        Ok(item) if item.span >= 1 && item.span <= remaining => {
                            let span = item.span;
                            page.accept(&item, idx, T::crc32);
                            idx += span;
                        }
                        _ => {
                            // the span byte of a corrupt entry is untrusted
                            let span = entry_raw(idx)[2].clamp(1, remaining);
                            page.set_entry_state_range::<T>(
                                hal,
                                idx..idx + span,
                                EntryState::Erased,
                            )?;
                            page.erased_entries += span;
                            page.note_occupied(idx, span);
                            idx += span;
                        }
                    }
                }
            }
        }

        Ok(page)
    }

    fn accept(&mut self, item: &Item, index: u8, crc32: crate::platform::FnCrc32) {
        self.used_entries += item.span;
        self.note_occupied(index, item.span);
        if item.ns_index != NS_INDEX {
            self.hash_list.push(HashEntry {
                hash: item.hash(crc32),
                index,
            });
        }
    }

    fn note_occupied(&mut self, index: u8, span: u8) {
        self.next_free = self.next_free.max(index + span);
    }

    pub(crate) fn initialize<T: Platform>(
        &mut self,
        hal: &mut T,
        sequence: u32,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("page initialize @{:#08x} seq {}", self.address, sequence);

        let header = PageHeader::new(PageState::Active, sequence, T::crc32);
        write_aligned(hal, self.address, &header.to_raw())?;
        self.state = PageState::Active;
        self.sequence = sequence;
        Ok(())
    }

    /// State transitions only clear bits, so rewriting the state word in
    /// place is a legal NOR write.
    pub(crate) fn set_state<T: Platform>(
        &mut self,
        hal: &mut T,
        state: PageState,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("page @{:#08x} -> {}", self.address, state as u32);

        write_aligned(hal, self.address, &(state as u32).to_le_bytes())?;
        self.state = state;
        Ok(())
    }

    pub(crate) fn write_item<T: Platform>(
        &mut self,
        hal: &mut T,
        ns_index: u8,
        typ: ItemType,
        key: Key,
        chunk_index: Option<u8>,
        data: ItemData,
    ) -> Result<u8, Error> {
        if self.state != PageState::Active || (self.next_free as usize) >= ENTRY_COUNT {
            return Err(Error::PageFull);
        }

        let item = Item::new(ns_index, typ, 1, chunk_index, key, data, T::crc32);
        let index = self.next_free;

        #[cfg(feature = "defmt")]
        trace!("page write @{:#08x}[{}]", self.address, index);

        write_aligned(hal, self.entry_address(index), &item.to_raw())?;
        self.set_entry_state_range::<T>(hal, index..index + 1, EntryState::Written)?;

        self.next_free += 1;
        self.used_entries += 1;
        if ns_index != NS_INDEX {
            self.hash_list.push(HashEntry {
                hash: item.hash(T::crc32),
                index,
            });
        }
        Ok(index)
    }

    pub(crate) fn write_var_item<T: Platform>(
        &mut self,
        hal: &mut T,
        ns_index: u8,
        typ: ItemType,
        key: Key,
        chunk_index: Option<u8>,
        data: &[u8],
    ) -> Result<u8, Error> {
        if self.state != PageState::Active {
            return Err(Error::PageFull);
        }

        let span = 1 + data.len().div_ceil(ENTRY_SIZE);
        if span > ENTRY_COUNT {
            return Err(Error::ValueTooLong);
        }
        if self.next_free as usize + span > ENTRY_COUNT {
            return Err(Error::PageFull);
        }

        let var = ItemDataVar::new(data.len() as u16, T::crc32(u32::MAX, data));
        let item = Item::new(
            ns_index,
            typ,
            span as u8,
            chunk_index,
            key,
            ItemData { var },
            T::crc32,
        );
        let index = self.next_free;

        #[cfg(feature = "defmt")]
        trace!(
            "page write var @{:#08x}[{}..{}]",
            self.address,
            index,
            index + span as u8
        );

        write_aligned(hal, self.entry_address(index), &item.to_raw())?;
        if !data.is_empty() {
            write_aligned(hal, self.entry_address(index) + ENTRY_SIZE as u32, data)?;
        }
        self.set_entry_state_range::<T>(hal, index..index + span as u8, EntryState::Written)?;

        self.next_free += span as u8;
        self.used_entries += span as u8;
        if ns_index != NS_INDEX {
            self.hash_list.push(HashEntry {
                hash: item.hash(T::crc32),
                index,
            });
        }
        Ok(index)
    }

    pub(crate) fn load_item<T: Platform>(&self, hal: &mut T, index: u8) -> Result<Item, Error> {
        let mut buf = [0u8; ENTRY_SIZE];
        hal.read(self.entry_address(index), &mut buf)
            .map_err(|_| Error::Flash)?;
        Item::from_raw(buf, T::crc32).map_err(|_| Error::NotFound)
    }

    /// Reads and validates the payload of a var-length item.
    pub(crate) fn read_payload<T: Platform>(
        &self,
        hal: &mut T,
        index: u8,
        item: &Item,
    ) -> Result<Vec<u8>, Error> {
        debug_assert!(item.typ().is_variable());

        let var = unsafe { item.data.var };
        let size = var.size as usize;
        if size > (item.span.max(1) as usize - 1) * ENTRY_SIZE {
            return Err(Error::CorruptedData);
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; T::align_read(size)];
        hal.read(self.entry_address(index) + ENTRY_SIZE as u32, &mut buf)
            .map_err(|_| Error::Flash)?;
        buf.truncate(size);

        if var.crc != T::crc32(u32::MAX, &buf) {
            return Err(Error::CorruptedData);
        }
        Ok(buf)
    }

    /// `Ok(())` when the stored value equals `data` byte for byte.
    pub(crate) fn cmp_item<T: Platform>(
        &self,
        hal: &mut T,
        index: u8,
        item: &Item,
        data: &[u8],
    ) -> Result<(), Error> {
        if let Some(width) = item.typ().primitive_width() {
            let raw = unsafe { item.data.raw };
            if data.len() == width && raw[..width] == *data {
                return Ok(());
            }
            return Err(Error::ContentDiffers);
        }

        if !item.typ().is_variable() {
            return Err(Error::ContentDiffers);
        }

        let var = unsafe { item.data.var };
        if var.size as usize != data.len() || var.crc != T::crc32(u32::MAX, data) {
            return Err(Error::ContentDiffers);
        }
        let stored = self.read_payload(hal, index, item)?;
        if stored == data {
            Ok(())
        } else {
            Err(Error::ContentDiffers)
        }
    }

    pub(crate) fn erase_item_at<T: Platform>(
        &mut self,
        hal: &mut T,
        index: u8,
        span: u8,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("page erase @{:#08x}[{}..{}]", self.address, index, index + span);

        let span = span.max(1);
        self.set_entry_state_range::<T>(hal, index..index + span, EntryState::Erased)?;
        self.erased_entries += span;
        self.used_entries = self.used_entries.saturating_sub(span);
        self.hash_list.retain(|entry| entry.index != index);
        Ok(())
    }

    /// Finds the next entry at or after `start` matching every given filter.
    /// `NS_ANY`, [`ItemType::Any`], `None` key, `CHUNK_ANY` and `None`
    /// version are wildcards.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn find_item<T: Platform>(
        &self,
        hal: &mut T,
        ns_index: u8,
        typ: ItemType,
        key: Option<&Key>,
        start: u8,
        chunk_index: u8,
        chunk_start: Option<VerOffset>,
    ) -> Result<(u8, Item), Error> {
        if !matches!(
            self.state,
            PageState::Active | PageState::Full | PageState::Freeing
        ) {
            return Err(Error::NotFound);
        }

        // Point lookups of user items go through the hash list; directory
        // entries and wildcard scans walk the bitmap.
        if let Some(key) = key
            && ns_index != NS_ANY
            && ns_index != NS_INDEX
            && typ != ItemType::Any
        {
            let hash = Item::hash_of(T::crc32, ns_index, key, chunk_index);
            for entry in &self.hash_list {
                if entry.index < start || entry.hash != hash {
                    continue;
                }
                let item = match self.load_item(hal, entry.index) {
                    Ok(item) => item,
                    Err(Error::Flash) => return Err(Error::Flash),
                    Err(_) => continue,
                };
                if Self::matches(&item, ns_index, typ, Some(key), chunk_index, chunk_start) {
                    return Ok((entry.index, item));
                }
            }
            return Err(Error::NotFound);
        }

        let mut idx = start;
        while idx < self.next_free {
            if self.entry_state(idx) != EntryState::Written {
                idx += 1;
                continue;
            }
            let item = match self.load_item(hal, idx) {
                Ok(item) => item,
                Err(Error::Flash) => return Err(Error::Flash),
                Err(_) => {
                    idx += 1;
                    continue;
                }
            };
            if Self::matches(&item, ns_index, typ, key, chunk_index, chunk_start) {
                return Ok((idx, item));
            }
            idx = idx.saturating_add(item.span.max(1));
        }
        Err(Error::NotFound)
    }

    fn matches(
        item: &Item,
        ns_index: u8,
        typ: ItemType,
        key: Option<&Key>,
        chunk_index: u8,
        chunk_start: Option<VerOffset>,
    ) -> bool {
        if ns_index != NS_ANY && item.ns_index != ns_index {
            return false;
        }
        if typ != ItemType::Any && item.typ() != typ {
            return false;
        }
        if let Some(key) = key
            && item.key != *key
        {
            return false;
        }
        if chunk_index != CHUNK_ANY && item.chunk_index != chunk_index {
            return false;
        }
        if let Some(ver) = chunk_start {
            if item.typ() != ItemType::BlobIndex {
                return false;
            }
            let index = unsafe { item.data.blob_index };
            if VerOffset::from(index.chunk_start) != ver {
                return false;
            }
        }
        true
    }

    pub(crate) fn entry_state(&self, index: u8) -> EntryState {
        let byte = self.bitmap[(index / 4) as usize];
        let bits = (byte >> ((index % 4) * 2)) & 0b11;
        EntryState::from_repr(bits).unwrap()
    }

    fn set_entry_state_range<T: Platform>(
        &mut self,
        hal: &mut T,
        range: Range<u8>,
        state: EntryState,
    ) -> Result<(), Error> {
        let raw_state = state as u8;
        for idx in range.clone() {
            let shift = (idx % 4) * 2;
            let mask = 0b11u8 << shift;
            self.bitmap[(idx / 4) as usize] &= (raw_state << shift) | !mask;
        }

        let start_byte = (range.start / 4) as usize;
        let end_byte = ((range.end - 1) / 4) as usize;
        let start = T::align_write_floor(start_byte);
        let end = T::align_write_ceil(end_byte + 1);

        hal.write(
            self.address + (BITMAP_OFFSET + start) as u32,
            &self.bitmap[start..end],
        )
        .map_err(|_| Error::Flash)
    }

    fn entry_address(&self, index: u8) -> u32 {
        self.address + (ENTRIES_OFFSET + index as usize * ENTRY_SIZE) as u32
    }

    /// Bytes one more var-length item could carry here: everything after the
    /// next free entry, minus the entry holding the item header.
    pub(crate) fn var_data_tailroom(&self) -> usize {
        if self.state != PageState::Active {
            return 0;
        }
        let next = self.next_free as usize;
        if next + 1 >= ENTRY_COUNT {
            return 0;
        }
        (ENTRY_COUNT - next - 1) * ENTRY_SIZE
    }

    pub(crate) fn free_entries(&self) -> usize {
        ENTRY_COUNT - self.next_free as usize
    }

    pub(crate) fn state(&self) -> PageState {
        self.state
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn used_entries(&self) -> u8 {
        self.used_entries
    }

    pub(crate) fn erased_entries(&self) -> u8 {
        self.erased_entries
    }

    pub(crate) fn hash_entries(&self) -> &[HashEntry] {
        &self.hash_list
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Page {}

impl PartialOrd for Page {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Page {
    /// Free-heap priority: erased-blank pages first since they activate
    /// without a sector erase, lowest address breaking the tie.
    fn cmp(&self, other: &Self) -> Ordering {
        let blank = self.state == PageState::Uninitialized;
        let other_blank = other.state == PageState::Uninitialized;
        match (blank, other_blank) {
            (true, true) => other.address.cmp(&self.address),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => other.sequence.cmp(&self.sequence),
        }
    }
}
