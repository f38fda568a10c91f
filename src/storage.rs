//! The storage core: lifecycle, namespaces, item routing and recovery.

use crate::error::Error;
use crate::iter::ItemIterator;
use crate::page_manager::PageManager;
use crate::platform::Platform;
use crate::raw::{
    CHUNK_MAX_SIZE, ENTRY_COUNT, EntryState, Item, ItemData, ItemType, PageState, SECTOR_SIZE,
};
use crate::{CHUNK_ANY, Key, NS_ANY, NS_INDEX};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Shared ownership wrapper that [`crate::Handle`]s hang on to.
pub type SharedStorage<T> = Rc<RefCell<Storage<T>>>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum State {
    Invalid,
    Active,
}

struct NamespaceEntry {
    name: Key,
    index: u8,
}

/// One bit per namespace index; makes finding the lowest free index a scan
/// over eight words instead of over the directory.
struct NamespaceUsage([u32; 8]);

impl NamespaceUsage {
    fn new() -> Self {
        Self([0; 8])
    }

    fn clear(&mut self) {
        self.0 = [0; 8];
    }

    fn get(&self, index: u8) -> bool {
        self.0[index as usize / 32] >> (index as usize % 32) & 1 == 1
    }

    fn set(&mut self, index: u8, used: bool) {
        let bit = 1u32 << (index as usize % 32);
        if used {
            self.0[index as usize / 32] |= bit;
        } else {
            self.0[index as usize / 32] &= !bit;
        }
    }

    fn first_free(&self) -> Option<u8> {
        (1..=254).find(|&index| !self.get(index))
    }
}

/// Where a lookup found an item.
pub(crate) struct ItemSlot {
    pub(crate) page: usize,
    pub(crate) index: u8,
    pub(crate) item: Item,
}

/// Committed blob ranges collected while scanning the partition on init.
struct BlobIndexRecord {
    ns_index: u8,
    key: Key,
    chunk_start: u8,
    chunk_count: u8,
}

/// Partition occupancy snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub namespace_count: usize,
    pub used_entries: usize,
    pub free_entries: usize,
    /// Free entries minus one page worth, which stays reserved for page
    /// rotation.
    pub available_entries: usize,
    pub total_entries: usize,
    pub page_count: usize,
}

/// A key-value store over one flash partition.
///
/// Construction leaves the store invalid; [`Storage::init`] scans the
/// partition, repairs crash leftovers and makes the store active. All
/// operations mirror their result into [`Storage::last_error`].
pub struct Storage<T: Platform> {
    pub(crate) hal: T,
    pub(crate) pm: Option<PageManager>,
    pub(crate) handle_count: usize,
    namespaces: Vec<NamespaceEntry>,
    ns_usage: NamespaceUsage,
    state: State,
    last_error: Option<Error>,
}

impl<T: Platform> Storage<T> {
    pub fn new(hal: T) -> Self {
        Self {
            hal,
            pm: None,
            handle_count: 0,
            namespaces: Vec::new(),
            ns_usage: NamespaceUsage::new(),
            state: State::Invalid,
            last_error: None,
        }
    }

    /// Wraps the store for use with [`crate::Handle`].
    pub fn into_shared(self) -> SharedStorage<T> {
        Rc::new(RefCell::new(self))
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// Result of the most recent operation; sticky until the next one.
    pub fn last_error(&self) -> Result<(), Error> {
        match self.last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Loads the partition at `base_sector` spanning `sector_count` sectors.
    ///
    /// Refused while handles are open, since it would re-index namespaces
    /// under them. Any failure leaves the store invalid.
    pub fn init(&mut self, base_sector: u32, sector_count: usize) -> Result<(), Error> {
        let result = self.init_inner(base_sector, sector_count);
        if result.is_err() {
            self.state = State::Invalid;
            self.pm = None;
        }
        self.track(result)
    }

    fn init_inner(&mut self, base_sector: u32, sector_count: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("storage init: base {} count {}", base_sector, sector_count);

        if self.handle_count != 0 {
            return Err(Error::InvalidState);
        }
        if sector_count == 0 {
            return Err(Error::InvalidArg);
        }
        let end = (base_sector as usize + sector_count) * SECTOR_SIZE;
        if end > self.hal.capacity() {
            return Err(Error::InvalidArg);
        }

        self.state = State::Invalid;
        self.namespaces.clear();
        self.ns_usage.clear();

        self.pm = Some(PageManager::load(&mut self.hal, base_sector, sector_count)?);

        self.load_namespaces()?;
        self.ns_usage.set(NS_INDEX, true);
        self.ns_usage.set(NS_ANY, true);

        let records = self.scan_blob_indices()?;
        self.erase_orphan_chunks(&records)?;

        self.state = State::Active;
        Ok(())
    }

    /// Rebuilds the namespace directory from the items of namespace 0.
    fn load_namespaces(&mut self) -> Result<(), Error> {
        let Storage {
            hal,
            pm,
            namespaces,
            ns_usage,
            ..
        } = self;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;

        for page in pm.pages() {
            let mut cursor = 0u8;
            loop {
                match page.find_item(hal, NS_INDEX, ItemType::U8, None, cursor, CHUNK_ANY, None) {
                    Ok((index, item)) => {
                        cursor = index.saturating_add(item.span.max(1));
                        let ns_index = unsafe { item.data.raw }[0];
                        namespaces.try_reserve(1).map_err(|_| Error::NoMem)?;
                        namespaces.push(NamespaceEntry {
                            name: item.key,
                            index: ns_index,
                        });
                        ns_usage.set(ns_index, true);
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn scan_blob_indices(&mut self) -> Result<Vec<BlobIndexRecord>, Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;

        let mut records: Vec<BlobIndexRecord> = Vec::new();
        for page in pm.pages() {
            let mut cursor = 0u8;
            loop {
                match page.find_item(
                    hal,
                    NS_ANY,
                    ItemType::BlobIndex,
                    None,
                    cursor,
                    CHUNK_ANY,
                    None,
                ) {
                    Ok((index, item)) => {
                        cursor = index.saturating_add(item.span.max(1));
                        let blob = unsafe { item.data.blob_index };
                        records.try_reserve(1).map_err(|_| Error::NoMem)?;
                        records.push(BlobIndexRecord {
                            ns_index: item.ns_index,
                            key: item.key,
                            chunk_start: blob.chunk_start,
                            chunk_count: blob.chunk_count,
                        });
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(records)
    }

    /// Erases every `BlobData` chunk whose chunk index no committed blob
    /// index covers. Such orphans are what a crash between the write phases
    /// of a blob leaves behind.
    fn erase_orphan_chunks(&mut self, records: &[BlobIndexRecord]) -> Result<(), Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_mut().ok_or(Error::NotInitialized)?;

        for pos in 0..pm.pages().len() {
            let mut cursor = 0u8;
            loop {
                let found = pm.pages()[pos].find_item(
                    hal,
                    NS_ANY,
                    ItemType::BlobData,
                    None,
                    cursor,
                    CHUNK_ANY,
                    None,
                );
                match found {
                    Ok((index, item)) => {
                        let span = item.span.max(1);
                        cursor = index.saturating_add(span);
                        let covered = records.iter().any(|record| {
                            record.ns_index == item.ns_index
                                && record.key == item.key
                                && item.chunk_index >= record.chunk_start
                                && (item.chunk_index as u16)
                                    < record.chunk_start as u16 + record.chunk_count as u16
                        });
                        if !covered {
                            #[cfg(feature = "debug-logs")]
                            println!(
                                "storage: erasing orphan chunk {} of {:?}",
                                item.chunk_index, item.key
                            );
                            pm.page_mut(pos).erase_item_at(hal, index, span)?;
                        }
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Resolves a namespace name to its index, allocating the lowest free
    /// index and persisting a directory entry when `can_create` is set.
    pub fn create_or_open_namespace(&mut self, name: &Key, can_create: bool) -> Result<u8, Error> {
        let result = self.create_or_open_namespace_inner(name, can_create);
        self.track(result)
    }

    fn create_or_open_namespace_inner(
        &mut self,
        name: &Key,
        can_create: bool,
    ) -> Result<u8, Error> {
        self.ensure_active()?;

        if let Some(entry) = self.namespaces.iter().find(|entry| entry.name == *name) {
            return Ok(entry.index);
        }
        if !can_create {
            return Err(Error::NotFound);
        }

        let index = self.ns_usage.first_free().ok_or(Error::NoSpace)?;
        self.namespaces.try_reserve(1).map_err(|_| Error::NoMem)?;

        self.write_item_inner(NS_INDEX, ItemType::U8, name, &[index])?;

        self.ns_usage.set(index, true);
        self.namespaces.push(NamespaceEntry { name: *name, index });
        Ok(index)
    }

    /// First sector of the partition the store was initialized on.
    pub fn base_sector(&self) -> Option<u32> {
        self.pm.as_ref().map(PageManager::base_sector)
    }

    /// The name a namespace index was registered under, if any.
    pub fn namespace_name(&self, index: u8) -> Option<&Key> {
        self.namespaces
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| &entry.name)
    }

    /// Writes a typed value. Blobs go through the multi-page protocol; all
    /// other types live in a single page. Rewriting an identical value is a
    /// no-op so unchanged values cost no erase cycles.
    pub fn write_item(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        let result = self.write_item_inner(ns_index, typ, key, data);
        self.track(result)
    }

    fn write_item_inner(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_active()?;

        match typ {
            ItemType::Any | ItemType::BlobData | ItemType::BlobIndex => {
                return Err(Error::InvalidArg);
            }
            _ => {}
        }
        if let Some(width) = typ.primitive_width()
            && width != data.len()
        {
            return Err(Error::InvalidArg);
        }

        if typ == ItemType::Blob {
            return self.write_blob(ns_index, key, data);
        }

        if typ == ItemType::Str && data.len() > CHUNK_MAX_SIZE {
            return Err(Error::ValueTooLong);
        }

        let previous = self.find_optional(ns_index, typ, key)?;

        if let Some(slot) = &previous {
            let Storage { hal, pm, .. } = self;
            let pm = pm.as_ref().ok_or(Error::NotInitialized)?;
            match pm.pages()[slot.page].cmp_item(hal, slot.index, &slot.item, data) {
                Ok(()) => return Ok(()),
                Err(Error::ContentDiffers) | Err(Error::CorruptedData) => {}
                Err(e) => return Err(e),
            }
        }

        let new_slot = self.write_single_page_item(ns_index, typ, key, None, data)?;

        if let Some(old) = previous {
            self.erase_previous(&old, new_slot)?;
        }
        Ok(())
    }

    /// Reads a typed value into `buf`. For blobs the committed multi-page
    /// form is tried first, then the single-page form older writers used.
    pub fn read_item(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let result = self.read_item_inner(ns_index, typ, key, buf);
        self.track(result)
    }

    fn read_item_inner(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.ensure_active()?;

        if typ == ItemType::Blob {
            match self.read_multi_page_blob(ns_index, key, buf) {
                Err(Error::NotFound) => {}
                other => return other,
            }
        }

        let slot = self.find_item(ns_index, typ, Some(key), CHUNK_ANY, None)?;
        self.read_slot_payload(&slot, buf)
    }

    pub(crate) fn read_slot_payload(&mut self, slot: &ItemSlot, buf: &mut [u8]) -> Result<(), Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;
        let page = &pm.pages()[slot.page];

        if let Some(width) = slot.item.typ().primitive_width() {
            if buf.len() != width {
                return Err(Error::InvalidArg);
            }
            let raw = unsafe { slot.item.data.raw };
            buf.copy_from_slice(&raw[..width]);
            return Ok(());
        }

        if !slot.item.typ().is_variable() {
            return Err(Error::NotFound);
        }

        let size = unsafe { slot.item.data.var }.size as usize;
        if buf.len() < size {
            return Err(Error::InvalidArg);
        }
        let data = page.read_payload(hal, slot.index, &slot.item)?;
        buf[..size].copy_from_slice(&data);
        Ok(())
    }

    /// Erases one item. A blob, or a key that turns out to be stored as
    /// blob structure, is torn down index-first through the multi-page path.
    pub fn erase_item(&mut self, ns_index: u8, typ: ItemType, key: &Key) -> Result<(), Error> {
        let result = self.erase_item_inner(ns_index, typ, key);
        self.track(result)
    }

    fn erase_item_inner(&mut self, ns_index: u8, typ: ItemType, key: &Key) -> Result<(), Error> {
        self.ensure_active()?;

        if typ == ItemType::Blob {
            return self.erase_multi_page_blob(ns_index, key, None);
        }

        let slot = self.find_item(ns_index, typ, Some(key), CHUNK_ANY, None)?;
        match slot.item.typ() {
            ItemType::BlobData | ItemType::BlobIndex => {
                self.erase_multi_page_blob(ns_index, key, None)
            }
            _ => {
                let Storage { hal, pm, .. } = self;
                let pm = pm.as_mut().ok_or(Error::NotInitialized)?;
                pm.page_mut(slot.page)
                    .erase_item_at(hal, slot.index, slot.item.span.max(1))
            }
        }
    }

    /// Erases every item carrying `ns_index`. The directory entry and the
    /// in-memory registration survive, so the namespace stays open.
    pub fn erase_namespace(&mut self, ns_index: u8) -> Result<(), Error> {
        let result = self.erase_namespace_inner(ns_index);
        self.track(result)
    }

    fn erase_namespace_inner(&mut self, ns_index: u8) -> Result<(), Error> {
        self.ensure_active()?;
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_mut().ok_or(Error::NotInitialized)?;

        for pos in 0..pm.pages().len() {
            loop {
                let found =
                    pm.pages()[pos].find_item(hal, ns_index, ItemType::Any, None, 0, CHUNK_ANY, None);
                match found {
                    Ok((index, item)) => {
                        pm.page_mut(pos).erase_item_at(hal, index, item.span.max(1))?;
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Stored payload size of a string or blob. For blobs the size recorded
    /// in the committed index wins over the legacy single-page form.
    pub fn item_data_size(&mut self, ns_index: u8, typ: ItemType, key: &Key) -> Result<usize, Error> {
        let result = self.item_data_size_inner(ns_index, typ, key);
        self.track(result)
    }

    fn item_data_size_inner(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
    ) -> Result<usize, Error> {
        self.ensure_active()?;

        if !matches!(typ, ItemType::Str | ItemType::Blob) {
            return Err(Error::InvalidArg);
        }

        match self.find_item(ns_index, typ, Some(key), CHUNK_ANY, None) {
            Ok(slot) => return Ok(unsafe { slot.item.data.var }.size as usize),
            Err(Error::NotFound) if typ == ItemType::Blob => {}
            Err(e) => return Err(e),
        }

        let slot = self.find_item(ns_index, ItemType::BlobIndex, Some(key), CHUNK_ANY, None)?;
        Ok(unsafe { slot.item.data.blob_index }.data_size as usize)
    }

    pub fn stats(&mut self) -> Result<StorageStats, Error> {
        let result = self.stats_inner();
        self.track(result)
    }

    fn stats_inner(&mut self) -> Result<StorageStats, Error> {
        self.ensure_active()?;
        let pm = self.pm.as_ref().ok_or(Error::NotInitialized)?;
        let (used_entries, free_entries, total_entries) = pm.fill_stats();
        Ok(StorageStats {
            namespace_count: self.namespaces.len(),
            used_entries,
            free_entries,
            available_entries: free_entries.saturating_sub(ENTRY_COUNT),
            total_entries,
            page_count: pm.page_count(),
        })
    }

    /// Number of entry slots occupied by items of one namespace.
    pub fn calc_entries_in_namespace(&mut self, ns_index: u8) -> Result<usize, Error> {
        let result = self.calc_entries_inner(ns_index);
        self.track(result)
    }

    fn calc_entries_inner(&mut self, ns_index: u8) -> Result<usize, Error> {
        self.ensure_active()?;
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;

        let mut total = 0usize;
        for page in pm.pages() {
            let mut cursor = 0u8;
            loop {
                match page.find_item(hal, ns_index, ItemType::Any, None, cursor, CHUNK_ANY, None) {
                    Ok((index, item)) => {
                        let span = item.span.max(1);
                        total += span as usize;
                        cursor = index.saturating_add(span);
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(total)
    }

    /// Lazy enumeration of the user items in one namespace, or in all of
    /// them. The iterator borrows the store, so nothing can mutate it while
    /// an enumeration is in flight.
    pub fn find_entry(
        &mut self,
        ns_name: Option<&Key>,
        typ: ItemType,
    ) -> Result<ItemIterator<'_, T>, Error> {
        let check = self.ensure_active();
        self.track(check)?;

        let ns_index = match ns_name {
            Some(name) => self.create_or_open_namespace(name, false)?,
            None => NS_ANY,
        };
        Ok(ItemIterator::new(self, ns_index, typ))
    }

    /// Finds an item by identity across all pages, oldest page first.
    pub(crate) fn find_item(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: Option<&Key>,
        chunk_index: u8,
        chunk_start: Option<crate::raw::VerOffset>,
    ) -> Result<ItemSlot, Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;

        for (page_pos, page) in pm.pages().iter().enumerate() {
            match page.find_item(hal, ns_index, typ, key, 0, chunk_index, chunk_start) {
                Ok((index, item)) => {
                    return Ok(ItemSlot {
                        page: page_pos,
                        index,
                        item,
                    });
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    pub(crate) fn find_optional(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
    ) -> Result<Option<ItemSlot>, Error> {
        match self.find_item(ns_index, typ, Some(key), CHUNK_ANY, None) {
            Ok(slot) => Ok(Some(slot)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes one single-page item, rotating to a fresh page once when the
    /// current one is full. Returns where the entry landed.
    pub(crate) fn write_single_page_item(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        chunk_index: Option<u8>,
        data: &[u8],
    ) -> Result<(usize, u8), Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_mut().ok_or(Error::NotInitialized)?;

        match Self::page_write(hal, pm.current_mut(), ns_index, typ, key, chunk_index, data) {
            Ok(index) => Ok((pm.current_index(), index)),
            Err(Error::PageFull) => {
                if pm.current().state() == PageState::Active {
                    pm.current_mut().set_state(hal, PageState::Full)?;
                }
                pm.request_new_page(hal)?;
                match Self::page_write(hal, pm.current_mut(), ns_index, typ, key, chunk_index, data)
                {
                    Ok(index) => Ok((pm.current_index(), index)),
                    Err(Error::PageFull) => Err(Error::NoSpace),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn page_write(
        hal: &mut T,
        page: &mut crate::page::Page,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        chunk_index: Option<u8>,
        data: &[u8],
    ) -> Result<u8, Error> {
        if typ.is_variable() {
            page.write_var_item(hal, ns_index, typ, *key, chunk_index, data)
        } else {
            // primitives keep their erased-flash padding in the payload
            let mut raw = [0xFFu8; 8];
            raw[..data.len()].copy_from_slice(data);
            page.write_item(hal, ns_index, typ, *key, chunk_index, ItemData { raw })
        }
    }

    /// Erases the entry a write superseded. The write may have drained pages
    /// in between, so the remembered slot is verified and the entry is
    /// hunted down again if it moved.
    fn erase_previous(&mut self, old: &ItemSlot, new_slot: (usize, u8)) -> Result<(), Error> {
        let Storage { hal, pm, .. } = self;
        let pm = pm.as_mut().ok_or(Error::NotInitialized)?;

        if (old.page, old.index) != new_slot && old.page < pm.pages().len() {
            let page = &pm.pages()[old.page];
            let intact = matches!(page.state(), PageState::Active | PageState::Full)
                && page.entry_state(old.index) == EntryState::Written
                && match page.load_item(hal, old.index) {
                    Ok(current) => current.same_identity(&old.item),
                    Err(_) => false,
                };
            if intact {
                return pm
                    .page_mut(old.page)
                    .erase_item_at(hal, old.index, old.item.span.max(1));
            }
        }

        let mut target: Option<(usize, u8, u8)> = None;
        'pages: for (pos, page) in pm.pages().iter().enumerate() {
            let mut cursor = 0u8;
            loop {
                match page.find_item(
                    hal,
                    old.item.ns_index,
                    old.item.typ(),
                    Some(&old.item.key),
                    cursor,
                    old.item.chunk_index,
                    None,
                ) {
                    Ok((index, item)) => {
                        if (pos, index) != new_slot {
                            target = Some((pos, index, item.span.max(1)));
                            break 'pages;
                        }
                        cursor = index.saturating_add(item.span.max(1));
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some((pos, index, span)) = target {
            pm.page_mut(pos).erase_item_at(hal, index, span)?;
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.state != State::Active {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    fn track<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        self.last_error = result.as_ref().err().copied();
        result
    }
}
