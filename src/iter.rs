//! Lazy enumeration of user items.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{Item, ItemType};
use crate::storage::Storage;
use crate::{CHUNK_ANY, Key, NS_INDEX};

/// One user-visible entry, as surfaced by [`ItemIterator`].
///
/// A committed multi-page blob appears as a single entry of type
/// [`ItemType::Blob`] whose `data_size` comes from its index item; the
/// internal chunk and index items themselves are never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub namespace_index: u8,
    pub key: Key,
    pub item_type: ItemType,
    pub data_size: usize,
}

/// Restartable cursor over the user items of one namespace (or all of
/// them), optionally filtered by type. Holding the iterator borrows the
/// storage, so the enumeration cannot be invalidated by writes.
pub struct ItemIterator<'s, T: Platform> {
    storage: &'s mut Storage<T>,
    ns_index: u8,
    typ: ItemType,
    page: usize,
    entry: u8,
}

impl<'s, T: Platform> ItemIterator<'s, T> {
    pub(crate) fn new(storage: &'s mut Storage<T>, ns_index: u8, typ: ItemType) -> Self {
        Self {
            storage,
            ns_index,
            typ,
            page: 0,
            entry: 0,
        }
    }

    /// Returns the cursor to the first page.
    pub fn reset(&mut self) {
        self.page = 0;
        self.entry = 0;
    }

    /// Advances to the next user item; `Ok(None)` once exhausted.
    pub fn next_entry(&mut self) -> Result<Option<EntryInfo>, Error> {
        let Storage { hal, pm, .. } = &mut *self.storage;
        let pm = pm.as_ref().ok_or(Error::NotInitialized)?;

        while self.page < pm.pages().len() {
            let page = &pm.pages()[self.page];
            loop {
                match page.find_item(
                    hal,
                    self.ns_index,
                    ItemType::Any,
                    None,
                    self.entry,
                    CHUNK_ANY,
                    None,
                ) {
                    Ok((index, item)) => {
                        self.entry = index.saturating_add(item.span.max(1));
                        if let Some(info) = surface(&item, self.typ) {
                            return Ok(Some(info));
                        }
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
            self.page += 1;
            self.entry = 0;
        }
        Ok(None)
    }
}

/// Decides whether an item is user-visible and under which face. Directory
/// entries and blob chunks stay hidden; a blob index is presented as the
/// blob it commits.
fn surface(item: &Item, wanted: ItemType) -> Option<EntryInfo> {
    if item.ns_index == NS_INDEX {
        return None;
    }

    let (item_type, data_size) = match item.typ() {
        ItemType::BlobData => return None,
        ItemType::BlobIndex => (
            ItemType::Blob,
            unsafe { item.data.blob_index }.data_size as usize,
        ),
        ItemType::Str | ItemType::Blob => {
            (item.typ(), unsafe { item.data.var }.size as usize)
        }
        typ => (typ, typ.primitive_width().unwrap_or(0)),
    };

    if wanted != ItemType::Any && item_type != wanted {
        return None;
    }

    Some(EntryInfo {
        namespace_index: item.ns_index,
        key: item.key,
        item_type,
        data_size,
    })
}
