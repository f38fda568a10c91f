//! Namespace-bound handles.

use crate::error::Error;
use crate::get::GetValue;
use crate::platform::Platform;
use crate::raw::ItemType;
use crate::set::SetValue;
use crate::storage::{SharedStorage, Storage};
use crate::Key;
use alloc::rc::Rc;

/// Access mode requested when opening a namespace.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A view of the storage scoped to one namespace.
///
/// Handles are counted: while any is alive, [`Storage::init`] refuses to
/// run, so the namespace binding can never go stale underneath the caller.
/// Dropping the handle releases it.
pub struct Handle<T: Platform> {
    storage: SharedStorage<T>,
    ns_index: u8,
    read_only: bool,
}

impl<T: Platform> Handle<T> {
    /// Opens `ns_name`. The namespace is created on first use only in
    /// [`OpenMode::ReadWrite`]; read-only opens of an unknown namespace
    /// fail with `NotFound`.
    pub fn open(
        storage: &SharedStorage<T>,
        ns_name: &Key,
        mode: OpenMode,
    ) -> Result<Self, Error> {
        let mut guard = storage.borrow_mut();
        let ns_index =
            guard.create_or_open_namespace(ns_name, mode == OpenMode::ReadWrite)?;
        guard.handle_count += 1;
        drop(guard);

        Ok(Self {
            storage: Rc::clone(storage),
            ns_index,
            read_only: mode == OpenMode::ReadOnly,
        })
    }

    /// Reads a typed value: `bool`, the integer widths, `String` or
    /// `Vec<u8>`.
    pub fn get<V>(&self, key: &Key) -> Result<V, Error>
    where
        Storage<T>: GetValue<V>,
    {
        self.storage.borrow_mut().get_value(self.ns_index, key)
    }

    /// Writes a typed value. Strings are stored NUL-terminated on a single
    /// page; `&[u8]` blobs may span pages.
    pub fn set<V>(&self, key: &Key, value: V) -> Result<(), Error>
    where
        Storage<T>: SetValue<V>,
    {
        self.writable()?;
        self.storage.borrow_mut().set_value(self.ns_index, key, value)
    }

    /// Erases `key`, whatever its stored type.
    pub fn remove(&self, key: &Key) -> Result<(), Error> {
        self.writable()?;
        self.storage
            .borrow_mut()
            .erase_item(self.ns_index, ItemType::Any, key)
    }

    /// Erases every item of this namespace.
    pub fn remove_all(&self) -> Result<(), Error> {
        self.writable()?;
        self.storage.borrow_mut().erase_namespace(self.ns_index)
    }

    /// Stored payload size of a string or blob value.
    pub fn data_size(&self, typ: ItemType, key: &Key) -> Result<usize, Error> {
        self.storage
            .borrow_mut()
            .item_data_size(self.ns_index, typ, key)
    }

    pub fn namespace_index(&self) -> u8 {
        self.ns_index
    }

    fn writable(&self) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

impl<T: Platform> Drop for Handle<T> {
    fn drop(&mut self) {
        let mut guard = self.storage.borrow_mut();
        guard.handle_count = guard.handle_count.saturating_sub(1);
    }
}
