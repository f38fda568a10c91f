//! The `SetValue<V>` trait mirrors [`crate::GetValue`] for writes.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::ItemType;
use crate::storage::Storage;
use crate::Key;
use alloc::vec::Vec;

pub trait SetValue<V> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: V) -> Result<(), Error>;
}

impl<T: Platform> Storage<T> {
    fn set_primitive(
        &mut self,
        ns_index: u8,
        typ: ItemType,
        key: &Key,
        value: u64,
    ) -> Result<(), Error> {
        let width = typ.primitive_width().ok_or(Error::InvalidArg)?;
        self.write_item(ns_index, typ, key, &value.to_le_bytes()[..width])
    }
}

impl<T: Platform> SetValue<bool> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: bool) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::U8, key, value as u64)
    }
}

impl<T: Platform> SetValue<u8> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: u8) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::U8, key, value as u64)
    }
}

impl<T: Platform> SetValue<u16> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: u16) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::U16, key, value as u64)
    }
}

impl<T: Platform> SetValue<u32> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: u32) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::U32, key, value as u64)
    }
}

impl<T: Platform> SetValue<u64> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: u64) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::U64, key, value)
    }
}

impl<T: Platform> SetValue<i8> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: i8) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::I8, key, value.cast_unsigned() as u64)
    }
}

impl<T: Platform> SetValue<i16> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: i16) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::I16, key, value.cast_unsigned() as u64)
    }
}

impl<T: Platform> SetValue<i32> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: i32) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::I32, key, value.cast_unsigned() as u64)
    }
}

impl<T: Platform> SetValue<i64> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: i64) -> Result<(), Error> {
        self.set_primitive(ns_index, ItemType::I64, key, value.cast_unsigned())
    }
}

impl<T: Platform> SetValue<&str> for Storage<T> {
    /// Strings are stored with their NUL terminator, like the reference
    /// format expects.
    fn set_value(&mut self, ns_index: u8, key: &Key, value: &str) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
        self.write_item(ns_index, ItemType::Str, key, &buf)
    }
}

impl<T: Platform> SetValue<&[u8]> for Storage<T> {
    fn set_value(&mut self, ns_index: u8, key: &Key, value: &[u8]) -> Result<(), Error> {
        self.write_item(ns_index, ItemType::Blob, key, value)
    }
}
