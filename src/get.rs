//! The `GetValue<V>` trait and its implementations give [`crate::Handle`]
//! one generic, overloaded `get<V>()` entry point for every supported value
//! type.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::ItemType;
use crate::storage::Storage;
use crate::Key;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

pub trait GetValue<V> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<V, Error>;
}

impl<T: Platform> Storage<T> {
    fn get_primitive(&mut self, ns_index: u8, typ: ItemType, key: &Key) -> Result<u64, Error> {
        let width = typ.primitive_width().ok_or(Error::InvalidArg)?;
        let mut buf = [0u8; 8];
        self.read_item(ns_index, typ, key, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<T: Platform> GetValue<bool> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<bool, Error> {
        Ok(self.get_primitive(ns_index, ItemType::U8, key)? != 0)
    }
}

impl<T: Platform> GetValue<u8> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<u8, Error> {
        Ok(self.get_primitive(ns_index, ItemType::U8, key)? as u8)
    }
}

impl<T: Platform> GetValue<u16> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<u16, Error> {
        Ok(self.get_primitive(ns_index, ItemType::U16, key)? as u16)
    }
}

impl<T: Platform> GetValue<u32> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<u32, Error> {
        Ok(self.get_primitive(ns_index, ItemType::U32, key)? as u32)
    }
}

impl<T: Platform> GetValue<u64> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<u64, Error> {
        self.get_primitive(ns_index, ItemType::U64, key)
    }
}

impl<T: Platform> GetValue<i8> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<i8, Error> {
        Ok(self.get_primitive(ns_index, ItemType::I8, key)? as i8)
    }
}

impl<T: Platform> GetValue<i16> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<i16, Error> {
        Ok(self.get_primitive(ns_index, ItemType::I16, key)? as i16)
    }
}

impl<T: Platform> GetValue<i32> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<i32, Error> {
        Ok(self.get_primitive(ns_index, ItemType::I32, key)? as i32)
    }
}

impl<T: Platform> GetValue<i64> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<i64, Error> {
        Ok(self.get_primitive(ns_index, ItemType::I64, key)?.cast_signed())
    }
}

impl<T: Platform> GetValue<String> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<String, Error> {
        let size = self.item_data_size(ns_index, ItemType::Str, key)?;
        let mut buf = vec![0u8; size];
        self.read_item(ns_index, ItemType::Str, key, &mut buf)?;
        if buf.last() == Some(&0) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| Error::CorruptedData)
    }
}

impl<T: Platform> GetValue<Vec<u8>> for Storage<T> {
    fn get_value(&mut self, ns_index: u8, key: &Key) -> Result<Vec<u8>, Error> {
        let size = self.item_data_size(ns_index, ItemType::Blob, key)?;
        let mut buf = vec![0u8; size];
        self.read_item(ns_index, ItemType::Blob, key, &mut buf)?;
        Ok(buf)
    }
}
