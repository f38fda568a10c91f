#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

extern crate alloc;

pub mod error;
mod blob;
mod get;
mod handle;
mod iter;
mod page;
mod page_manager;
pub mod platform;
mod raw;
mod set;
mod storage;
mod u24;

pub use error::Error;
pub use get::GetValue;
pub use handle::{Handle, OpenMode};
pub use iter::{EntryInfo, ItemIterator};
pub use raw::ItemType;
pub use set::SetValue;
pub use storage::{SharedStorage, Storage, StorageStats};

use core::fmt;

/// Maximum usable key length is 15 bytes; the 16th byte is the NUL
/// terminator of the on-flash representation.
pub const MAX_KEY_LENGTH: usize = 15;
const KEY_SIZE: usize = MAX_KEY_LENGTH + 1;

/// Namespace index reserved for the namespace directory itself.
pub const NS_INDEX: u8 = 0;
/// Namespace wildcard in queries; never allocated to a namespace.
pub const NS_ANY: u8 = 0xFF;
/// Chunk-index wildcard; also what non-chunk items carry on flash.
pub const CHUNK_ANY: u8 = 0xFF;

/// A key or namespace name: up to [`MAX_KEY_LENGTH`] bytes, NUL-padded to 16.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Builds a key from a string. Panics when the input exceeds
    /// [`MAX_KEY_LENGTH`]; wrap the call in `const { .. }` to turn that into
    /// a compile error:
    ///
    /// `let key = const { Key::from_str("boot_count") };`
    pub const fn from_str(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    /// Builds a key from raw bytes, NUL-padding to 16. Panics when the input
    /// exceeds [`MAX_KEY_LENGTH`].
    pub const fn from_slice(src: &[u8]) -> Self {
        assert!(src.len() <= MAX_KEY_LENGTH);
        let mut buf = [0u8; KEY_SIZE];
        let mut i = 0;
        while i < src.len() {
            buf[i] = src[i];
            i += 1;
        }
        Self(buf)
    }

    /// Fallible conversion for names supplied at runtime. Embedded NUL bytes
    /// are rejected because the stored form is NUL-terminated.
    pub fn try_new(src: &[u8]) -> Result<Self, Error> {
        if src.len() > MAX_KEY_LENGTH || src.contains(&0) {
            return Err(Error::InvalidArg);
        }
        Ok(Self::from_slice(src))
    }

    /// The full 16-byte on-flash representation.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The name bytes without the NUL padding.
    pub fn name(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(KEY_SIZE);
        &self.0[..end]
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(\"")?;
        for &byte in self.name() {
            write!(f, "{}", core::ascii::escape_default(byte))?;
        }
        write!(f, "\")")
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
