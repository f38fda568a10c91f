use thiserror::Error;

/// Errors returned by the storage API. The enum is non-exhaustive so that
/// recovery diagnostics can be added without breaking callers; most callers
/// only need to handle `NotFound`.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The flash driver reported a read, write or erase failure.
    #[error("flash i/o error")]
    Flash,

    /// Item, blob chunk or namespace is absent. Also returned when the key
    /// exists under a different type than the one requested.
    #[error("not found")]
    NotFound,

    /// The storage has not been initialized, or a fatal init error dropped
    /// it back to the invalid state.
    #[error("storage not initialized")]
    NotInitialized,

    /// The operation is not permitted right now, e.g. `init` while handles
    /// are still open.
    #[error("invalid state")]
    InvalidState,

    /// Malformed key or namespace name, wrong buffer size, bad partition
    /// geometry.
    #[error("invalid argument")]
    InvalidArg,

    /// The partition cannot accommodate the write, or all 254 namespace
    /// indices are taken.
    #[error("not enough space")]
    NoSpace,

    /// Value exceeds the per-type maximum: one page of payload for strings,
    /// the chunk-range cap for blobs.
    #[error("value too long")]
    ValueTooLong,

    /// An auxiliary allocation failed.
    #[error("out of memory")]
    NoMem,

    /// A page has no room for the entry. Internal; user-facing writes
    /// translate it into `NoSpace` after page rotation has been tried.
    #[error("page full")]
    PageFull,

    /// The stored value differs from the one it was compared against.
    #[error("content differs")]
    ContentDiffers,

    /// Stored data failed validation: payload CRC mismatch, inconsistent
    /// blob metadata or a non-UTF-8 string.
    #[error("corrupted data")]
    CorruptedData,

    /// Mutation through a handle opened in read-only mode.
    #[error("handle is read-only")]
    ReadOnly,
}
