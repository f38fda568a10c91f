use embedded_storage::nor_flash::NorFlash;

/// Everything the store needs from its environment: NOR flash access plus a
/// CRC32 implementation, which is hardware-backed on most targets. Blanket
/// implemented for any type providing both halves.
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

pub type FnCrc32 = fn(init: u32, data: &[u8]) -> u32;

/// CRC32 provider. The polynomial must match whatever wrote the partition;
/// the reference format uses the zlib polynomial with an all-ones seed.
pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32;
}

pub(crate) trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

impl<T: Platform> AlignedOps for T {}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    size.saturating_add(alignment - 1) / alignment * alignment
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    size / alignment * alignment
}
