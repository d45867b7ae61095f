//! Channel fallback buffers

use crate::{cache, DMA_ALIGNMENT};

/// Capacity of each channel's fallback buffer, in bytes
pub const FALLBACK_CAPACITY: usize = 4096;

/// A DMA-safe scratch buffer owned by one channel
///
/// When a caller's buffer doesn't meet the DMA alignment requirement, the
/// transfer runs through this buffer instead. The buffer is aligned to a cache
/// line, so maintenance on it never touches anyone else's data.
#[repr(C, align(64))]
pub struct FallbackBuffer([u8; FALLBACK_CAPACITY]);

const _: [(); 1] = [(); (core::mem::align_of::<FallbackBuffer>() == cache::LINESIZE) as usize];

impl FallbackBuffer {
    pub const fn new() -> Self {
        FallbackBuffer([0; FALLBACK_CAPACITY])
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    /// Copy `src` into the front of this buffer
    ///
    /// Returns `None` if `src` doesn't fit.
    pub fn copy_in(&mut self, src: &[u8]) -> Option<()> {
        self.0.get_mut(..src.len())?.copy_from_slice(src);
        Some(())
    }

    /// Copy the first `dst.len()` bytes of this buffer into `dst`
    ///
    /// Returns `None` if `dst` is longer than the buffer.
    pub fn copy_out(&self, dst: &mut [u8]) -> Option<()> {
        dst.copy_from_slice(self.0.get(..dst.len())?);
        Some(())
    }
}

impl Default for FallbackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Indicates if the DMA engine can use `ptr` directly
pub fn is_dma_aligned(ptr: *const u8) -> bool {
    (ptr as usize) % DMA_ALIGNMENT == 0
}
