#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{buffer::FallbackBuffer, CHANNEL_COUNT};

/// DMA memory associated with the host channels.
///
/// Each driver needs a `ChannelMemory`. Allocate a `static` object and
/// supply it to the driver constructor. Make sure that the memory is not
/// shared across drivers; otherwise, the driver constructor panics.
///
/// ```
/// use dwc_otg_hcd::ChannelMemory;
///
/// static CHANNEL_MEMORY: ChannelMemory = ChannelMemory::new();
/// ```
///
/// The memory must be visible to the controller's DMA engine. On the
/// BCM2837 that's any SDRAM below the VideoCore carve-out.
pub struct ChannelMemory {
    buffers: [UnsafeCell<FallbackBuffer>; CHANNEL_COUNT],
    taken: AtomicBool,
}

unsafe impl Sync for ChannelMemory {}

impl ChannelMemory {
    /// Allocate one fallback buffer per channel.
    pub const fn new() -> Self {
        const BUFFER: UnsafeCell<FallbackBuffer> = UnsafeCell::new(FallbackBuffer::new());
        Self {
            buffers: [BUFFER; CHANNEL_COUNT],
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the per-channel buffers.
    ///
    /// Returns `None` if the buffers were already taken.
    pub(crate) fn take(&'static self) -> Option<[&'static mut FallbackBuffer; CHANNEL_COUNT]> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: the flag above is only cleared at construction, so this is
        // the only place that ever hands out these references.
        Some(core::array::from_fn(|channel| unsafe {
            &mut *self.buffers[channel].get()
        }))
    }
}

impl Default for ChannelMemory {
    fn default() -> Self {
        Self::new()
    }
}
