//! Cache maintenance operations
//!
//! The controller's DMA engine does not snoop the Cortex-A53 data cache. Every
//! buffer the channel reads must be cleaned to the point of coherency before the
//! channel is armed, and every buffer the channel writes must be invalidated
//! before the CPU looks at it.
//!
//! "Invalidate" is implemented with clean-and-invalidate (`dc civac`). A plain
//! `dc ivac` would throw away bytes that the CPU wrote into the same lines
//! while draining the receive FIFO, and bytes of neighboring data sharing a
//! line with an unaligned caller buffer.
//!
//! On targets other than aarch64 (host tests) the operations only order memory.

/// Data cache line size of the Cortex-A53
pub const LINESIZE: usize = 64;

/// Returns the line-aligned addresses covering `size` bytes from `addr`.
fn lines(addr: usize, size: usize) -> impl Iterator<Item = usize> {
    let start = addr & !(LINESIZE - 1);
    let num_lines = if size == 0 {
        0
    } else {
        let end = addr + size;
        (end - start).div_ceil(LINESIZE)
    };
    (0..num_lines).map(move |line| start + line * LINESIZE)
}

/// Cleans D-cache by address.
///
/// Writes back every cache line containing any of the `size` bytes starting at
/// `addr`. Call this after the CPU has produced data, and before the DMA engine
/// reads it.
pub fn clean_dcache_by_address(addr: usize, size: usize) {
    if size == 0 {
        return;
    }
    for line in lines(addr, size) {
        dc_cvac(line);
    }
    barrier();
}

/// Cleans and invalidates D-cache by address.
///
/// Call this after the DMA engine has produced data, and before the CPU reads
/// it. Lines that are dirty are written back first.
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    if size == 0 {
        return;
    }
    for line in lines(addr, size) {
        dc_civac(line);
    }
    barrier();
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn dc_cvac(line: usize) {
    // Safety: cache maintenance by VA has no effect on memory contents.
    unsafe { core::arch::asm!("dc cvac, {}", in(reg) line, options(nostack, preserves_flags)) };
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn dc_civac(line: usize) {
    // Safety: see dc_cvac.
    unsafe { core::arch::asm!("dc civac, {}", in(reg) line, options(nostack, preserves_flags)) };
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn barrier() {
    use aarch64_cpu::asm::barrier;
    barrier::dsb(barrier::SY);
    barrier::isb(barrier::SY);
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn dc_cvac(_: usize) {}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn dc_civac(_: usize) {}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
