//! Time sources for the driver.
//!
//! The driver needs a millisecond counter for its transfer timeouts and
//! interrupt polling, and short blocking delays while it resets the core and
//! the port. Supply both with a [`Clock`]. [`SystemTimer`] implements `Clock`
//! over the BCM2837 free-running system timer.
//!
//! ```no_run
//! use dwc_otg_hcd::{Clock, SystemTimer};
//!
//! // Safety: the system timer is mapped at this address on the BCM2837,
//! // and only read by the timer.
//! let timer = unsafe { SystemTimer::new(SystemTimer::BCM2837_BASE as *const ()) };
//! let start = timer.millis();
//! timer.delay_ms(10);
//! assert!(timer.millis().wrapping_sub(start) >= 10);
//! ```

use crate::ral;

/// A millisecond time source.
///
/// `millis` is expected to wrap at `u32::MAX`. The driver only ever compares
/// timestamps with wrapping subtraction.
pub trait Clock {
    /// Returns the current time, in milliseconds.
    fn millis(&self) -> u32;

    /// Block for at least `ms` milliseconds.
    ///
    /// The default implementation spins on [`millis`](Clock::millis).
    fn delay_ms(&self, ms: u32) {
        let start = self.millis();
        while self.millis().wrapping_sub(start) < ms {
            core::hint::spin_loop();
        }
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn millis(&self) -> u32 {
        C::millis(self)
    }
    fn delay_ms(&self, ms: u32) {
        C::delay_ms(self, ms)
    }
}

/// The BCM2837 system timer.
///
/// The timer counts microseconds in a 64-bit counter split across two
/// registers. It never stops, and it needs no configuration.
pub struct SystemTimer {
    systimer: &'static ral::systimer::RegisterBlock,
}

impl SystemTimer {
    /// Physical address of the system timer on the BCM2837.
    pub const BCM2837_BASE: usize = 0x3F00_3000;

    /// Create a timer over the system timer registers at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to the system timer register block. The timer only
    /// reads the counter registers, so several `SystemTimer`s may share one
    /// block.
    pub unsafe fn new(base: *const ()) -> Self {
        Self {
            systimer: &*base.cast(),
        }
    }

    /// Returns the 64-bit microsecond count.
    pub fn micros(&self) -> u64 {
        loop {
            let hi = ral::read_reg!(ral::systimer, self.systimer, CHI);
            let lo = ral::read_reg!(ral::systimer, self.systimer, CLO);
            // CLO may have wrapped between the reads.
            if ral::read_reg!(ral::systimer, self.systimer, CHI) == hi {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }
}

impl Clock for SystemTimer {
    fn millis(&self) -> u32 {
        (self.micros() / 1000) as u32
    }

    fn delay_ms(&self, ms: u32) {
        let until = self.micros() + u64::from(ms) * 1000;
        while self.micros() < until {
            core::hint::spin_loop();
        }
    }
}
