//! A USB host driver for the DesignWare OTG controller of the BCM2837
//!
//! `dwc-otg-hcd` drives the Synopsys DesignWare OTG ("DWC OTG") controller of
//! a Raspberry Pi 3 in host mode. It shares the controller's eight host
//! channels among the endpoints of attached devices, moves data with DMA or
//! through the FIFOs, and retries or times out transfers from the interrupt
//! handler. It's the hardware half of a USB host stack: enumeration, class
//! drivers and scheduling live above it.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`], and supply a [`Clock`]. See their documentation for more
//! information.
//!
//! # Example
//!
//! ```no_run
//! use dwc_otg_hcd::{ChannelMemory, Event, Hcd, SystemTimer};
//! use usb_device::{endpoint::{EndpointAddress, EndpointType}, UsbDirection};
//!
//! # struct Ps;
//! # unsafe impl dwc_otg_hcd::Peripherals for Ps { fn otg(&self) -> *const () { panic!() } }
//! static CHANNEL_MEMORY: ChannelMemory = ChannelMemory::new();
//!
//! # let my_peripherals = Ps;
//! let timer = unsafe { SystemTimer::new(SystemTimer::BCM2837_BASE as *const ()) };
//! let mut hcd = Hcd::new(my_peripherals, &CHANNEL_MEMORY, timer);
//! hcd.initialize().unwrap();
//! hcd.enable_interrupts();
//!
//! #[repr(align(4))]
//! struct Buffer([u8; 64]);
//! let mut buffer = Buffer([0; 64]);
//!
//! loop {
//!     // In your USB interrupt handler...
//!     hcd.service_interrupt();
//!     // ...and from a millisecond tick.
//!     hcd.poll_timeouts();
//!
//!     while let Some(event) = hcd.poll_event() {
//!         match event {
//!             Event::Attach { .. } => {
//!                 hcd.port_reset();
//!                 let ep = EndpointAddress::from_parts(1, UsbDirection::In);
//!                 let channel = hcd.open(1, ep, EndpointType::Bulk, 64).unwrap();
//!                 // Safety: the buffer outlives the transfer.
//!                 unsafe { hcd.submit(channel, buffer.0.as_mut_ptr(), 64, UsbDirection::In) }
//!                     .unwrap();
//!             }
//!             Event::TransferComplete { actual_length, .. } => {
//!                 let data = &buffer.0[..actual_length];
//!                 // ...
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

#![no_std]

// defmt's macros and derives expand to `::defmt` paths.
#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod buffer;
mod cache;
mod channel;
mod driver;
mod error;
mod event;
mod policy;
mod ral;
mod state;
mod timer;

pub use buffer::FALLBACK_CAPACITY;
pub use channel::{Channel, ChannelId, Kind};
pub use driver::{Hcd, Speed, RESET_TIMEOUT_MS};
pub use error::{Error, TransferError};
pub use event::{Event, EVENT_CAPACITY};
pub use state::ChannelMemory;
pub use timer::{Clock, SystemTimer};

/// Number of host channels in the controller
pub const CHANNEL_COUNT: usize = 8;

/// Attempts a transfer gets after a NAK or a bus error, before it fails
pub const MAX_RETRIES: u8 = 3;

/// A transfer with no channel activity for this long fails
pub const TRANSFER_TIMEOUT_MS: u32 = 1000;

/// Buffers must be aligned to this many bytes for the DMA engine to use
/// them directly
pub const DMA_ALIGNMENT: usize = 4;

/// A type that owns the DWC OTG register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// controller's register block. The pointer returned by
/// [`otg()`](Peripherals::otg) is assumed to be valid for the life of the
/// program, and will be cast to a register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` for the BCM2837, where the
/// controller is mapped at `0x3F98_0000`, and where the DMA engine sees SDRAM
/// through the uncached `0xC000_0000` bus alias.
///
/// ```
/// use core::sync::atomic::{AtomicBool, Ordering};
/// use dwc_otg_hcd::Peripherals;
///
/// struct Otg(());
///
/// impl Otg {
///     /// Returns `None` if the controller is already taken
///     fn take() -> Option<Otg> {
///         static TAKEN: AtomicBool = AtomicBool::new(false);
///         (!TAKEN.swap(true, Ordering::SeqCst)).then(|| Otg(()))
///     }
/// }
///
/// unsafe impl Peripherals for Otg {
///     fn otg(&self) -> *const () {
///         0x3F98_0000 as *const ()
///     }
///     fn dma_alias(&self) -> u32 {
///         0xC000_0000
///     }
/// }
///
/// let otg = Otg::take().unwrap();
/// assert_eq!(otg.otg(), 0x3F98_0000 as *const ());
/// assert!(Otg::take().is_none());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the DWC OTG registers
    fn otg(&self) -> *const ();
    /// Returns the bits OR-ed into every address handed to the DMA engine
    ///
    /// The default is no alias.
    fn dma_alias(&self) -> u32 {
        0
    }
}
