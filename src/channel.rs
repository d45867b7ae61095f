//! Host channels.
//!
//! A `Channel` is the driver's soft state for one of the controller's host
//! channels. It carries the endpoint identity between `open` and `close`, and
//! the progress of at most one transfer. The channel's registers are passed
//! in by the driver; a `Channel` never holds a reference to the register
//! block.

use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::{
    buffer::{self, FallbackBuffer, FALLBACK_CAPACITY},
    cache,
    policy::ChannelStatus,
    ral, Error,
};

/// Largest byte count the HCTSIZ transfer size field holds
const XFERSIZE_MAX: usize = (1 << 19) - 1;
/// Largest packet count the HCTSIZ packet count field holds
const PKTCNT_MAX: usize = (1 << 10) - 1;
/// Largest packet size the HCCHAR MPS field holds
pub(crate) const MPS_MAX: u32 = (1 << 11) - 1;

/// A handle to an open host channel.
///
/// Returned by [`Hcd::open()`](crate::Hcd::open). Handles are plain indexes;
/// the driver checks them on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct ChannelId(u8);

impl ChannelId {
    /// Returns the hardware channel number.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u8> for ChannelId {
    fn from(index: u8) -> Self {
        ChannelId(index)
    }
}

/// Endpoint transfer type.
///
/// The discriminants match the HCCHAR EPTYPE encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u32)]
pub enum Kind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl Kind {
    /// Interrupt and isochronous endpoints use the periodic TX FIFO.
    pub const fn is_periodic(self) -> bool {
        matches!(self, Kind::Isochronous | Kind::Interrupt)
    }
}

impl From<EndpointType> for Kind {
    fn from(ep_type: EndpointType) -> Self {
        match ep_type {
            EndpointType::Control => Kind::Control,
            EndpointType::Isochronous { .. } => Kind::Isochronous,
            EndpointType::Bulk => Kind::Bulk,
            EndpointType::Interrupt => Kind::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Idle,
    Active,
    /// An interrupt poll NAK'd, and waits for its polling interval.
    Deferred,
}

/// Terminating zero-length packet bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Zlp {
    NotNeeded,
    Owed,
    Sent,
}

/// Per-transfer state, reset on every submission
#[derive(Clone, Copy)]
struct Transfer {
    stage: Stage,
    direction: UsbDirection,
    /// What the channel's DMA engine (or the FIFO code) touches
    buffer: *mut u8,
    /// The caller's buffer
    user_buffer: *mut u8,
    requested_length: u32,
    bytes_transferred: u32,
    zlp: Zlp,
    retry_count: u8,
    last_activity: u32,
    using_fallback: bool,
}

impl Transfer {
    const IDLE: Self = Transfer {
        stage: Stage::Idle,
        direction: UsbDirection::Out,
        buffer: core::ptr::null_mut(),
        user_buffer: core::ptr::null_mut(),
        requested_length: 0,
        bytes_transferred: 0,
        zlp: Zlp::NotNeeded,
        retry_count: 0,
        last_activity: 0,
        using_fallback: false,
    };
}

/// Driver state of one host channel.
///
/// Inspect a channel with [`Hcd::channel()`](crate::Hcd::channel).
pub struct Channel {
    index: u8,
    in_use: bool,
    device_address: u8,
    endpoint: EndpointAddress,
    kind: Kind,
    max_packet_size: u16,
    poll_interval_ms: u32,
    last_poll: u32,
    transfer: Transfer,
    fallback: &'static mut FallbackBuffer,
}

impl Channel {
    pub(crate) fn new(index: u8, fallback: &'static mut FallbackBuffer) -> Self {
        Channel {
            index,
            in_use: false,
            device_address: 0,
            endpoint: EndpointAddress::from(0),
            kind: Kind::Control,
            max_packet_size: 0,
            poll_interval_ms: 0,
            last_poll: 0,
            transfer: Transfer::IDLE,
            fallback,
        }
    }

    pub fn id(&self) -> ChannelId {
        ChannelId(self.index)
    }

    /// Indicates if the channel is open.
    pub fn is_open(&self) -> bool {
        self.in_use
    }

    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Polling interval of an interrupt endpoint, in milliseconds.
    pub fn poll_interval_ms(&self) -> u32 {
        self.poll_interval_ms
    }

    /// Indicates if a transfer is in flight.
    ///
    /// A deferred interrupt poll counts as in flight.
    pub fn is_busy(&self) -> bool {
        self.transfer.stage != Stage::Idle
    }

    /// Direction of the current, or last submitted, transfer.
    pub fn direction(&self) -> UsbDirection {
        self.transfer.direction
    }

    /// Bytes moved through the FIFOs so far.
    pub fn bytes_transferred(&self) -> usize {
        self.transfer.bytes_transferred as usize
    }

    pub fn requested_length(&self) -> usize {
        self.transfer.requested_length as usize
    }

    pub fn retry_count(&self) -> u8 {
        self.transfer.retry_count
    }

    /// Indicates if the transfer runs through the channel's fallback buffer.
    pub fn is_using_fallback(&self) -> bool {
        self.transfer.using_fallback
    }

    pub(crate) fn stage(&self) -> Stage {
        self.transfer.stage
    }

    pub(crate) fn zlp(&self) -> Zlp {
        self.transfer.zlp
    }

    pub(crate) fn last_activity(&self) -> u32 {
        self.transfer.last_activity
    }

    pub(crate) fn set_poll_interval(&mut self, ms: u32) {
        self.poll_interval_ms = ms;
    }

    /// Indicates if the interrupt polling interval has passed at `now`.
    pub(crate) fn interval_elapsed(&self, now: u32) -> bool {
        now.wrapping_sub(self.last_poll) >= self.poll_interval_ms
    }

    pub(crate) fn stamp_poll(&mut self, now: u32) {
        self.last_poll = now;
    }

    /// OUT bytes not yet written to a TX FIFO.
    pub(crate) fn bytes_remaining(&self) -> usize {
        if self.transfer.stage == Stage::Active && self.transfer.direction == UsbDirection::Out {
            (self.transfer.requested_length - self.transfer.bytes_transferred) as usize
        } else {
            0
        }
    }

    /// Claim the channel for an endpoint, and program its characteristics.
    pub(crate) fn open(
        &mut self,
        hc: &ral::otg::HostChannel,
        device_address: u8,
        endpoint: EndpointAddress,
        kind: Kind,
        max_packet_size: u16,
        now: u32,
    ) {
        self.in_use = true;
        self.device_address = device_address;
        self.endpoint = endpoint;
        self.kind = kind;
        self.max_packet_size = max_packet_size;
        self.poll_interval_ms = 0;
        self.last_poll = now;
        self.transfer = Transfer::IDLE;

        ral::write_reg!(ral::otg, hc, HCCHAR,
            MPS: u32::from(max_packet_size),
            EPNUM: endpoint.index() as u32,
            EPDIR: endpoint.is_in() as u32,
            EPTYPE: kind as u32,
            DEVADDR: u32::from(device_address)
        );
        ral::write_reg!(ral::otg, hc, HCINTMSK, ChannelStatus::BASIC.bits());
    }

    /// Release the channel. The channel stops, and forgets its transfer.
    pub(crate) fn close(&mut self, hc: &ral::otg::HostChannel) {
        halt(hc);
        ral::write_reg!(ral::otg, hc, HCINT, u32::MAX);
        ral::write_reg!(ral::otg, hc, HCINTMSK, 0);
        self.in_use = false;
        self.device_address = 0;
        self.endpoint = EndpointAddress::from(0);
        self.kind = Kind::Control;
        self.max_packet_size = 0;
        self.poll_interval_ms = 0;
        self.transfer = Transfer::IDLE;
    }

    /// Stop the transfer in flight, if any, and return to idle.
    ///
    /// The interrupt mask is left as is.
    pub(crate) fn abort(&mut self, hc: &ral::otg::HostChannel) {
        halt(hc);
        ral::write_reg!(ral::otg, hc, HCINT, u32::MAX);
        self.cancel();
    }

    /// Forget the transfer in flight, without touching the hardware.
    pub(crate) fn cancel(&mut self) {
        self.transfer = Transfer::IDLE;
    }

    /// Start a transfer.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `length` bytes until
    /// the transfer completes, fails, or is aborted.
    pub(crate) unsafe fn start(
        &mut self,
        hc: &ral::otg::HostChannel,
        buffer: *mut u8,
        length: usize,
        direction: UsbDirection,
        now: u32,
        dma_alias: u32,
    ) -> Result<(), Error> {
        if self.transfer.stage != Stage::Idle {
            return Err(Error::Busy);
        }

        let mps = usize::from(self.max_packet_size.max(1));
        let packets = length.div_ceil(mps).max(1);
        if length > XFERSIZE_MAX || packets > PKTCNT_MAX {
            return Err(Error::TransferTooLarge);
        }

        self.transfer = Transfer {
            direction,
            user_buffer: buffer,
            requested_length: length as u32,
            last_activity: now,
            ..Transfer::IDLE
        };

        let using_fallback = !buffer::is_dma_aligned(buffer);
        let dma = if using_fallback {
            if length > FALLBACK_CAPACITY {
                return Err(Error::BufferTooLargeForFallback);
            }
            if direction == UsbDirection::Out {
                // Safety: caller guarantees the buffer is readable for `length`.
                let src = core::slice::from_raw_parts(buffer, length);
                self.fallback
                    .copy_in(src)
                    .ok_or(Error::BufferTooLargeForFallback)?;
            }
            self.fallback.as_mut_ptr()
        } else {
            buffer
        };

        match direction {
            UsbDirection::Out => cache::clean_dcache_by_address(dma as usize, length),
            // No dirty line may be written back over what the DMA engine stores.
            UsbDirection::In => cache::clean_invalidate_dcache_by_address(dma as usize, length),
        }

        let zlp_owed = direction == UsbDirection::Out && length > 0 && length % mps == 0;

        self.transfer.buffer = dma;
        self.transfer.using_fallback = using_fallback;
        self.transfer.zlp = if zlp_owed { Zlp::Owed } else { Zlp::NotNeeded };
        self.transfer.stage = Stage::Active;

        ral::write_reg!(ral::otg, hc, HCTSIZ,
            XFERSIZE: length as u32,
            PKTCNT: packets as u32,
            PID: 0
        );
        ral::write_reg!(ral::otg, hc, HCDMA, (dma as usize as u32) | dma_alias);
        ral::modify_reg!(ral::otg, hc, HCCHAR,
            EPTYPE: self.kind as u32,
            EPDIR: (direction == UsbDirection::In) as u32
        );
        enable(hc);

        debug!(
            "CH{} START DIR={} LEN={} PKTS={} FALLBACK={}",
            self.index, direction as u8, length, packets, using_fallback
        );
        Ok(())
    }

    /// Re-enable the channel after a NAK or a bus error.
    ///
    /// A retry counts against the retry limit; `counted` is `false` for
    /// interval-paced interrupt polls.
    pub(crate) fn rearm(&mut self, hc: &ral::otg::HostChannel, halt_first: bool, counted: bool, now: u32) {
        if halt_first {
            halt(hc);
        }
        if counted {
            self.transfer.retry_count = self.transfer.retry_count.saturating_add(1);
        }
        self.transfer.stage = Stage::Active;
        self.transfer.last_activity = now;
        enable(hc);
    }

    pub(crate) fn defer(&mut self) {
        self.transfer.stage = Stage::Deferred;
    }

    /// Arm the terminating zero-length packet of an OUT transfer.
    pub(crate) fn send_zero_length_packet(&mut self, hc: &ral::otg::HostChannel, now: u32) {
        ral::write_reg!(ral::otg, hc, HCTSIZ, XFERSIZE: 0, PKTCNT: 1, PID: 0);
        enable(hc);
        self.transfer.zlp = Zlp::Sent;
        self.transfer.last_activity = now;
        trace!("CH{} ZLP", self.index);
    }

    /// Drain one received packet of `byte_count` bytes from `fifo`.
    ///
    /// Bytes that don't fit the transfer are read and dropped. Returns `true`
    /// if the packet ends the transfer: it's short, or the buffer is full.
    pub(crate) fn receive(&mut self, fifo: &ral::otg::Fifo, byte_count: usize, now: u32) -> bool {
        let limit = self.transfer.requested_length as usize;
        let mut offset = self.transfer.bytes_transferred as usize;
        let mut remaining = byte_count;
        while remaining > 0 {
            let word = ral::read_reg!(ral::otg, fifo, DATA).to_le_bytes();
            let take = remaining.min(word.len());
            for &byte in &word[..take] {
                if offset < limit {
                    // Safety: offset is within the transfer's buffer, which
                    // the submitter keeps valid until completion.
                    unsafe { self.transfer.buffer.add(offset).write(byte) };
                    offset += 1;
                }
            }
            remaining -= take;
        }
        self.transfer.bytes_transferred = offset as u32;
        self.transfer.last_activity = now;

        byte_count < usize::from(self.max_packet_size) || offset >= limit
    }

    /// Write outstanding OUT bytes into `fifo`, spending at most `budget` words.
    pub(crate) fn transmit(&mut self, fifo: &ral::otg::Fifo, budget: &mut u32, now: u32) {
        let mut offset = self.transfer.bytes_transferred as usize;
        let limit = self.transfer.requested_length as usize;
        while offset < limit && *budget > 0 {
            let mut word = [0u8; 4];
            let take = (limit - offset).min(word.len());
            for (i, byte) in word[..take].iter_mut().enumerate() {
                // Safety: see receive().
                *byte = unsafe { self.transfer.buffer.add(offset + i).read() };
            }
            ral::write_reg!(ral::otg, fifo, DATA, u32::from_le_bytes(word));
            offset += take;
            *budget -= 1;
        }
        self.transfer.bytes_transferred = offset as u32;
        self.transfer.last_activity = now;
    }

    /// Bytes the channel moved, according to the remaining transfer size.
    pub(crate) fn actual_from_registers(&self, hc: &ral::otg::HostChannel) -> usize {
        let remaining = ral::read_reg!(ral::otg, hc, HCTSIZ, XFERSIZE) as usize;
        self.requested_length().saturating_sub(remaining)
    }

    /// End the transfer, and hand the data back to the caller.
    ///
    /// Returns the reported length, clamped to the requested length.
    pub(crate) fn finish(&mut self, actual_length: usize) -> usize {
        let actual_length = actual_length.min(self.requested_length());
        if self.transfer.direction == UsbDirection::In {
            cache::clean_invalidate_dcache_by_address(self.transfer.buffer as usize, actual_length);
            if self.transfer.using_fallback && actual_length > 0 {
                // Safety: the caller's buffer holds at least requested_length bytes.
                let dst = unsafe {
                    core::slice::from_raw_parts_mut(self.transfer.user_buffer, actual_length)
                };
                // Never fails: using_fallback implies length <= FALLBACK_CAPACITY.
                let _ = self.fallback.copy_out(dst);
            }
        }
        self.transfer = Transfer::IDLE;
        actual_length
    }
}

/// Request a channel halt.
pub(crate) fn halt(hc: &ral::otg::HostChannel) {
    ral::modify_reg!(ral::otg, hc, HCCHAR, CHDIS: 1, CHENA: 0);
}

fn enable(hc: &ral::otg::HostChannel) {
    ral::modify_reg!(ral::otg, hc, HCCHAR, CHDIS: 0, CHENA: 1);
}
