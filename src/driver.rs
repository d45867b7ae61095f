//! The host controller driver
//!
//! `Hcd` owns the controller's register block, the channel table, and the
//! event queue. Every operation takes `&mut self`; the integrator decides
//! where the driver lives so that both the USB interrupt handler and the host
//! stack can reach it.

use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::{
    channel::{self, Channel, ChannelId, Kind, Stage, Zlp, MPS_MAX},
    event::{Event, EventQueue},
    policy::{self, Action, ChannelStatus, CoreInterrupts, Signal},
    ral,
    state::ChannelMemory,
    timer::Clock,
    Error, Peripherals, TransferError, CHANNEL_COUNT, TRANSFER_TIMEOUT_MS,
};

/// How long to wait for the core to go idle, and to finish its soft reset
pub const RESET_TIMEOUT_MS: u32 = 100;
/// The core takes at least 25ms to switch into host mode
const HOST_MODE_SETTLE_MS: u32 = 25;
/// Time for VBUS to stabilize after power on
const PORT_POWER_SETTLE_MS: u32 = 100;
const PORT_RESET_MS: u32 = 50;
const PORT_RESET_RECOVERY_MS: u32 = 10;

/// Receive FIFO depth, in words
const RX_FIFO_WORDS: u32 = 512;
/// Non-periodic transmit FIFO depth, in words
const NPTX_FIFO_WORDS: u32 = 256;
/// Periodic transmit FIFO depth, in words
const PTX_FIFO_WORDS: u32 = 256;
/// GRSTCTL TXFNUM value selecting every transmit FIFO
const ALL_TX_FIFOS: u32 = 0x10;
/// Polls of a FIFO flush bit before giving up on it
const FLUSH_ATTEMPTS: u32 = 16;

/// Speed of the device on the root port.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Speed {
    High,
    Full,
    Low,
}

/// A DWC OTG host controller driver
///
/// After you allocate an `Hcd` with [`new()`](Hcd::new), you must
///
/// - call [`initialize()`](Hcd::initialize) once
/// - call [`enable_interrupts()`](Hcd::enable_interrupts), and route the USB
///   interrupt to [`service_interrupt()`](Hcd::service_interrupt)
/// - call [`poll_timeouts()`](Hcd::poll_timeouts) periodically, about once a
///   millisecond
///
/// Drain [`poll_event()`](Hcd::poll_event) after servicing interrupts and
/// timeouts.
pub struct Hcd<C> {
    otg: &'static ral::otg::RegisterBlock,
    dma_alias: u32,
    clock: C,
    channels: [Channel; CHANNEL_COUNT],
    events: EventQueue,
}

impl<C: Clock> Hcd<C> {
    /// Create a new `Hcd`
    ///
    /// Creation does nothing except assign static memory to the driver.
    /// After creating the driver, call [`initialize()`](Hcd::initialize).
    ///
    /// # Panics
    ///
    /// Panics if the channel memory has already been assigned to another
    /// driver.
    pub fn new<P: Peripherals>(peripherals: P, memory: &'static ChannelMemory, clock: C) -> Self {
        // Safety: Peripherals implementations guarantee that the pointer
        // addresses the controller's registers, owned by this driver.
        let otg = unsafe { &*peripherals.otg().cast::<ral::otg::RegisterBlock>() };
        let buffers = memory.take().expect("Channel memory already assigned");
        let mut index = 0;
        let channels = buffers.map(|fallback| {
            let channel = Channel::new(index, fallback);
            index += 1;
            channel
        });
        Hcd {
            otg,
            dma_alias: peripherals.dma_alias(),
            clock,
            channels,
            events: EventQueue::new(),
        }
    }

    /// Reset the core, and bring it up as a host with the root port powered
    ///
    /// Blocks for a little over 100ms while the port powers up. Returns
    /// [`Error::Timeout`] if the core never goes idle, or never finishes its
    /// soft reset.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.wait_for(|otg| ral::read_reg!(ral::otg, otg, GRSTCTL, AHBIDL == 1))?;
        ral::modify_reg!(ral::otg, self.otg, GRSTCTL, CSFTRST: 1);
        self.wait_for(|otg| ral::read_reg!(ral::otg, otg, GRSTCTL, CSFTRST == 0))?;

        ral::modify_reg!(ral::otg, self.otg, GUSBCFG, FORCEHSTMODE: 1);
        self.clock.delay_ms(HOST_MODE_SETTLE_MS);

        ral::write_reg!(ral::otg, self.otg, GRXFSIZ, RXFDEP: RX_FIFO_WORDS);
        ral::write_reg!(ral::otg, self.otg, GNPTXFSIZ,
            NPTXFSTADDR: RX_FIFO_WORDS,
            NPTXFDEP: NPTX_FIFO_WORDS
        );
        ral::write_reg!(ral::otg, self.otg, HPTXFSIZ,
            PTXFSTADDR: RX_FIFO_WORDS + NPTX_FIFO_WORDS,
            PTXFSIZE: PTX_FIFO_WORDS
        );
        self.flush_fifos();

        ral::write_reg!(ral::otg, self.otg, HCFG, FSLSPCLKSEL: 1);
        ral::modify_reg!(ral::otg, self.otg, GAHBCFG, DMAEN: 1, GLBLINTRMSK: 1);

        self.set_port_power(true);
        self.clock.delay_ms(PORT_POWER_SETTLE_MS);
        debug!("INITIALIZED");
        Ok(())
    }

    /// Wait up to `RESET_TIMEOUT_MS` for `done`
    fn wait_for(&self, done: impl Fn(&ral::otg::RegisterBlock) -> bool) -> Result<(), Error> {
        for _ in 0..RESET_TIMEOUT_MS {
            if done(self.otg) {
                return Ok(());
            }
            self.clock.delay_ms(1);
        }
        if done(self.otg) {
            Ok(())
        } else {
            warn!("Core reset timed out GRSTCTL={:X}", ral::read_reg!(ral::otg, self.otg, GRSTCTL));
            Err(Error::Timeout)
        }
    }

    /// Flush every FIFO. A flush that doesn't finish is logged, and skipped.
    fn flush_fifos(&self) {
        ral::modify_reg!(ral::otg, self.otg, GRSTCTL, TXFNUM: ALL_TX_FIFOS, TXFFLSH: 1);
        if !self.spin_until(|otg| ral::read_reg!(ral::otg, otg, GRSTCTL, TXFFLSH == 0)) {
            warn!("TX FIFO flush did not finish");
        }
        ral::modify_reg!(ral::otg, self.otg, GRSTCTL, RXFFLSH: 1);
        if !self.spin_until(|otg| ral::read_reg!(ral::otg, otg, GRSTCTL, RXFFLSH == 0)) {
            warn!("RX FIFO flush did not finish");
        }
    }

    fn spin_until(&self, done: impl Fn(&ral::otg::RegisterBlock) -> bool) -> bool {
        for _ in 0..FLUSH_ATTEMPTS {
            if done(self.otg) {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    /// Unmask the port, host channel and receive FIFO interrupts
    ///
    /// Transmit FIFO interrupts are unmasked on demand, when an OUT transfer
    /// is submitted.
    pub fn enable_interrupts(&mut self) {
        ral::modify_reg!(ral::otg, self.otg, GINTMSK, PRTINT: 1, HCHINT: 1, RXFLVL: 1);
    }

    /// Mask every controller interrupt
    pub fn disable_interrupts(&mut self) {
        ral::write_reg!(ral::otg, self.otg, GINTMSK, 0);
    }

    /// Returns the current (micro)frame number
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::otg, self.otg, HFNUM, FRNUM) as u16
    }

    /// Indicates if a device is attached to the root port
    pub fn port_connected(&self) -> bool {
        ral::read_reg!(ral::otg, self.otg, HPRT, PRTCONNSTS == 1)
    }

    /// Drive reset on the root port
    ///
    /// Blocks for 60ms: the 50ms reset, and 10ms of recovery.
    pub fn port_reset(&mut self) {
        self.modify_port(ral::otg::HPRT::PRTRST::mask, 0);
        self.clock.delay_ms(PORT_RESET_MS);
        self.modify_port(0, ral::otg::HPRT::PRTRST::mask);
        self.clock.delay_ms(PORT_RESET_RECOVERY_MS);
        debug!("PORT RESET {:?}", self.port_speed());
    }

    /// Returns the speed of the attached device
    pub fn port_speed(&self) -> Speed {
        match ral::read_reg!(ral::otg, self.otg, HPRT, PRTSPD) {
            0 => Speed::High,
            2 => Speed::Low,
            _ => Speed::Full,
        }
    }

    fn set_port_power(&self, on: bool) {
        let power = ral::otg::HPRT::PRTPWR::mask;
        if on {
            self.modify_port(power, 0);
        } else {
            self.modify_port(0, power);
        }
    }

    /// Set and clear HPRT bits, never writing back a pending
    /// write-one-to-clear bit
    fn modify_port(&self, set: u32, clear: u32) {
        ral::modify_reg!(ral::otg, self.otg, HPRT, |hprt| {
            (hprt & !ral::otg::HPRT_W1C & !clear) | set
        });
    }

    /// Claim a free channel for an endpoint of a device
    ///
    /// Returns [`Error::NoFreeChannel`] if all channels are open, and
    /// [`Error::InvalidMaxPacketSize`] if `max_packet_size` doesn't fit the
    /// channel's 11-bit field.
    pub fn open(
        &mut self,
        device_address: u8,
        endpoint: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<ChannelId, Error> {
        if u32::from(max_packet_size) > MPS_MAX {
            warn!("MPS={} exceeds {}", max_packet_size, MPS_MAX);
            return Err(Error::InvalidMaxPacketSize);
        }
        let now = self.clock.millis();
        let Some(channel) = self.channels.iter_mut().find(|channel| !channel.is_open()) else {
            warn!("No free channel for {} EP{}", device_address, endpoint.index());
            return Err(Error::NoFreeChannel);
        };
        let index = channel.id().index();
        channel.open(
            &self.otg.HC[index],
            device_address,
            endpoint,
            Kind::from(ep_type),
            max_packet_size,
            now,
        );
        ral::modify_reg!(ral::otg, self.otg, HAINTMSK, |mask| mask | (1 << index));
        debug!(
            "CH{} OPEN ADDR={} EP{} MPS={}",
            index,
            device_address,
            endpoint.index(),
            max_packet_size
        );
        Ok(channel.id())
    }

    /// Release a channel, cancelling its transfer
    ///
    /// Returns `false`, and does nothing, if the channel isn't open. A
    /// cancelled transfer raises no event.
    pub fn close(&mut self, id: ChannelId) -> bool {
        let otg = self.otg;
        let index = id.index();
        let Some(channel) = self.open_channel_mut(id) else {
            return false;
        };
        channel.close(&otg.HC[index]);
        ral::modify_reg!(ral::otg, otg, HAINTMSK, |mask| mask & !(1 << index));
        debug!("CH{} CLOSE", index);
        true
    }

    /// Start a transfer on an open channel
    ///
    /// The driver raises exactly one [`Event::TransferComplete`] or
    /// [`Event::TransferError`] for the transfer, unless you `abort` or
    /// `close` the channel first. Buffers that aren't DMA aligned are copied
    /// through the channel's fallback buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `length` bytes, and
    /// must not be accessed by anyone else, until the driver raises the
    /// transfer's event or the transfer is aborted or closed.
    pub unsafe fn submit(
        &mut self,
        id: ChannelId,
        buffer: *mut u8,
        length: usize,
        direction: UsbDirection,
    ) -> Result<(), Error> {
        let otg = self.otg;
        let dma_alias = self.dma_alias;
        let now = self.clock.millis();
        let index = id.index();
        let channel = self.open_channel_mut(id).ok_or(Error::InvalidChannel)?;
        channel.start(&otg.HC[index], buffer, length, direction, now, dma_alias)?;

        if direction == UsbDirection::Out {
            if channel.kind().is_periodic() {
                ral::modify_reg!(ral::otg, otg, GINTMSK, PTXFE: 1);
            } else {
                ral::modify_reg!(ral::otg, otg, GINTMSK, NPTXFE: 1);
            }
        }
        Ok(())
    }

    /// Stop the transfer in flight on a channel
    ///
    /// The channel stays open. No event is raised for the aborted transfer.
    /// Returns `false` if the channel isn't open.
    pub fn abort(&mut self, id: ChannelId) -> bool {
        let otg = self.otg;
        let index = id.index();
        let Some(channel) = self.open_channel_mut(id) else {
            return false;
        };
        channel.abort(&otg.HC[index]);
        debug!("CH{} ABORT", index);
        true
    }

    /// Set the polling interval of an interrupt endpoint
    ///
    /// A NAK'd interrupt poll is retried once the interval has passed.
    /// Returns `false` if the channel isn't open.
    pub fn set_poll_interval(&mut self, id: ChannelId, ms: u32) -> bool {
        match self.open_channel_mut(id) {
            Some(channel) => {
                channel.set_poll_interval(ms);
                true
            }
            None => false,
        }
    }

    /// Returns the state of a channel, open or not
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.index())
    }

    /// Returns the oldest queued event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Number of queued events
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Number of events lost because nobody drained the queue
    pub fn dropped_events(&self) -> u32 {
        self.events.dropped()
    }

    fn open_channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels
            .get_mut(id.index())
            .filter(|channel| channel.is_open())
    }

    /// Service the USB interrupt
    ///
    /// Handles, in order, port changes, one received packet, transmit FIFO
    /// space, and host channel status. Drain events with
    /// [`poll_event()`](Hcd::poll_event) afterwards.
    pub fn service_interrupt(&mut self) {
        let now = self.clock.millis();
        let gintsts = ral::read_reg!(ral::otg, self.otg, GINTSTS);
        let gintmsk = ral::read_reg!(ral::otg, self.otg, GINTMSK);
        let pending = gintsts & gintmsk;
        let interrupts = CoreInterrupts::from_bits_truncate(pending);
        trace!("ISR GINTSTS={:X} GINTMSK={:X}", gintsts, gintmsk);

        if interrupts.contains(CoreInterrupts::PORT) {
            self.service_port();
        }
        if interrupts.contains(CoreInterrupts::RX_FIFO_LEVEL) {
            self.service_rx_fifo(now);
        }
        if interrupts.intersects(CoreInterrupts::TX_EMPTY) {
            self.service_tx_fifos(interrupts, now);
        }
        if interrupts.contains(CoreInterrupts::HOST_CHANNEL) {
            self.service_channels(now);
        }

        ral::write_reg!(ral::otg, self.otg, GINTSTS, pending);
    }

    fn service_port(&mut self) {
        use ral::otg::HPRT;

        let hprt = ral::read_reg!(ral::otg, self.otg, HPRT);
        self.ack_port(hprt);
        if hprt & HPRT::PRTOVRCURRCHNG::mask != 0 {
            warn!("PORT OVERCURRENT CHANGE HPRT={:X}", hprt);
        }
        if hprt & HPRT::PRTCONNDET::mask == 0 {
            return;
        }

        if hprt & HPRT::PRTCONNSTS::mask != 0 {
            debug!("PORT ATTACH");
            self.events.push(Event::Attach { port: 0 });
            self.set_port_power(true);
        } else {
            debug!("PORT REMOVE");
            self.events.push(Event::Remove { port: 0 });
            self.set_port_power(false);
            for index in 0..CHANNEL_COUNT {
                self.close(ChannelId::from(index as u8));
            }
        }
    }

    /// Write back the change bits observed in `hprt`, and nothing else
    /// that clears on write
    fn ack_port(&self, hprt: u32) {
        use ral::otg::HPRT;
        let changes = hprt & (HPRT::PRTCONNDET::mask | HPRT::PRTOVRCURRCHNG::mask);
        ral::write_reg!(ral::otg, self.otg, HPRT, (hprt & !ral::otg::HPRT_W1C) | changes);
    }

    /// Pop and handle one receive FIFO status entry
    fn service_rx_fifo(&mut self, now: u32) {
        let (chnum, bcnt, pktsts) = ral::read_reg!(ral::otg, self.otg, GRXSTSP, CHNUM, BCNT, PKTSTS);
        if pktsts != ral::otg::PKTSTS_IN_DATA {
            return;
        }
        let otg = self.otg;
        let index = chnum as usize;
        let byte_count = bcnt as usize;

        match self.channels.get_mut(index) {
            Some(channel)
                if channel.stage() == Stage::Active && channel.direction() == UsbDirection::In =>
            {
                if channel.receive(&otg.FIFO[index], byte_count, now) {
                    let actual_length = channel.bytes_transferred();
                    self.complete(index, actual_length, true, now);
                }
            }
            _ => {
                // Every FIFO window pops the same receive FIFO.
                for _ in 0..byte_count.div_ceil(4) {
                    let _ = ral::read_reg!(ral::otg, &otg.FIFO[0], DATA);
                }
                trace!("CH{} RX DRAINED {}", index, byte_count);
            }
        }
    }

    /// Fill the transmit FIFOs that have room
    fn service_tx_fifos(&mut self, interrupts: CoreInterrupts, now: u32) {
        let otg = self.otg;
        let mut nonperiodic = ral::read_reg!(ral::otg, otg, GNPTXSTS, NPTXFSAVAIL);
        let mut periodic = ral::read_reg!(ral::otg, otg, HPTXSTS, PTXFSAVAIL);

        for (index, channel) in self.channels.iter_mut().enumerate() {
            if channel.stage() != Stage::Active || channel.direction() != UsbDirection::Out {
                continue;
            }
            let (fifo_empty, budget) = if channel.kind().is_periodic() {
                (CoreInterrupts::PERIODIC_TX_EMPTY, &mut periodic)
            } else {
                (CoreInterrupts::NONPERIODIC_TX_EMPTY, &mut nonperiodic)
            };
            if !interrupts.contains(fifo_empty) {
                continue;
            }
            if channel.bytes_remaining() > 0 {
                channel.transmit(&otg.FIFO[index], budget, now);
            }
            if channel.bytes_remaining() == 0 && channel.zlp() == Zlp::Owed {
                channel.send_zero_length_packet(&otg.HC[index], now);
            }
        }

        if self.channels.iter().all(|channel| channel.bytes_remaining() == 0) {
            ral::modify_reg!(ral::otg, otg, GINTMSK, NPTXFE: 0, PTXFE: 0);
        }
    }

    fn service_channels(&mut self, now: u32) {
        let otg = self.otg;
        for (index, hc) in otg.HC.iter().enumerate() {
            let hcint = ral::read_reg!(ral::otg, hc, HCINT);
            if hcint == 0 {
                continue;
            }
            self.service_channel(index, ChannelStatus::from_bits_truncate(hcint), now);
            ral::write_reg!(ral::otg, hc, HCINT, hcint);
        }
    }

    fn service_channel(&mut self, index: usize, status: ChannelStatus, now: u32) {
        let otg = self.otg;
        let hc = &otg.HC[index];
        let channel = &mut self.channels[index];
        if !channel.is_open() || channel.stage() == Stage::Idle {
            trace!("CH{} IDLE STATUS {:X}", index, status.bits());
            return;
        }

        let cx = policy::Context {
            kind: channel.kind(),
            retry_count: channel.retry_count(),
            zlp_owed: channel.zlp() == Zlp::Owed,
            interval_elapsed: channel.interval_elapsed(now),
        };
        let action = policy::decide(Signal::classify(status), &cx);
        trace!("CH{} HCINT={:X} {:?}", index, status.bits(), action);

        match action {
            Action::Ignore => {}
            Action::Complete { success, data } => {
                let actual_length = if data {
                    channel.actual_from_registers(hc)
                } else {
                    0
                };
                self.complete(index, actual_length, success, now);
            }
            Action::SendZeroLengthPacket => channel.send_zero_length_packet(hc, now),
            Action::Fail(cause) => {
                channel::halt(hc);
                channel.cancel();
                self.fail(index, cause);
            }
            Action::Retry { halt_first } => {
                if channel.kind() == Kind::Interrupt {
                    channel.stamp_poll(now);
                }
                channel.rearm(hc, halt_first, true, now);
            }
            Action::Defer => channel.defer(),
        }
    }

    fn complete(&mut self, index: usize, actual_length: usize, success: bool, now: u32) {
        let channel = &mut self.channels[index];
        if channel.kind() == Kind::Interrupt {
            channel.stamp_poll(now);
        }
        let actual_length = channel.finish(actual_length);
        debug!("CH{} COMPLETE LEN={} OK={}", index, actual_length, success);
        self.events.push(Event::TransferComplete {
            channel: channel.id(),
            actual_length,
            success,
        });
    }

    fn fail(&mut self, index: usize, cause: TransferError) {
        warn!("CH{} ERROR {:?}", index, cause);
        self.events.push(Event::TransferError {
            channel: ChannelId::from(index as u8),
            fatal: true,
            cause,
        });
    }

    /// Time out stalled transfers, and re-poll deferred interrupt endpoints
    ///
    /// A transfer with no channel activity for more than
    /// [`TRANSFER_TIMEOUT_MS`] is halted, and raises
    /// [`TransferError::Timeout`]. Call this periodically.
    pub fn poll_timeouts(&mut self) {
        let otg = self.otg;
        let now = self.clock.millis();
        for (index, hc) in otg.HC.iter().enumerate() {
            let channel = &mut self.channels[index];
            match channel.stage() {
                Stage::Idle => {}
                _ if now.wrapping_sub(channel.last_activity()) > TRANSFER_TIMEOUT_MS => {
                    channel::halt(hc);
                    channel.cancel();
                    self.fail(index, TransferError::Timeout);
                }
                Stage::Deferred if channel.interval_elapsed(now) => {
                    channel.stamp_poll(now);
                    channel.rearm(hc, false, false, now);
                    trace!("CH{} POLL", index);
                }
                _ => {}
            }
        }
    }
}
