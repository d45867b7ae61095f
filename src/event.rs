//! Events raised to the host stack

use crate::{channel::ChannelId, TransferError};

/// Something the host stack needs to know about
///
/// The interrupt handler queues events; drain them with
/// [`Hcd::poll_event()`](crate::Hcd::poll_event) after each call to
/// [`Hcd::service_interrupt()`](crate::Hcd::service_interrupt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Event {
    /// A device appeared on the root port.
    Attach { port: u8 },
    /// The device on the root port went away. All channels are closed.
    Remove { port: u8 },
    /// The transfer on `channel` finished.
    ///
    /// Isochronous transfers that fail report `success: false` here,
    /// instead of a [`TransferError`](Event::TransferError).
    TransferComplete {
        channel: ChannelId,
        actual_length: usize,
        success: bool,
    },
    /// The transfer on `channel` failed.
    ///
    /// The channel stays open and idle. Submit again, or close it.
    TransferError {
        channel: ChannelId,
        fatal: bool,
        cause: TransferError,
    },
}

/// Number of events the driver can hold between drains
pub const EVENT_CAPACITY: usize = 32;

/// A fixed-capacity FIFO of events
pub(crate) struct EventQueue {
    events: [Option<Event>; EVENT_CAPACITY],
    head: usize,
    len: usize,
    dropped: u32,
}

impl EventQueue {
    pub const fn new() -> Self {
        EventQueue {
            events: [None; EVENT_CAPACITY],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Queue an event
    ///
    /// If the queue is full, the event is dropped and counted.
    pub fn push(&mut self, event: Event) {
        if self.len == EVENT_CAPACITY {
            self.dropped = self.dropped.wrapping_add(1);
            warn!("Event queue full; dropped {:?}", event);
            return;
        }
        let tail = (self.head + self.len) % EVENT_CAPACITY;
        self.events[tail] = Some(event);
        self.len += 1;
    }

    /// Remove the oldest event
    pub fn pop(&mut self) -> Option<Event> {
        if self.len == 0 {
            return None;
        }
        let event = self.events[self.head].take();
        self.head = (self.head + 1) % EVENT_CAPACITY;
        self.len -= 1;
        event
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of events lost to a full queue
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
