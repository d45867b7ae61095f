//! Channel interrupt status, and the retry policy that interprets it
//!
//! The policy is a pure function of the endpoint kind, the channel status,
//! and a little transfer state. The driver applies the resulting [`Action`].

use crate::{channel::Kind, TransferError, MAX_RETRIES};

bitflags::bitflags! {
    /// Host channel interrupt status (HCINT) and mask (HCINTMSK) bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus : u32 {
        const TRANSFER_COMPLETE = 1 << 0;
        const HALTED = 1 << 1;
        const AHB_ERROR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const NYET = 1 << 6;
        const TRANSACTION_ERROR = 1 << 7;
        const BABBLE_ERROR = 1 << 8;
        const FRAME_OVERRUN = 1 << 9;
        const DATA_TOGGLE_ERROR = 1 << 10;
    }
}

impl ChannelStatus {
    /// The interrupts unmasked when a channel opens
    pub const BASIC: Self = Self::TRANSFER_COMPLETE
        .union(Self::HALTED)
        .union(Self::AHB_ERROR)
        .union(Self::STALL)
        .union(Self::NAK)
        .union(Self::ACK)
        .union(Self::TRANSACTION_ERROR)
        .union(Self::BABBLE_ERROR)
        .union(Self::FRAME_OVERRUN);
}

bitflags::bitflags! {
    /// Core interrupt status (GINTSTS) bits serviced by the driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreInterrupts : u32 {
        const RX_FIFO_LEVEL = 1 << 4;
        const NONPERIODIC_TX_EMPTY = 1 << 5;
        const PORT = 1 << 24;
        const HOST_CHANNEL = 1 << 25;
        const PERIODIC_TX_EMPTY = 1 << 26;
    }
}

impl CoreInterrupts {
    pub const TX_EMPTY: Self = Self::NONPERIODIC_TX_EMPTY.union(Self::PERIODIC_TX_EMPTY);
}

/// The one thing a channel interrupt is taken to mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stall,
    BusError(TransferError),
    Complete,
    Nak,
    /// Nothing the policy acts on (ACK, bare halt, ...)
    Other,
}

impl Signal {
    /// Pick the most significant condition in `status`
    ///
    /// A STALL ends the transfer no matter what else happened; bus errors
    /// outrank a completion, and a completion outranks a NAK.
    pub fn classify(status: ChannelStatus) -> Self {
        if status.contains(ChannelStatus::STALL) {
            Signal::Stall
        } else if status.contains(ChannelStatus::TRANSACTION_ERROR) {
            Signal::BusError(TransferError::TransactionError)
        } else if status.contains(ChannelStatus::BABBLE_ERROR) {
            Signal::BusError(TransferError::Babble)
        } else if status.contains(ChannelStatus::FRAME_OVERRUN) {
            Signal::BusError(TransferError::FrameOverrun)
        } else if status.contains(ChannelStatus::TRANSFER_COMPLETE) {
            Signal::Complete
        } else if status.contains(ChannelStatus::NAK) {
            Signal::Nak
        } else {
            Signal::Other
        }
    }
}

/// What the driver should do with the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Action {
    /// Finish the transfer. When `data` is `false`, report zero bytes.
    Complete { success: bool, data: bool },
    /// The data phase is done, but a zero-length packet is still owed.
    SendZeroLengthPacket,
    /// Finish the transfer with an error.
    Fail(TransferError),
    /// Count a retry, and re-enable the channel. If `halt_first`, disable it
    /// before re-enabling.
    Retry { halt_first: bool },
    /// Interrupt endpoint NAK'd before its polling interval elapsed. Leave it
    /// until the interval has passed.
    Defer,
    /// Nothing to do.
    Ignore,
}

/// Transfer state the policy depends on
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub kind: Kind,
    pub retry_count: u8,
    /// An OUT transfer still owes its terminating zero-length packet
    pub zlp_owed: bool,
    /// At least one polling interval elapsed since the last poll
    pub interval_elapsed: bool,
}

impl Context {
    fn retry_or_fail(&self, halt_first: bool, cause: TransferError) -> Action {
        if self.retry_count.saturating_add(1) < MAX_RETRIES {
            Action::Retry { halt_first }
        } else {
            Action::Fail(cause)
        }
    }
}

/// Decide what `signal` means for a transfer described by `cx`
pub fn decide(signal: Signal, cx: &Context) -> Action {
    match (signal, cx.kind) {
        (Signal::Other, _) => Action::Ignore,
        (Signal::Stall, _) => Action::Fail(TransferError::Stall),

        // Loss is acceptable on isochronous pipes; nothing is retried.
        (Signal::BusError(_), Kind::Isochronous) => Action::Complete {
            success: false,
            data: false,
        },
        (Signal::Nak, Kind::Isochronous) => Action::Complete {
            success: true,
            data: false,
        },
        (Signal::BusError(cause), _) => cx.retry_or_fail(true, cause),

        (Signal::Complete, Kind::Control | Kind::Bulk) if cx.zlp_owed => {
            Action::SendZeroLengthPacket
        }
        (Signal::Complete, _) => Action::Complete {
            success: true,
            data: true,
        },

        (Signal::Nak, Kind::Interrupt) if !cx.interval_elapsed => Action::Defer,
        (Signal::Nak, _) => cx.retry_or_fail(false, TransferError::Nak),
    }
}

#[cfg(test)]
mod tests {
    use super::{decide, Action, ChannelStatus, Context, Signal};
    use crate::{channel::Kind, TransferError, MAX_RETRIES};

    const KINDS: [Kind; 4] = [Kind::Control, Kind::Isochronous, Kind::Bulk, Kind::Interrupt];

    fn cx(kind: Kind) -> Context {
        Context {
            kind,
            retry_count: 0,
            zlp_owed: false,
            interval_elapsed: true,
        }
    }

    #[test]
    fn classify_priority() {
        let all = ChannelStatus::STALL
            | ChannelStatus::NAK
            | ChannelStatus::TRANSFER_COMPLETE
            | ChannelStatus::BABBLE_ERROR;
        assert_eq!(Signal::classify(all), Signal::Stall);
        assert_eq!(
            Signal::classify(ChannelStatus::TRANSFER_COMPLETE | ChannelStatus::FRAME_OVERRUN),
            Signal::BusError(TransferError::FrameOverrun)
        );
        assert_eq!(
            Signal::classify(ChannelStatus::TRANSFER_COMPLETE | ChannelStatus::NAK),
            Signal::Complete
        );
        assert_eq!(Signal::classify(ChannelStatus::NAK), Signal::Nak);
        assert_eq!(
            Signal::classify(ChannelStatus::ACK | ChannelStatus::HALTED),
            Signal::Other
        );
    }

    #[test]
    fn stall_is_always_terminal() {
        for kind in KINDS {
            assert_eq!(
                decide(Signal::Stall, &cx(kind)),
                Action::Fail(TransferError::Stall)
            );
        }
    }

    #[test]
    fn isochronous_never_retries() {
        let iso = cx(Kind::Isochronous);
        assert_eq!(
            decide(Signal::Nak, &iso),
            Action::Complete {
                success: true,
                data: false
            }
        );
        for cause in [
            TransferError::TransactionError,
            TransferError::Babble,
            TransferError::FrameOverrun,
        ] {
            assert_eq!(
                decide(Signal::BusError(cause), &iso),
                Action::Complete {
                    success: false,
                    data: false
                }
            );
        }
    }

    #[test]
    fn bulk_nak_retries_until_limit() {
        let mut bulk = cx(Kind::Bulk);
        for retry_count in 0..MAX_RETRIES - 1 {
            bulk.retry_count = retry_count;
            assert_eq!(
                decide(Signal::Nak, &bulk),
                Action::Retry { halt_first: false }
            );
        }
        bulk.retry_count = MAX_RETRIES - 1;
        assert_eq!(
            decide(Signal::Nak, &bulk),
            Action::Fail(TransferError::Nak)
        );
    }

    #[test]
    fn bus_errors_halt_before_retry() {
        let control = cx(Kind::Control);
        assert_eq!(
            decide(Signal::BusError(TransferError::Babble), &control),
            Action::Retry { halt_first: true }
        );
        let exhausted = Context {
            retry_count: MAX_RETRIES - 1,
            ..control
        };
        assert_eq!(
            decide(Signal::BusError(TransferError::Babble), &exhausted),
            Action::Fail(TransferError::Babble)
        );
    }

    #[test]
    fn interrupt_nak_waits_for_interval() {
        let early = Context {
            interval_elapsed: false,
            ..cx(Kind::Interrupt)
        };
        assert_eq!(decide(Signal::Nak, &early), Action::Defer);
        assert_eq!(
            decide(Signal::Nak, &cx(Kind::Interrupt)),
            Action::Retry { halt_first: false }
        );
    }

    #[test]
    fn owed_zlp_delays_completion_for_control_and_bulk() {
        for kind in [Kind::Control, Kind::Bulk] {
            let owed = Context {
                zlp_owed: true,
                ..cx(kind)
            };
            assert_eq!(
                decide(Signal::Complete, &owed),
                Action::SendZeroLengthPacket
            );
        }
        let interrupt = Context {
            zlp_owed: true,
            ..cx(Kind::Interrupt)
        };
        assert_eq!(
            decide(Signal::Complete, &interrupt),
            Action::Complete {
                success: true,
                data: true
            }
        );
    }
}
