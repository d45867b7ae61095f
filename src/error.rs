//! Driver errors

use core::fmt;

/// Errors returned synchronously by driver calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// Every host channel is open.
    ///
    /// Retry after closing a channel, or fail the request.
    NoFreeChannel,
    /// The channel handle is out of range, or the channel isn't open.
    InvalidChannel,
    /// The channel already has a transfer in flight.
    Busy,
    /// The buffer isn't DMA aligned, and it's larger than the channel's
    /// fallback buffer.
    BufferTooLargeForFallback,
    /// The maximum packet size doesn't fit the channel characteristics.
    InvalidMaxPacketSize,
    /// The transfer exceeds what one channel can describe in its transfer
    /// size and packet count fields.
    TransferTooLarge,
    /// The controller didn't respond in time.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NoFreeChannel => "no free host channel",
            Error::InvalidChannel => "invalid or closed host channel",
            Error::Busy => "host channel has a transfer in flight",
            Error::BufferTooLargeForFallback => "unaligned buffer exceeds the fallback buffer",
            Error::InvalidMaxPacketSize => "max packet size exceeds 2047 bytes",
            Error::TransferTooLarge => "transfer exceeds the channel transfer size",
            Error::Timeout => "controller timed out",
        };
        f.write_str(msg)
    }
}

/// Why a transfer failed
///
/// Carried by [`Event::TransferError`](crate::Event::TransferError).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferError {
    /// The device answered with a STALL handshake.
    Stall,
    /// CRC, timeout, bit stuff or PID errors, after all retries.
    TransactionError,
    /// The device sent more data than the channel expected, after all retries.
    Babble,
    /// The transaction didn't fit in its frame, after all retries.
    FrameOverrun,
    /// The device kept answering NAK.
    Nak,
    /// No channel activity within the transfer timeout.
    Timeout,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransferError::Stall => "endpoint stalled",
            TransferError::TransactionError => "transaction error",
            TransferError::Babble => "babble",
            TransferError::FrameOverrun => "frame overrun",
            TransferError::Nak => "too many NAKs",
            TransferError::Timeout => "transfer timed out",
        };
        f.write_str(msg)
    }
}
