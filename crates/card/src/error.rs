//! Error types for the card stack

use thiserror_no_std::Error;

/// Failure of a single SD command.
///
/// Never retried at the transport layer; callers decide.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No response, or a response with a CRC / index / end-bit error.
    #[error("command execution failed")]
    CommandExecution,

    /// The data phase did not finish in time.
    #[error("data transfer timed out")]
    DataTransferTimeout,
}

/// Step of the open sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NegotiationStage {
    /// Host reset, power-up, identification clock, CMD0.
    Reset,
    /// CMD8.
    VoltageCheck,
    /// CMD55 + ACMD41 loop.
    OcrPoll,
    /// CMD2.
    Identify,
    /// CMD3.
    Address,
    /// CMD9.
    CsdRead,
    /// CMD16 (standard capacity only).
    BlockLength,
    /// CMD7.
    Select,
    /// CMD55 + ACMD51.
    ScrRead,
    /// CMD55 + ACMD6.
    BusWidth,
    /// CMD6.
    SwitchFunction,
}

/// Why a negotiation step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NegotiationFailure {
    /// Host controller did not come ready.
    Host,
    /// The command itself failed.
    Transport(TransportError),
    /// The card never reported power-up complete.
    NotReady,
}

/// Card stack error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardError {
    /// Drive index is neither rear (0) nor front (1).
    #[error("invalid drive index")]
    InvalidDrive,

    /// The drive's controller is not open.
    #[error("card not connected")]
    NotConnected,

    /// A block command failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The open sequence failed.
    #[error("card negotiation failed at {stage:?}: {cause:?}")]
    Negotiation {
        /// Failing step.
        stage: NegotiationStage,
        /// Underlying failure.
        cause: NegotiationFailure,
    },

    /// Host controller register access failed.
    #[error("host controller error")]
    Host,

    /// DMA channel could not be programmed or stopped.
    #[error("DMA channel error")]
    Dma,

    /// DMA did not report completion within the wait timeout.
    #[error("DMA completion timed out")]
    DmaTimeout,

    /// Cache flush or invalidate rejected the range.
    #[error("cache maintenance failed")]
    Cache,

    /// Buffer length is not a whole number of blocks.
    #[error("buffer length is not a multiple of the block size")]
    InvalidLength,

    /// Buffer does not start on a cache line.
    #[error("buffer is not cache-line aligned")]
    Misaligned,

    /// Request exceeds what one transaction can carry.
    #[error("too many blocks for one transaction")]
    TooManyBlocks,

    /// Operation not allowed in the drive's current mode.
    #[error("drive is in the wrong mode")]
    ModeConflict,

    /// The volume refused to mount or format.
    #[error("filesystem error")]
    Filesystem,

    /// Every write attempt failed.
    #[error("write failed after all retries")]
    RetriesExhausted,
}

impl From<TransportError> for CardError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl CardError {
    pub(crate) const fn negotiation(stage: NegotiationStage, cause: NegotiationFailure) -> Self {
        Self::Negotiation { stage, cause }
    }
}
