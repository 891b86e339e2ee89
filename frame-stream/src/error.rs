//! Error taxonomy for the streaming engines.
//!
//! Only [`StreamError::Config`] is fatal to engine creation.  Everything else
//! is recovered at frame or packet granularity: the engine logs it, reports
//! the affected frame through the consumer callback when one is involved, and
//! keeps running.

use thiserror::Error;

use crate::buffer::FrameBuffer;
use crate::packet::PacketError;
use crate::transport::TransportError;

/// Errors surfaced by the streaming engines.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid construction parameters; the engine never becomes valid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An argument passed to an operation is unusable (e.g. an empty frame).
    #[error("bad parameters: {0}")]
    BadParameters(String),

    /// The frame needs more fragments than a single frame may carry.
    #[error("frame of {size} bytes exceeds the maximum frame size of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// The sender's waiting-frame queue has no free slot.
    #[error("frame queue is full")]
    QueueFull,

    /// A packet referenced a frame or fragment the engine does not own.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A reader cause value outside the closed set was decoded.
    #[error("unknown reader cause value {0}")]
    UnknownCause(u32),

    /// A sender status value outside the closed set was decoded.
    #[error("unknown sender status value {0}")]
    UnknownStatus(u32),

    /// A frame was not fully acknowledged within `max_latency`.
    #[error("frame deadline exceeded")]
    DeadlineExceeded,

    /// `dispose` was called while engine loops are still running.
    #[error("engine loops are still running; call stop() and wait for them to exit")]
    Busy,

    /// The engine was already disposed.
    #[error("engine is no longer valid")]
    Invalid,

    /// Failure in the underlying datagram transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A datagram could not be decoded.
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl StreamError {
    pub fn config(msg: impl Into<String>) -> Self {
        StreamError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        StreamError::ProtocolViolation(msg.into())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// A frame the sender refused to accept, handed back to the caller.
///
/// Ownership of the buffer never stays with the engine on rejection, so the
/// caller can free, reuse or retry it.
#[derive(Debug, Error)]
#[error("frame rejected: {reason}")]
pub struct SendError {
    pub frame: FrameBuffer,
    pub reason: StreamError,
}

impl SendError {
    pub fn new(frame: FrameBuffer, reason: StreamError) -> Self {
        Self { frame, reason }
    }

    /// Recover the rejected frame.
    pub fn into_frame(self) -> FrameBuffer {
        self.frame
    }
}
