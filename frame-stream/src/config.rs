//! Connection parameters shared by the sender, reader and resender.
//!
//! A [`StreamConfig`] is fixed for the lifetime of an engine.  Every engine
//! constructor calls [`StreamConfig::validate`] before opening anything, so a
//! bad value fails fast with [`StreamError::Config`] and the engine never
//! becomes valid.

use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::packet::{MAX_FRAGMENTS_PER_FRAME, MAX_FRAGMENT_SIZE};

/// Default fragment payload size in bytes.
pub const DEFAULT_PACKET_SIZE: usize = 1000;

/// Immutable parameters of one stream endpoint.
///
/// The sender plays the server role: it binds the server ports and targets
/// the client ports at `client_address`.  The reader plays the client role:
/// it binds the client ports and targets the server ports at
/// `server_address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Host or IP of the sending side.
    pub server_address: String,
    /// Host or IP of the reading side.
    pub client_address: String,
    pub server_stream_port: u16,
    pub server_control_port: u16,
    pub client_stream_port: u16,
    pub client_control_port: u16,
    /// Upper bound on the payload bytes carried by one data packet.
    pub max_packet_size: usize,
    /// Emission cap in bits per second; `0` means unlimited.
    pub max_bitrate: u64,
    /// Hard per-frame deadline; late frames are cancelled, never retried.
    pub max_latency: Duration,
    /// Upper bound on the retransmit interval.
    pub max_network_latency: Duration,
    /// Capacity of the reader's first buffer and of fallback allocations.
    pub initial_buffer_size: usize,
    /// Frames allowed to wait behind the current one on the sender.
    pub frame_queue_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            client_address: "127.0.0.1".to_string(),
            server_stream_port: 5004,
            server_control_port: 5005,
            client_stream_port: 55004,
            client_control_port: 55005,
            max_packet_size: DEFAULT_PACKET_SIZE,
            max_bitrate: 0,
            max_latency: Duration::from_millis(500),
            max_network_latency: Duration::from_millis(200),
            initial_buffer_size: 64 * 1024,
            frame_queue_size: 8,
        }
    }
}

impl StreamConfig {
    /// Check every field that does not need the network.
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_FRAGMENT_SIZE {
            return Err(StreamError::config(format!(
                "max_packet_size must be in 1..={MAX_FRAGMENT_SIZE}, got {}",
                self.max_packet_size
            )));
        }
        if self.max_latency.is_zero() {
            return Err(StreamError::config("max_latency must be > 0"));
        }
        if self.max_network_latency.is_zero() {
            return Err(StreamError::config("max_network_latency must be > 0"));
        }
        if self.max_network_latency > self.max_latency {
            return Err(StreamError::config(format!(
                "max_network_latency ({:?}) must not exceed max_latency ({:?})",
                self.max_network_latency, self.max_latency
            )));
        }
        if self.initial_buffer_size == 0 {
            return Err(StreamError::config("initial_buffer_size must be > 0"));
        }
        if self.frame_queue_size == 0 {
            return Err(StreamError::config("frame_queue_size must be > 0"));
        }
        Ok(())
    }

    /// Largest frame that fits in [`MAX_FRAGMENTS_PER_FRAME`] fragments.
    pub fn max_frame_size(&self) -> usize {
        self.max_packet_size * MAX_FRAGMENTS_PER_FRAME
    }

    /// Number of fragments needed for a frame of `size` bytes.
    pub fn fragments_for(&self, size: usize) -> usize {
        size.div_ceil(self.max_packet_size)
    }
}
