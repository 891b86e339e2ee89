//! `frame-stream` — loss-tolerant, latency-bounded frame streaming over
//! unreliable datagram links.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  data fragments   ┌──────────────┐
//!  │ StreamSender │──────────────────▶│ StreamReader │──▶ consumer
//!  │ (SenderCore) │                   │ (ReaderCore) │
//!  └──────┬───────┘                   └──────┬───────┘
//!         │            ack bitfields         │
//!         │◀─────────────────────────────────┘
//!         │
//!  ┌──────▼───────────────────────────────────┐
//!  │  TransportChannel (data + control)       │
//!  │  UdpEndpoint  │  SimLink (tests)          │
//!  └──────────────────────────────────────────┘
//! ```
//!
//! A frame is either delivered whole within its latency budget or dropped;
//! it is never delivered late or partially.  [`StreamResender`] chains a
//! reader into a sender to relay a stream to a second destination.
//!
//! Each module has a single responsibility:
//! - [`buffer`]        — frame buffers with identity and used size
//! - [`packet`]        — wire format of data fragments and acks
//! - [`state`]         — cause/status codes and engine lifecycle
//! - [`error`]         — error taxonomy
//! - [`config`]        — connection parameters and validation
//! - [`timer`]         — retransmit interval and bitrate pacing
//! - [`efficiency`]    — useful / transmitted ratio over recent frames
//! - [`monitoring`]    — windowed per-datagram link statistics
//! - [`transport`]     — the datagram transport seam
//! - [`socket`]        — UDP transport
//! - [`simulator`]     — in-memory lossy transport for testing
//! - [`sender`]        — sender state machine
//! - [`stream_sender`] — sender engine (tokio tasks)
//! - [`receiver`]      — reassembly state machine
//! - [`stream_reader`] — reader engine (tokio tasks)
//! - [`resender`]      — relay engine

pub mod buffer;
pub mod config;
pub mod efficiency;
pub mod error;
pub mod monitoring;
pub mod packet;
pub mod receiver;
pub mod resender;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream_reader;
pub mod stream_sender;
pub mod timer;
pub mod transport;

pub use buffer::{BufferId, FrameBuffer};
pub use config::StreamConfig;
pub use error::{Result, SendError, StreamError};
pub use monitoring::{ReaderMonitoring, SenderMonitoring};
pub use receiver::ReaderEvent;
pub use resender::StreamResender;
pub use state::{EngineState, ReaderCause, SenderStatus};
pub use stream_reader::StreamReader;
pub use stream_sender::{SenderHandle, StreamSender};
pub use transport::{Role, Transport, TransportChannel, TransportError};
