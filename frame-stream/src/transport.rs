//! Datagram transport contract consumed by the engines.
//!
//! ```text
//!   StreamSender                              StreamReader
//!  ┌────────────┐   data endpoint (frags)    ┌────────────┐
//!  │ data loop  │───────────────────────────▶│ data loop  │
//!  │            │                            │            │
//!  │ ack loop   │◀───────────────────────────│ ack loop   │
//!  └────────────┘  control endpoint (acks)   └────────────┘
//! ```
//!
//! A [`Transport`] is one unreliable, connected datagram endpoint: every
//! `send` goes to the fixed peer, every `recv` yields one whole datagram or an
//! error.  Loss, duplication and reordering are all allowed.  A
//! [`TransportChannel`] pairs the data endpoint with the control endpoint.
//!
//! Implementations: [`crate::socket::UdpEndpoint`] (UDP) and
//! [`crate::simulator::SimLink`] (in-memory, fault-injecting).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StreamConfig;
use crate::socket::UdpEndpoint;

/// Errors raised by a datagram endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O error from the OS.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An endpoint address could not be resolved.
    #[error("cannot resolve address {0}")]
    Resolve(String),
    /// The peer end is gone and nothing more will ever arrive.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the operation can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// One unreliable datagram endpoint connected to a fixed peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the peer.
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Receive one datagram into `buf` and return its length.
    ///
    /// Datagrams longer than `buf` are truncated.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Which side of a stream an endpoint pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds the server ports and targets the client.
    Sender,
    /// Binds the client ports and targets the server.
    Reader,
}

/// The data + control endpoint pair used by one engine.
#[derive(Clone)]
pub struct TransportChannel {
    pub data: Arc<dyn Transport>,
    pub control: Arc<dyn Transport>,
}

impl TransportChannel {
    pub fn new(data: Arc<dyn Transport>, control: Arc<dyn Transport>) -> Self {
        Self { data, control }
    }

    /// Open both UDP endpoints for `role` from the configured addresses.
    pub async fn open_udp(config: &StreamConfig, role: Role) -> crate::error::Result<Self> {
        let data = open_data_endpoint(config, role).await?;
        let control = open_control_endpoint(config, role).await?;
        Ok(Self::new(Arc::new(data), Arc::new(control)))
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel").finish_non_exhaustive()
    }
}

/// Data endpoint: frames travel server stream port → client stream port.
pub async fn open_data_endpoint(
    config: &StreamConfig,
    role: Role,
) -> Result<UdpEndpoint, TransportError> {
    match role {
        Role::Sender => {
            UdpEndpoint::open(
                config.server_stream_port,
                &config.client_address,
                config.client_stream_port,
            )
            .await
        }
        Role::Reader => {
            UdpEndpoint::open(
                config.client_stream_port,
                &config.server_address,
                config.server_stream_port,
            )
            .await
        }
    }
}

/// Control endpoint: acks travel client control port → server control port.
pub async fn open_control_endpoint(
    config: &StreamConfig,
    role: Role,
) -> Result<UdpEndpoint, TransportError> {
    match role {
        Role::Sender => {
            UdpEndpoint::open(
                config.server_control_port,
                &config.client_address,
                config.client_control_port,
            )
            .await
        }
        Role::Reader => {
            UdpEndpoint::open(
                config.client_control_port,
                &config.server_address,
                config.server_control_port,
            )
            .await
        }
    }
}
