//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the engines without depending on actual network conditions, [`SimLink`]
//! implements [`Transport`] over an in-process channel and applies a
//! configurable fault model on every send:
//!
//! | Fault        | Description                                          |
//! |--------------|------------------------------------------------------|
//! | Loss         | Drop a datagram with probability `loss_rate`.        |
//! | Reordering   | Hold a datagram back by `reorder_delay`, letting     |
//! |              | later ones overtake it.                              |
//! | Duplication  | Deliver a datagram twice.                            |
//! | Corruption   | Flip one random byte (caught by the checksum).       |
//!
//! Faults are drawn from a seeded `StdRng`, so a failing run replays exactly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportChannel, TransportError};

/// Configuration for the fault-injection model.
///
/// All probabilities are clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delayed by `reorder_delay`.
    pub reorder_rate: f64,
    pub reorder_delay: Duration,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that one byte of a datagram is flipped.
    pub corrupt_rate: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // Transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Self::default()
        }
    }
}

/// Counters of one link direction.
#[derive(Debug, Default)]
pub struct LinkStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

impl LinkStats {
    /// Datagrams handed to `send`, before any fault.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated.load(Ordering::Relaxed)
    }
}

struct FaultModel {
    config: SimulatorConfig,
    rng: StdRng,
}

impl FaultModel {
    fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    fn roll(&mut self, p: f64) -> bool {
        let p = p.clamp(0.0, 1.0);
        p > 0.0 && self.rng.random_bool(p)
    }
}

/// One end of a simulated link.
pub struct SimLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    faults: Mutex<FaultModel>,
    stats: Arc<LinkStats>,
}

impl SimLink {
    /// Two connected ends.  `a_to_b` faults apply to what `a` sends.
    pub fn pair(a_to_b: SimulatorConfig, b_to_a: SimulatorConfig) -> (SimLink, SimLink) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = SimLink {
            tx: tx_ab,
            rx: tokio::sync::Mutex::new(rx_ba),
            faults: Mutex::new(FaultModel::new(a_to_b)),
            stats: Arc::default(),
        };
        let b = SimLink {
            tx: tx_ba,
            rx: tokio::sync::Mutex::new(rx_ab),
            faults: Mutex::new(FaultModel::new(b_to_a)),
            stats: Arc::default(),
        };
        (a, b)
    }

    /// Counters for datagrams sent from this end.
    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Transport for SimLink {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        // Decide every fault up front; the RNG lock is never held across await.
        let (copies, delay, corrupt_at) = {
            let mut model = self.faults.lock();
            let cfg = model.config.clone();
            if model.roll(cfg.loss_rate) {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            let copies = if model.roll(cfg.duplicate_rate) { 2 } else { 1 };
            let delay = model.roll(cfg.reorder_rate).then_some(cfg.reorder_delay);
            let corrupt_at = (!datagram.is_empty() && model.roll(cfg.corrupt_rate))
                .then(|| model.rng.random_range(0..datagram.len()));
            (copies, delay, corrupt_at)
        };

        let mut bytes = datagram.to_vec();
        if let Some(i) = corrupt_at {
            bytes[i] ^= 0xff;
        }
        if copies == 2 {
            self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
        }

        for _ in 0..copies {
            match delay {
                Some(delay) => {
                    let tx = self.tx.clone();
                    let bytes = bytes.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // Receiver may be gone by now; nothing to report.
                        let _ = tx.send(bytes);
                    });
                }
                None => self
                    .tx
                    .send(bytes.clone())
                    .map_err(|_| TransportError::Closed)?,
            }
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let datagram = self.rx.lock().await.recv().await.ok_or(TransportError::Closed)?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }
}

/// Handles kept by tests to inspect a simulated channel pair.
pub struct SimChannels {
    /// Endpoints for the sending side.
    pub sender: TransportChannel,
    /// Endpoints for the reading side.
    pub reader: TransportChannel,
    /// Data packets leaving the sender.
    pub data_stats: Arc<LinkStats>,
    /// Acks leaving the reader.
    pub ack_stats: Arc<LinkStats>,
}

/// Build a sender/reader channel pair over simulated links.
///
/// `data` faults apply to fragments, `control` faults to acks.
pub fn channel_pair(data: SimulatorConfig, control: SimulatorConfig) -> SimChannels {
    let (data_tx, data_rx) = SimLink::pair(data, SimulatorConfig::default());
    let (ack_rx, ack_tx) = SimLink::pair(SimulatorConfig::default(), control);
    let data_stats = data_tx.stats();
    let ack_stats = ack_tx.stats();
    SimChannels {
        sender: TransportChannel::new(Arc::new(data_tx), Arc::new(ack_rx)),
        reader: TransportChannel::new(Arc::new(data_rx), Arc::new(ack_tx)),
        data_stats,
        ack_stats,
    }
}
