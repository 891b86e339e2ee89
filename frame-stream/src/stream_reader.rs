//! Frame reader engine: a [`ReaderCore`] driven by two tokio tasks.
//!
//! ```text
//!   data endpoint ──▶ data task ──on_data──▶ ReaderCore ──events──▶ consumer
//!                        │
//!                        │ ack snapshot + notify
//!                        ▼
//!                     ack task ──every 5 ms / on arrival──▶ control endpoint
//! ```
//!
//! Once the acked frame is complete or discarded its ack can no longer
//! change; the tick then repeats it [`SETTLED_ACK_REPEATS`] times and goes
//! quiet until the next arrival.
//!
//! The data task owns both the core and the consumer, so the consumer runs
//! on one task only and never concurrently with itself.  The ack task only
//! sees a copy of the latest [`AckPacket`].
//!
//! After [`StreamReader::stop`] the data task stops reading, releases its
//! current buffer through CANCEL and exits.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::monitoring::{ReaderMonitor, ReaderMonitoring};
use crate::packet::{AckPacket, DataPacket, DATA_HEADER_LEN};
use crate::receiver::{DataOutcome, ReaderCore, ReaderEvent};
use crate::state::{EngineState, Lifecycle};
use crate::transport::{Transport, TransportChannel};

/// Acks for a known frame go out at least this often.
pub const ACK_INTERVAL: Duration = Duration::from_millis(5);
/// Tick repeats of an ack that can no longer change.
pub const SETTLED_ACK_REPEATS: u32 = 10;
/// Pause after a non-fatal transport error.
const ERROR_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Snapshot {
    ack: Option<AckPacket>,
    settled: bool,
    efficiency: f32,
}

struct Shared {
    snapshot: Mutex<Snapshot>,
    /// A data packet arrived; ack now instead of waiting for the tick.
    arrived: Notify,
    monitor: Mutex<ReaderMonitor>,
}

/// A running frame reader.
pub struct StreamReader {
    shared: Arc<Shared>,
    life: Lifecycle,
}

impl StreamReader {
    /// Validate `config` and spawn the data and ack tasks.
    ///
    /// `initial_buffer` receives the first frame; `consumer` is called for
    /// every [`ReaderEvent`].
    pub fn start<F>(
        config: StreamConfig,
        channel: TransportChannel,
        initial_buffer: FrameBuffer,
        consumer: F,
    ) -> Result<Self>
    where
        F: FnMut(ReaderEvent<'_>) -> Option<FrameBuffer> + Send + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| StreamError::config("StreamReader::start needs a tokio runtime"))?;

        let shared = Arc::new(Shared {
            snapshot: Mutex::new(Snapshot {
                ack: None,
                settled: false,
                efficiency: 1.0,
            }),
            arrived: Notify::new(),
            monitor: Mutex::new(ReaderMonitor::default()),
        });
        let core = ReaderCore::new(&config, initial_buffer);
        let mut life = Lifecycle::new("reader");

        life.track(runtime.spawn(data_loop(
            Arc::clone(&shared),
            core,
            consumer,
            channel.data,
            DATA_HEADER_LEN + config.max_packet_size,
            life.stop_signal(),
        )));
        life.track(runtime.spawn(ack_loop(
            Arc::clone(&shared),
            channel.control,
            life.stop_signal(),
        )));

        log::debug!(
            "[reader] started (packet={} B, buffer={} B)",
            config.max_packet_size,
            config.initial_buffer_size
        );
        Ok(Self { shared, life })
    }

    /// First-time / received fragment ratio over the last frames.
    pub fn estimated_efficiency(&self) -> f32 {
        self.shared.snapshot.lock().efficiency
    }

    /// Receive-side statistics over the last `interval`.
    pub fn monitoring(&self, interval: Duration) -> Result<ReaderMonitoring> {
        self.shared.monitor.lock().report(Instant::now(), interval)
    }

    /// Signal both tasks to exit.  Idempotent, never blocks.
    pub fn stop(&self) {
        self.life.stop();
    }

    /// Wait for both tasks to exit.
    pub async fn join(&mut self) {
        self.life.join().await;
    }

    pub fn is_finished(&self) -> bool {
        self.life.is_finished()
    }

    /// Release the engine; see [`crate::StreamSender::dispose`].
    pub fn dispose(&mut self) -> Result<()> {
        self.life.dispose()
    }

    pub fn is_valid(&self) -> bool {
        self.life.is_valid()
    }

    pub fn state(&self) -> EngineState {
        self.life.state()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn data_loop<F>(
    shared: Arc<Shared>,
    mut core: ReaderCore,
    mut consumer: F,
    data: Arc<dyn Transport>,
    datagram_len: usize,
    mut stop: watch::Receiver<bool>,
) where
    F: FnMut(ReaderEvent<'_>) -> Option<FrameBuffer> + Send,
{
    let mut buf = vec![0u8; datagram_len];

    while !*stop.borrow() {
        let n = tokio::select! {
            _ = stop.changed() => break,
            received = data.recv(&mut buf) => match received {
                Ok(n) => n,
                Err(e) if e.is_fatal() => {
                    log::error!("[reader] data endpoint closed: {e}");
                    let _ = stop.wait_for(|stopped| *stopped).await;
                    break;
                }
                Err(e) => {
                    log::debug!("[reader] recv failed: {e}");
                    sleep(ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let packet = match DataPacket::decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("[reader] dropping malformed packet: {e}");
                continue;
            }
        };
        let header = packet.header;
        shared
            .monitor
            .lock()
            .record(Instant::now(), n, header.frame_number);
        match core.on_data(packet, &mut consumer) {
            Ok(DataOutcome::Stale) => {
                log::debug!("[reader] ← stale fragment of frame {}", header.frame_number);
                continue;
            }
            Ok(DataOutcome::Completed { frame_number, skipped }) => {
                log::debug!("[reader] ← frame {frame_number} complete (skipped {skipped})");
            }
            Ok(outcome) => {
                log::debug!(
                    "[reader] ← frame {} fragment {}/{}: {outcome:?}",
                    header.frame_number,
                    header.fragment_index,
                    header.fragments_per_frame
                );
            }
            Err(e) => {
                log::warn!("[reader] {e}");
                continue;
            }
        }

        {
            let mut snapshot = shared.snapshot.lock();
            snapshot.ack = core.ack_state();
            snapshot.settled = core.frame_settled();
            snapshot.efficiency = core.estimated_efficiency();
        }
        shared.arrived.notify_one();
    }

    core.cancel(&mut consumer);
    log::debug!("[reader] data loop exited");
}

/// Send the latest ack after every arrival and repeat it on every tick.
async fn ack_loop(shared: Arc<Shared>, control: Arc<dyn Transport>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(ACK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<AckPacket> = None;
    let mut repeats = 0u32;

    while !*stop.borrow() {
        tokio::select! {
            _ = stop.changed() => break,
            _ = shared.arrived.notified() => repeats = 0,
            _ = ticker.tick() => {}
        }

        let (ack, settled) = {
            let snapshot = shared.snapshot.lock();
            (snapshot.ack, snapshot.settled)
        };
        let Some(ack) = ack else { continue };
        if last != Some(ack) {
            last = Some(ack);
            repeats = 0;
        }
        if settled {
            if repeats >= SETTLED_ACK_REPEATS {
                continue;
            }
            repeats += 1;
        }
        if let Err(e) = control.send(&ack.encode()).await {
            if e.is_fatal() {
                log::error!("[reader:ack] control endpoint closed: {e}");
                let _ = stop.wait_for(|stopped| *stopped).await;
                break;
            }
            log::debug!("[reader:ack] send failed: {e}");
        }
    }
    log::debug!("[reader:ack] ack loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, DataHeader};
    use crate::simulator::{channel_pair, SimulatorConfig};

    fn config() -> StreamConfig {
        StreamConfig {
            max_packet_size: 100,
            initial_buffer_size: 256,
            ..StreamConfig::default()
        }
    }

    fn fragment(frame_number: u16, index: u8, count: u8, payload: &[u8]) -> Vec<u8> {
        DataPacket {
            header: DataHeader {
                frame_number,
                flags: flags::FLUSH,
                fragment_index: index,
                fragments_per_frame: count,
            },
            payload,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn reassembles_and_acks() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut reader = StreamReader::start(
            config(),
            sim.reader.clone(),
            FrameBuffer::with_capacity(256),
            move |event| match event {
                ReaderEvent::FrameComplete { frame, is_flush, .. } => {
                    let _ = done_tx.send((frame.as_slice().to_vec(), is_flush));
                    Some(FrameBuffer::with_capacity(256))
                }
                _ => None,
            },
        )
        .unwrap();

        sim.sender.data.send(&fragment(1, 1, 2, b"tail")).await.unwrap();
        sim.sender.data.send(&fragment(1, 0, 2, &[7u8; 100])).await.unwrap();

        let (bytes, is_flush) = done_rx.recv().await.unwrap();
        assert_eq!(bytes.len(), 104);
        assert_eq!(&bytes[100..], b"tail");
        assert!(is_flush);

        let mut buf = [0u8; 64];
        let n = sim.sender.control.recv(&mut buf).await.unwrap();
        let ack = AckPacket::decode(&buf[..n]).unwrap();
        assert_eq!(ack.frame_number, 1);

        reader.stop();
        reader.join().await;
        reader.dispose().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn completed_frame_ack_goes_quiet() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut reader = StreamReader::start(
            config(),
            sim.reader.clone(),
            FrameBuffer::with_capacity(256),
            move |event| match event {
                ReaderEvent::FrameComplete { .. } => {
                    let _ = done_tx.send(());
                    Some(FrameBuffer::with_capacity(256))
                }
                _ => None,
            },
        )
        .unwrap();

        sim.sender.data.send(&fragment(1, 0, 1, b"only")).await.unwrap();
        done_rx.recv().await.unwrap();

        sleep(Duration::from_millis(200)).await;
        let acks = sim.ack_stats.sent();
        assert!(acks >= 1);
        assert!(acks <= u64::from(SETTLED_ACK_REPEATS), "{acks} acks");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(sim.ack_stats.sent(), acks);

        // A retransmission means the sender missed them; ack again.
        sim.sender.data.send(&fragment(1, 0, 1, b"only")).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(sim.ack_stats.sent() > acks);

        let monitoring = reader.monitoring(Duration::from_secs(5)).unwrap();
        assert_eq!(monitoring.packets_received, 2);
        assert_eq!(monitoring.frames_missed, 0);

        reader.stop();
        reader.join().await;
        reader.dispose().unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_current_buffer() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let initial = FrameBuffer::with_capacity(64);
        let initial_id = initial.id();
        let mut reader = StreamReader::start(config(), sim.reader.clone(), initial, move |event| {
            if let ReaderEvent::Cancel { buffer } = event {
                let _ = tx.send(buffer.id());
            }
            None
        })
        .unwrap();

        assert!(matches!(reader.dispose(), Err(StreamError::Busy)));
        reader.stop();
        assert_eq!(reader.state(), EngineState::Stopping);
        reader.join().await;
        assert_eq!(rx.recv().await, Some(initial_id));
        reader.dispose().unwrap();
        assert!(!reader.is_valid());
    }

    #[test]
    fn start_outside_runtime_fails() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let result = StreamReader::start(
            config(),
            sim.reader,
            FrameBuffer::with_capacity(8),
            |_event: ReaderEvent<'_>| -> Option<FrameBuffer> { None },
        );
        assert!(matches!(result, Err(StreamError::Config(_))));
    }
}
