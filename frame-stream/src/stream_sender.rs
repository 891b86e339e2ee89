//! Frame sender engine: a [`SenderCore`] driven by two tokio tasks.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ enqueue(frame, flush)                 listener(status, frame)
//!      ▼                                               ▲
//!  ┌──────────────────────── Arc<Shared> ──────────────┴───────┐
//!  │  Mutex<SenderCore>   Notify ×2 (wake)  Mutex<RetransmitTimer> │
//!  └─────┬───────────────────────────────────────────┬───────────┘
//!        │ data task                                 │ ack task
//!        │  next_round → pace → send                 │  recv ack → on_ack
//!        │  sleep(retransmit interval) | wake | stop │  deadline check
//!        ▼                                           ▼
//!   data endpoint ─────────▶ reader        control endpoint ◀─── reader
//! ```
//!
//! The listener is called in the order statuses are decided, never
//! concurrently with itself and never while the core is locked, so it may
//! call [`StreamSender::enqueue`] again (e.g. to recycle the buffer).
//!
//! # Shutdown
//!
//! [`StreamSender::stop`] signals both tasks.  When the data task exits it
//! reports FRAME_CANCEL for every frame still owned, so each accepted frame
//! ends with exactly one status.  [`StreamSender::dispose`] fails with
//! [`StreamError::Busy`] until both tasks have finished.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::error::{Result, SendError, StreamError};
use crate::monitoring::{SenderMonitor, SenderMonitoring};
use crate::packet::{AckPacket, ACK_PACKET_LEN};
use crate::sender::{AckOutcome, SenderCore};
use crate::state::{EngineState, Lifecycle, SenderStatus};
use crate::timer::{RatePacer, RetransmitTimer};
use crate::transport::{Transport, TransportChannel};

/// Callback receiving the terminal status of every accepted frame.
pub type StatusListener = Box<dyn FnMut(SenderStatus, FrameBuffer) + Send>;

/// How long the ack task sleeps when no frame has a deadline.
const IDLE_TICK: Duration = Duration::from_millis(100);
/// Pause after a non-fatal transport error.
const ERROR_BACKOFF: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    core: Mutex<SenderCore>,
    listener: Mutex<StatusListener>,
    timer: Mutex<RetransmitTimer>,
    /// Wakes the data task: new current frame, or the current one retired.
    wake: Notify,
    /// Wakes the ack task: a new frame brings a deadline it has not seen.
    deadlines: Notify,
    monitor: Mutex<SenderMonitor>,
}

impl Shared {
    /// Hand queued statuses to the listener.
    ///
    /// Whoever holds the listener lock delivers; everyone else leaves their
    /// reports behind for it.  The re-check after unlocking closes the gap
    /// between the holder's last pop and its release.
    fn deliver_reports(&self) {
        loop {
            {
                let Some(mut listener) = self.listener.try_lock() else {
                    return;
                };
                loop {
                    // The core guard must drop before the callback runs.
                    let next = self.core.lock().pop_report();
                    let Some((status, frame)) = next else { break };
                    log::debug!("[sender] {status} for {}", frame.id());
                    if status == SenderStatus::FrameCancel {
                        self.monitor
                            .lock()
                            .record_dropped(Instant::now(), frame.used_size());
                    }
                    let callback: &mut StatusListener = &mut listener;
                    callback(status, frame);
                }
            }
            if !self.core.lock().has_reports() {
                return;
            }
        }
    }

    fn enqueue(&self, frame: FrameBuffer, flush: bool) -> std::result::Result<usize, SendError> {
        let result = self.core.lock().enqueue(frame, flush, Instant::now());
        if result.is_ok() {
            self.wake.notify_one();
            self.deadlines.notify_one();
        }
        self.deliver_reports();
        result
    }

    fn flush_queue(&self) -> usize {
        let n = self.core.lock().flush_queue();
        self.deliver_reports();
        n
    }
}

// ---------------------------------------------------------------------------
// StreamSender
// ---------------------------------------------------------------------------

/// A running frame sender.
pub struct StreamSender {
    shared: Arc<Shared>,
    life: Lifecycle,
}

impl StreamSender {
    /// Validate `config` and spawn the data and ack tasks on the current
    /// tokio runtime.
    pub fn start<F>(config: StreamConfig, channel: TransportChannel, listener: F) -> Result<Self>
    where
        F: FnMut(SenderStatus, FrameBuffer) + Send + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| StreamError::config("StreamSender::start needs a tokio runtime"))?;

        let shared = Arc::new(Shared {
            core: Mutex::new(SenderCore::new(&config)),
            listener: Mutex::new(Box::new(listener)),
            timer: Mutex::new(RetransmitTimer::new(config.max_network_latency)),
            wake: Notify::new(),
            deadlines: Notify::new(),
            monitor: Mutex::new(SenderMonitor::default()),
        });
        let mut life = Lifecycle::new("sender");

        life.track(runtime.spawn(data_loop(
            Arc::clone(&shared),
            channel.data,
            life.stop_signal(),
            config.max_bitrate,
        )));
        life.track(runtime.spawn(ack_loop(
            Arc::clone(&shared),
            channel.control,
            life.stop_signal(),
        )));

        log::debug!(
            "[sender] started (packet={} B, latency={:?}, network latency={:?})",
            config.max_packet_size,
            config.max_latency,
            config.max_network_latency
        );
        Ok(Self { shared, life })
    }

    /// Hand a frame to the sender.
    ///
    /// Returns how many frames were already waiting.  With `flush = true`
    /// every waiting frame and the current one are cancelled first.  On
    /// rejection the frame comes back inside the error.
    pub fn enqueue(&self, frame: FrameBuffer, flush: bool) -> std::result::Result<usize, SendError> {
        if !self.life.is_valid() {
            return Err(SendError::new(frame, StreamError::Invalid));
        }
        self.shared.enqueue(frame, flush)
    }

    /// Cancel every waiting frame.  Returns how many were cancelled.
    pub fn flush_queue(&self) -> usize {
        self.shared.flush_queue()
    }

    /// A cloneable handle for enqueueing from other tasks.
    pub fn handle(&self) -> SenderHandle {
        SenderHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Useful / transmitted fragment ratio over the last frames.
    pub fn estimated_efficiency(&self) -> f32 {
        self.shared.core.lock().estimated_efficiency()
    }

    /// Send-side statistics over the last `interval`.
    pub fn monitoring(&self, interval: Duration) -> Result<SenderMonitoring> {
        self.shared.monitor.lock().report(Instant::now(), interval)
    }

    /// Current retransmit interval.
    pub fn retransmit_interval(&self) -> Duration {
        self.shared.timer.lock().interval()
    }

    /// Signal both tasks to exit.  Idempotent, never blocks.
    pub fn stop(&self) {
        self.life.stop();
    }

    /// Wait for both tasks to exit.
    pub async fn join(&mut self) {
        self.life.join().await;
    }

    /// Whether both tasks have exited.
    pub fn is_finished(&self) -> bool {
        self.life.is_finished()
    }

    /// Release the engine.  Fails with [`StreamError::Busy`] while a task is
    /// still running and with [`StreamError::Invalid`] if already disposed.
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

/// Enqueue side of a [`StreamSender`].
///
/// Once the sender's data task has exited every enqueue is rejected with
/// [`StreamError::Invalid`].
#[derive(Clone)]
pub struct SenderHandle {
    shared: Arc<Shared>,
}

impl SenderHandle {
    /// See [`StreamSender::enqueue`].
    pub fn enqueue(&self, frame: FrameBuffer, flush: bool) -> std::result::Result<usize, SendError> {
        self.shared.enqueue(frame, flush)
    }

    pub fn flush_queue(&self) -> usize {
        self.shared.flush_queue()
    }

    pub fn estimated_efficiency(&self) -> f32 {
        self.shared.core.lock().estimated_efficiency()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Transmit the current frame round after round until it retires.
async fn data_loop(
    shared: Arc<Shared>,
    data: Arc<dyn Transport>,
    mut stop: watch::Receiver<bool>,
    max_bitrate: u64,
) {
    let mut pacer = RatePacer::new(max_bitrate);

    'run: while !*stop.borrow() {
        let round = shared.core.lock().next_round(Instant::now());
        // Frames that expired on the way are reported right away.
        shared.deliver_reports();
        let round = match round {
            Ok(round) => round,
            Err(e) => {
                log::error!("[sender] cannot encode fragment: {e}");
                None
            }
        };

        let Some(round) = round else {
            tokio::select! {
                _ = stop.changed() => break 'run,
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        for datagram in &round.datagrams {
            // Stop as soon as the frame retired (acked, flushed or expired).
            if shared.core.lock().current_frame() != Some(round.frame_number) {
                break;
            }
            let wait = pacer.reserve(datagram.len(), Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    _ = stop.changed() => break 'run,
                    _ = sleep(wait) => {}
                }
            }
            match data.send(datagram).await {
                Ok(()) => {
                    shared
                        .monitor
                        .lock()
                        .record_sent(Instant::now(), datagram.len(), round.enqueued_at);
                }
                Err(e) if e.is_fatal() => {
                    log::error!("[sender] data endpoint closed: {e}");
                    let _ = stop.wait_for(|stopped| *stopped).await;
                    break 'run;
                }
                Err(e) => log::warn!("[sender] send failed: {e}"),
            }
        }
        log::debug!(
            "[sender] → frame {} ({} fragments)",
            round.frame_number,
            round.datagrams.len()
        );

        let interval = shared.timer.lock().interval();
        tokio::select! {
            _ = stop.changed() => break 'run,
            _ = shared.wake.notified() => {}
            _ = sleep(interval) => {}
        }
    }

    let cancelled = shared.core.lock().close();
    if cancelled > 0 {
        log::debug!("[sender] cancelled {cancelled} frame(s) on shutdown");
    }
    shared.deliver_reports();
    log::debug!("[sender] data loop exited");
}

/// Consume acks and enforce frame deadlines.
async fn ack_loop(shared: Arc<Shared>, control: Arc<dyn Transport>, mut stop: watch::Receiver<bool>) {
    let mut buf = [0u8; ACK_PACKET_LEN * 4];

    while !*stop.borrow() {
        let deadline = shared
            .core
            .lock()
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_TICK);

        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep_until(deadline) => {}
            _ = shared.deadlines.notified() => {}
            received = control.recv(&mut buf) => match received {
                Ok(n) => {
                    if let Err(e) = handle_ack(&shared, &buf[..n]) {
                        log::warn!("[sender:ack] dropping malformed ack: {e}");
                    }
                }
                Err(e) if e.is_fatal() => {
                    log::error!("[sender:ack] control endpoint closed: {e}");
                    let _ = stop.wait_for(|stopped| *stopped).await;
                    break;
                }
                Err(e) => {
                    log::debug!("[sender:ack] recv failed: {e}");
                    sleep(ERROR_BACKOFF).await;
                }
            },
        }

        let expired = shared.core.lock().check_deadlines(Instant::now());
        if expired > 0 {
            shared.wake.notify_one();
        }
        shared.deliver_reports();
    }
    log::debug!("[sender:ack] ack loop exited");
}

fn handle_ack(shared: &Shared, datagram: &[u8]) -> Result<()> {
    let ack = AckPacket::decode(datagram)?;
    let outcome = shared.core.lock().on_ack(ack, Instant::now());
    match outcome {
        AckOutcome::Stale => {
            log::debug!("[sender:ack] ← stale ack for frame {}", ack.frame_number);
        }
        AckOutcome::Progress(newly) => {
            log::debug!(
                "[sender:ack] ← frame {} +{newly} ({} acked)",
                ack.frame_number,
                ack.received.count_set()
            );
        }
        AckOutcome::Complete(rtt) => {
            if let Some(rtt) = rtt {
                shared.timer.lock().record_rtt_sample(rtt);
            }
            shared.wake.notify_one();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{channel_pair, SimulatorConfig};

    fn config() -> StreamConfig {
        StreamConfig {
            max_packet_size: 100,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn start_outside_runtime_fails() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let result = StreamSender::start(config(), sim.sender, |_, _| {});
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn stop_cancels_unacknowledged_frames() {
        // Nobody acks, so both frames are still owned when stop arrives.
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sender = StreamSender::start(config(), sim.sender.clone(), move |status, frame| {
            let _ = tx.send((status, frame.id()));
        })
        .unwrap();

        let first = FrameBuffer::from_vec(vec![1u8; 250]);
        let second = FrameBuffer::from_vec(vec![2u8; 50]);
        let ids = [first.id(), second.id()];
        assert_eq!(sender.enqueue(first, false).unwrap(), 0);
        sender.enqueue(second, false).unwrap();

        assert!(matches!(sender.dispose(), Err(StreamError::Busy)));
        sender.stop();
        sender.join().await;
        for id in ids {
            assert_eq!(rx.recv().await, Some((SenderStatus::FrameCancel, id)));
        }
        sender.dispose().unwrap();
        assert_eq!(sender.state(), EngineState::Disposed);

        let late = sender.enqueue(FrameBuffer::from_vec(vec![3u8; 10]), false);
        assert!(matches!(late, Err(SendError { reason: StreamError::Invalid, .. })));
    }

    #[tokio::test]
    async fn handle_rejects_after_shutdown() {
        let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
        let mut sender = StreamSender::start(config(), sim.sender.clone(), |_, _| {}).unwrap();
        let handle = sender.handle();
        sender.stop();
        sender.join().await;

        let err = handle
            .enqueue(FrameBuffer::from_vec(vec![0u8; 10]), true)
            .unwrap_err();
        assert!(matches!(err.reason, StreamError::Invalid));
        assert_eq!(err.into_frame().used_size(), 10);
        sender.dispose().unwrap();
    }
}
