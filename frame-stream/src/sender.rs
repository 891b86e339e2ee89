//! Send-side frame state machine.
//!
//! [`SenderCore`] owns the frames handed to a sender: at most one *current*
//! frame being transmitted plus a bounded FIFO of frames waiting behind it.
//! It decides what to put on the wire, reconciles acks, enforces the per-frame
//! deadline and records the terminal status of every accepted frame.
//!
//! # Protocol contract
//!
//! - Frames are numbered from 1 in acceptance order (`u16`, wrapping).
//! - A frame is cut into fragments of `max_packet_size` bytes, at most
//!   [`MAX_FRAGMENTS_PER_FRAME`] of them.
//! - Each transmission round re-sends only the fragments not yet acked.
//! - The current frame retires with FRAME_SENT once every fragment is acked,
//!   or with FRAME_CANCEL when superseded by a flush or when `max_latency`
//!   elapsed since it was enqueued.
//!
//! ```text
//!   enqueue(flush=false)          enqueue(flush=true)
//!          │                             │ cancels queue + current
//!          ▼                             ▼
//!   ┌─────────────┐  promote  ┌──────────────────┐  all acked  ┌────────────┐
//!   │   queue     │──────────▶│     current      │────────────▶│ FRAME_SENT │
//!   └─────────────┘           └──────────────────┘             └────────────┘
//!          │ deadline                  │ deadline / flush / shutdown
//!          ▼                           ▼
//!                       FRAME_CANCEL
//! ```
//!
//! This module only manages state; all I/O belongs to
//! [`crate::stream_sender::StreamSender`].  Status reports are queued here and
//! drained by the caller so that callbacks never run under the state lock.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::efficiency::EfficiencyEstimator;
use crate::error::{SendError, StreamError};
use crate::packet::{
    flags, AckBitfield, AckPacket, DataHeader, DataPacket, MAX_FRAGMENTS_PER_FRAME,
};
use crate::state::SenderStatus;

/// A frame waiting for the current one to retire.
#[derive(Debug)]
struct QueuedFrame {
    number: u16,
    buffer: FrameBuffer,
    flush: bool,
    enqueued_at: Instant,
}

/// The frame being transmitted.
#[derive(Debug)]
struct InFlight {
    number: u16,
    buffer: FrameBuffer,
    flush: bool,
    enqueued_at: Instant,
    fragments: usize,
    acked: AckBitfield,
    /// Fragments put on the wire, retransmissions included.
    sent: u64,
    rounds: u32,
    last_round_at: Option<Instant>,
}

impl InFlight {
    fn from_queued(frame: QueuedFrame, max_packet_size: usize) -> Self {
        let fragments = frame.buffer.used_size().div_ceil(max_packet_size);
        Self {
            number: frame.number,
            buffer: frame.buffer,
            flush: frame.flush,
            enqueued_at: frame.enqueued_at,
            fragments,
            acked: AckBitfield::new(),
            sent: 0,
            rounds: 0,
            last_round_at: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.acked.all_set(self.fragments)
    }
}

/// Result of feeding one ack into the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack names a frame that is not current.
    Stale,
    /// The ack newly covered this many fragments; the frame is not done.
    Progress(u32),
    /// The current frame is fully acked.  Carries a round-trip sample when
    /// the frame completed in a single round.
    Complete(Option<Duration>),
}

/// One transmission round of the current frame.
#[derive(Debug)]
pub struct Round {
    pub frame_number: u16,
    pub enqueued_at: Instant,
    /// Encoded datagrams, one per unacked fragment.
    pub datagrams: Vec<Vec<u8>>,
}

/// Sender state for one stream.
#[derive(Debug)]
pub struct SenderCore {
    max_packet_size: usize,
    max_latency: Duration,
    queue_capacity: usize,
    queue: VecDeque<QueuedFrame>,
    current: Option<InFlight>,
    next_frame_number: u16,
    efficiency: EfficiencyEstimator,
    reports: VecDeque<(SenderStatus, FrameBuffer)>,
    /// Set once the data loop has exited; nothing is accepted afterwards.
    closed: bool,
}

impl SenderCore {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            max_latency: config.max_latency,
            queue_capacity: config.frame_queue_size,
            queue: VecDeque::with_capacity(config.frame_queue_size),
            current: None,
            next_frame_number: 1,
            efficiency: EfficiencyEstimator::default(),
            reports: VecDeque::new(),
            closed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Enqueue path
    // -----------------------------------------------------------------------

    /// Accept a frame for transmission.
    ///
    /// Returns the number of frames that were waiting before this call.  On
    /// rejection the frame is handed back inside the [`SendError`].
    pub fn enqueue(
        &mut self,
        buffer: FrameBuffer,
        flush: bool,
        now: Instant,
    ) -> Result<usize, SendError> {
        if self.closed {
            return Err(SendError::new(buffer, StreamError::Invalid));
        }
        let size = buffer.used_size();
        if size == 0 {
            return Err(SendError::new(
                buffer,
                StreamError::BadParameters("frame is empty".into()),
            ));
        }
        let max = self.max_packet_size * MAX_FRAGMENTS_PER_FRAME;
        if size > max {
            return Err(SendError::new(buffer, StreamError::FrameTooLarge { size, max }));
        }

        let waiting = self.queue.len();
        if flush {
            if let Some(current) = self.current.take() {
                log::debug!("[sender] frame {} superseded by flush", current.number);
                self.retire(current, SenderStatus::FrameCancel);
            }
            self.cancel_queue();
        } else if self.queue.len() >= self.queue_capacity {
            return Err(SendError::new(buffer, StreamError::QueueFull));
        }

        let frame = QueuedFrame {
            number: self.next_frame_number,
            buffer,
            flush,
            enqueued_at: now,
        };
        self.next_frame_number = self.next_frame_number.wrapping_add(1);
        log::debug!(
            "[sender] accepted frame {} ({size} bytes, flush={flush}, waiting={waiting})",
            frame.number
        );
        self.queue.push_back(frame);
        self.promote();
        Ok(waiting)
    }

    /// Cancel every waiting frame; the current one keeps going.
    pub fn flush_queue(&mut self) -> usize {
        self.cancel_queue()
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    /// Encode the unacked fragments of the current frame.
    ///
    /// Frames past their deadline are cancelled first and never put on the
    /// wire again.  Returns `None` when there is nothing to transmit.
    pub fn next_round(&mut self, now: Instant) -> crate::error::Result<Option<Round>> {
        self.check_deadlines(now);
        let mps = self.max_packet_size;
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };
        if current.is_complete() {
            return Ok(None);
        }

        let frame_flags = if current.flush { flags::FLUSH } else { 0 };
        let bytes = current.buffer.as_slice();
        let mut datagrams = Vec::with_capacity(current.fragments);
        for (index, chunk) in bytes.chunks(mps).enumerate() {
            if current.acked.is_set(index) {
                continue;
            }
            let packet = DataPacket {
                header: DataHeader {
                    frame_number: current.number,
                    flags: frame_flags,
                    // Bounded by MAX_FRAGMENTS_PER_FRAME at enqueue.
                    fragment_index: index as u8,
                    fragments_per_frame: current.fragments as u8,
                },
                payload: chunk,
            };
            datagrams.push(packet.encode()?);
        }

        current.sent += datagrams.len() as u64;
        current.rounds += 1;
        current.last_round_at = Some(now);
        Ok(Some(Round {
            frame_number: current.number,
            enqueued_at: current.enqueued_at,
            datagrams,
        }))
    }

    // -----------------------------------------------------------------------
    // Ack path
    // -----------------------------------------------------------------------

    /// Merge an ack into the current frame.
    pub fn on_ack(&mut self, ack: AckPacket, now: Instant) -> AckOutcome {
        let Some(current) = self.current.as_mut() else {
            return AckOutcome::Stale;
        };
        if current.number != ack.frame_number {
            return AckOutcome::Stale;
        }

        let before = current.acked.count_set();
        current.acked.merge(ack.received);
        let newly = current.acked.count_set() - before;
        if !current.is_complete() {
            return AckOutcome::Progress(newly);
        }

        let rtt = match (current.rounds, current.last_round_at) {
            (1, Some(sent_at)) => Some(now.saturating_duration_since(sent_at)),
            _ => None,
        };
        if let Some(done) = self.current.take() {
            log::debug!(
                "[sender:ack] frame {} sent ({} fragments, {} transmissions)",
                done.number,
                done.fragments,
                done.sent
            );
            self.retire(done, SenderStatus::FrameSent);
        }
        self.promote();
        AckOutcome::Complete(rtt)
    }

    // -----------------------------------------------------------------------
    // Deadlines and shutdown
    // -----------------------------------------------------------------------

    /// Earliest instant at which a frame will exceed `max_latency`.
    pub fn next_deadline(&self) -> Option<Instant> {
        let current = self.current.as_ref().map(|c| c.enqueued_at);
        // The queue is FIFO, so its front is the oldest waiting frame.
        let queued = self.queue.front().map(|q| q.enqueued_at);
        current
            .into_iter()
            .chain(queued)
            .min()
            .map(|t| t + self.max_latency)
    }

    /// Cancel every frame whose deadline passed.  Returns how many.
    pub fn check_deadlines(&mut self, now: Instant) -> usize {
        let max_latency = self.max_latency;
        let expired = |enqueued_at: Instant| now.saturating_duration_since(enqueued_at) >= max_latency;
        let mut cancelled = 0;

        if self.current.as_ref().is_some_and(|c| expired(c.enqueued_at)) {
            if let Some(late) = self.current.take() {
                log::debug!(
                    "[sender] frame {}: {} ({}/{} fragments acked)",
                    late.number,
                    StreamError::DeadlineExceeded,
                    late.acked.count_set(),
                    late.fragments
                );
                self.retire(late, SenderStatus::FrameCancel);
                cancelled += 1;
            }
        }

        while self.queue.front().is_some_and(|q| expired(q.enqueued_at)) {
            if let Some(late) = self.queue.pop_front() {
                log::debug!(
                    "[sender] waiting frame {}: {}",
                    late.number,
                    StreamError::DeadlineExceeded
                );
                self.reports.push_back((SenderStatus::FrameCancel, late.buffer));
                cancelled += 1;
            }
        }

        self.promote();
        cancelled
    }

    /// Cancel everything and refuse further frames.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.drain_all()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Cancel everything still owned, oldest first.
    pub fn drain_all(&mut self) -> usize {
        let mut cancelled = 0;
        if let Some(current) = self.current.take() {
            self.retire(current, SenderStatus::FrameCancel);
            cancelled += 1;
        }
        cancelled + self.cancel_queue()
    }

    // -----------------------------------------------------------------------
    // Reports and stats
    // -----------------------------------------------------------------------

    /// Next terminal status waiting to be delivered.
    pub fn pop_report(&mut self) -> Option<(SenderStatus, FrameBuffer)> {
        self.reports.pop_front()
    }

    pub fn has_reports(&self) -> bool {
        !self.reports.is_empty()
    }

    pub fn estimated_efficiency(&self) -> f32 {
        self.efficiency.estimate()
    }

    pub fn current_frame(&self) -> Option<u16> {
        self.current.as_ref().map(|c| c.number)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn promote(&mut self) {
        if self.current.is_some() {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            log::debug!("[sender] frame {} is now current", next.number);
            self.current = Some(InFlight::from_queued(next, self.max_packet_size));
        }
    }

    fn cancel_queue(&mut self) -> usize {
        let n = self.queue.len();
        for frame in self.queue.drain(..) {
            self.reports.push_back((SenderStatus::FrameCancel, frame.buffer));
        }
        n
    }

    fn retire(&mut self, frame: InFlight, status: SenderStatus) {
        if frame.sent > 0 {
            self.efficiency
                .record(frame.sent, u64::from(frame.acked.count_set()));
        }
        self.reports.push_back((status, frame.buffer));
    }
}
