//! Relay: a [`StreamReader`] whose completed frames feed a [`StreamSender`].
//!
//! ```text
//!   source ──▶ ingress reader ──FRAME_COMPLETE──▶ egress sender ──▶ destination
//!                   ▲                                   │
//!                   │ next buffer          FRAME_SENT / │
//!                   └──────── BufferPool ◀── FRAME_CANCEL┘
//! ```
//!
//! Frames are moved from one leg to the other, never copied.  Each leg keeps
//! its own acks, retransmissions and efficiency; four tasks in total.  A
//! frame the egress leg refuses (queue full, too large for its packet size)
//! goes straight back to the pool and is lost for the destination only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::monitoring::{ReaderMonitoring, SenderMonitoring};
use crate::receiver::ReaderEvent;
use crate::state::EngineState;
use crate::stream_reader::StreamReader;
use crate::stream_sender::{SenderHandle, StreamSender};
use crate::transport::TransportChannel;

/// Free buffers shared by both legs.
#[derive(Debug)]
struct BufferPool {
    buffers: Vec<FrameBuffer>,
    limit: usize,
    buffer_size: usize,
}

impl BufferPool {
    fn new(limit: usize, buffer_size: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(limit),
            limit,
            buffer_size,
        }
    }

    /// A pooled buffer of at least `min` bytes, or a fresh one.
    fn take(&mut self, min: usize) -> FrameBuffer {
        match self.buffers.iter().position(|b| b.capacity() >= min) {
            Some(i) => self.buffers.swap_remove(i),
            None => FrameBuffer::with_capacity(min.max(self.buffer_size)),
        }
    }

    fn give(&mut self, mut buffer: FrameBuffer) {
        if self.buffers.len() < self.limit {
            buffer.clear();
            self.buffers.push(buffer);
        }
    }
}

/// A running relay.
pub struct StreamResender {
    reader: StreamReader,
    sender: StreamSender,
    pool: Arc<Mutex<BufferPool>>,
}

impl StreamResender {
    /// Start the egress leg, then the ingress leg that feeds it.
    pub fn start(
        ingress_config: StreamConfig,
        ingress_channel: TransportChannel,
        egress_config: StreamConfig,
        egress_channel: TransportChannel,
    ) -> Result<Self> {
        ingress_config.validate()?;
        egress_config.validate()?;

        // The reader's current buffer, the sender's current and waiting
        // frames, and one spare.
        let limit = egress_config.frame_queue_size + 3;
        let buffer_size = ingress_config.initial_buffer_size;
        let pool = Arc::new(Mutex::new(BufferPool::new(limit, buffer_size)));

        let returned = Arc::clone(&pool);
        let sender = StreamSender::start(egress_config, egress_channel, move |status, frame| {
            log::debug!("[resender] egress {status} for {}", frame.id());
            returned.lock().give(frame);
        })?;

        let consumer = relay_consumer(sender.handle(), Arc::clone(&pool), buffer_size);
        let initial = pool.lock().take(buffer_size);
        let reader = match StreamReader::start(ingress_config, ingress_channel, initial, consumer) {
            Ok(reader) => reader,
            Err(e) => {
                sender.stop();
                return Err(e);
            }
        };

        log::debug!("[resender] started");
        Ok(Self {
            reader,
            sender,
            pool,
        })
    }

    /// Stop both legs and wait for their four tasks.
    pub async fn stop(&mut self) {
        // Ingress first so nothing is enqueued into a stopping sender.
        self.reader.stop();
        self.reader.join().await;
        self.sender.stop();
        self.sender.join().await;
        log::debug!("[resender] stopped");
    }

    /// Release both legs.  Same contract as [`StreamSender::dispose`].
    pub fn dispose(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(StreamError::Invalid);
        }
        if !self.reader.is_finished() || !self.sender.is_finished() {
            return Err(StreamError::Busy);
        }
        self.reader.dispose()?;
        self.sender.dispose()?;
        self.pool.lock().buffers.clear();
        log::debug!("[resender] disposed");
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.reader.is_valid() && self.sender.is_valid()
    }

    pub fn state(&self) -> EngineState {
        match (self.reader.state(), self.sender.state()) {
            (EngineState::Disposed, EngineState::Disposed) => EngineState::Disposed,
            (EngineState::Running, EngineState::Running) => EngineState::Running,
            _ => EngineState::Stopping,
        }
    }

    /// Receive-side efficiency of the ingress leg.
    pub fn ingress_efficiency(&self) -> f32 {
        self.reader.estimated_efficiency()
    }

    /// Send-side efficiency of the egress leg.
    pub fn egress_efficiency(&self) -> f32 {
        self.sender.estimated_efficiency()
    }

    pub fn ingress_monitoring(&self, interval: Duration) -> Result<ReaderMonitoring> {
        self.reader.monitoring(interval)
    }

    pub fn egress_monitoring(&self, interval: Duration) -> Result<SenderMonitoring> {
        self.sender.monitoring(interval)
    }

    /// Free buffers currently pooled.
    pub fn pooled_buffers(&self) -> usize {
        self.pool.lock().buffers.len()
    }
}

/// The ingress reader's consumer: forward completed frames, serve buffers
/// from the pool and take released ones back.
fn relay_consumer(
    egress: SenderHandle,
    pool: Arc<Mutex<BufferPool>>,
    buffer_size: usize,
) -> impl FnMut(ReaderEvent<'_>) -> Option<FrameBuffer> + Send + 'static {
    move |event| match event {
        ReaderEvent::FrameComplete {
            frame,
            is_flush,
            skipped,
        } => {
            if skipped > 0 {
                log::debug!("[resender] ingress skipped {skipped} frame(s)");
            }
            if let Err(e) = egress.enqueue(frame, is_flush) {
                log::warn!("[resender] egress refused frame: {}", e.reason);
                pool.lock().give(e.into_frame());
            }
            Some(pool.lock().take(buffer_size))
        }
        ReaderEvent::FrameTooSmall { current, required } => {
            let size = required.max(current.capacity().saturating_mul(2));
            Some(pool.lock().take(size))
        }
        ReaderEvent::CopyComplete { previous } => {
            pool.lock().give(previous);
            None
        }
        ReaderEvent::Cancel { buffer } => {
            pool.lock().give(buffer);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_prefers_large_enough_buffers() {
        let mut pool = BufferPool::new(2, 64);
        let small = FrameBuffer::with_capacity(32);
        let large = FrameBuffer::with_capacity(512);
        let large_id = large.id();
        pool.give(small);
        pool.give(large);
        pool.give(FrameBuffer::with_capacity(8));
        assert_eq!(pool.buffers.len(), 2);

        assert_eq!(pool.take(100).id(), large_id);
        let fresh = pool.take(100);
        assert_eq!(fresh.capacity(), 100);
        assert_eq!(pool.take(10).capacity(), 32);
        assert_eq!(pool.take(10).capacity(), 64);
    }

    #[test]
    fn pooled_buffers_come_back_empty() {
        let mut pool = BufferPool::new(1, 16);
        pool.give(FrameBuffer::from_vec(vec![9u8; 16]));
        let buffer = pool.take(16);
        assert_eq!(buffer.used_size(), 0);
        assert_eq!(buffer.capacity(), 16);
    }
}
