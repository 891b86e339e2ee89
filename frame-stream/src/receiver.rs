//! Receive-side frame reassembly.
//!
//! [`ReaderCore`] owns exactly one *current* [`FrameBuffer`] and reassembles
//! the frame being received into it, calling the consumer for every event:
//!
//! ```text
//!                ┌──────────── fragment fits ────────────┐
//!                ▼                                       │
//!   ┌────────────────────┐  all fragments   ┌───────────┴──────┐
//!   │     RECEIVING      │─────────────────▶│  FRAME_COMPLETE  │──▶ next buffer
//!   └─────────┬──────────┘                  └──────────────────┘
//!             │ fragment past capacity
//!             ▼
//!   ┌────────────────────┐ larger buffer  ┌─────────────────┐
//!   │  FRAME_TOO_SMALL   │───────────────▶│  COPY_COMPLETE  │──▶ previous released
//!   └─────────┬──────────┘                └─────────────────┘
//!             │ no buffer / not larger
//!             ▼
//!        frame discarded (counted as skipped at the next completion)
//! ```
//!
//! Frames are identified by the sender's 16-bit frame number.  A packet for a
//! newer frame abandons whatever was being reassembled; packets for older
//! frames are stale and dropped.  Fragment `i` lands at offset
//! `i * max_packet_size`, so fragments may arrive in any order.
//!
//! All I/O belongs to [`crate::stream_reader::StreamReader`]; this module
//! only decides what happens to bytes and buffers.

use std::mem;

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::efficiency::EfficiencyEstimator;
use crate::error::{Result, StreamError};
use crate::packet::{frame_before, AckBitfield, AckPacket, DataPacket, MAX_FRAGMENTS_PER_FRAME};
use crate::state::ReaderCause;

/// One call into the reader's consumer.
#[derive(Debug)]
pub enum ReaderEvent<'a> {
    /// A frame is fully reassembled.  The consumer takes `frame` and returns
    /// the buffer to reassemble the next frame into.
    FrameComplete {
        frame: FrameBuffer,
        /// The sender enqueued this frame with `flush = true`.
        is_flush: bool,
        /// Frames lost since the previous completion.
        skipped: u32,
    },
    /// `current` cannot hold the incoming frame; at least `required` bytes
    /// are needed.  The consumer returns a larger buffer, or `None` to drop
    /// the frame.
    FrameTooSmall {
        current: &'a FrameBuffer,
        required: usize,
    },
    /// The previous buffer's bytes now live in its replacement; the reader
    /// gives the previous buffer back and will not touch it again.
    CopyComplete { previous: FrameBuffer },
    /// The reader is stopping and releases its current buffer.
    Cancel { buffer: FrameBuffer },
}

impl ReaderEvent<'_> {
    pub fn cause(&self) -> ReaderCause {
        match self {
            ReaderEvent::FrameComplete { .. } => ReaderCause::FrameComplete,
            ReaderEvent::FrameTooSmall { .. } => ReaderCause::FrameTooSmall,
            ReaderEvent::CopyComplete { .. } => ReaderCause::CopyComplete,
            ReaderEvent::Cancel { .. } => ReaderCause::Cancel,
        }
    }
}

/// What a data packet did to the reader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Belongs to a frame older than the one being reassembled.
    Stale,
    /// Fragment already received, or its frame is done or discarded.
    Duplicate,
    /// New fragment stored; the frame is still incomplete.
    Accepted,
    /// The frame cannot be stored and is being dropped.
    Discarded,
    /// The fragment completed its frame.
    Completed { frame_number: u16, skipped: u32 },
}

#[derive(Debug)]
struct Reassembly {
    number: u16,
    fragments: usize,
    flush: bool,
    received: AckBitfield,
    /// Bytes spanned by the fragments received so far.
    size: usize,
    total: u64,
    useful: u64,
    discarded: bool,
    completed: bool,
}

/// Reader state for one stream.
#[derive(Debug)]
pub struct ReaderCore {
    max_packet_size: usize,
    initial_buffer_size: usize,
    current: FrameBuffer,
    frame: Option<Reassembly>,
    first_seen: Option<u16>,
    last_completed: Option<u16>,
    efficiency: EfficiencyEstimator,
}

impl ReaderCore {
    pub fn new(config: &StreamConfig, initial_buffer: FrameBuffer) -> Self {
        let mut current = initial_buffer;
        current.clear();
        Self {
            max_packet_size: config.max_packet_size,
            initial_buffer_size: config.initial_buffer_size,
            current,
            frame: None,
            first_seen: None,
            last_completed: None,
            efficiency: EfficiencyEstimator::default(),
        }
    }

    /// Feed one decoded data fragment.
    ///
    /// Malformed fragments yield [`StreamError::ProtocolViolation`] and leave
    /// the state untouched.
    pub fn on_data<F>(&mut self, packet: DataPacket<'_>, consumer: &mut F) -> Result<DataOutcome>
    where
        F: FnMut(ReaderEvent<'_>) -> Option<FrameBuffer>,
    {
        let h = packet.header;
        let index = usize::from(h.fragment_index);
        let count = usize::from(h.fragments_per_frame);
        self.validate(&packet)?;

        let is_new = match &self.frame {
            Some(f) if f.number == h.frame_number => false,
            Some(f) if frame_before(h.frame_number, f.number) => return Ok(DataOutcome::Stale),
            _ => true,
        };
        if is_new {
            self.begin_frame(h.frame_number, count, h.is_flush());
        }
        let Some(frame) = self.frame.as_mut() else {
            return Ok(DataOutcome::Stale);
        };
        if frame.fragments != count {
            return Err(StreamError::protocol(format!(
                "frame {} announced {} fragments, now {count}",
                frame.number, frame.fragments
            )));
        }

        let fresh = frame.received.set(index);
        frame.total += 1;
        if fresh {
            frame.useful += 1;
        }
        if frame.completed || frame.discarded {
            return Ok(DataOutcome::Duplicate);
        }

        let offset = index * self.max_packet_size;
        let end = offset + packet.payload.len();

        // Grow until the fragment fits.  Every replacement releases the
        // previous buffer through COPY_COMPLETE.
        while end > self.current.capacity() {
            let reply = consumer(ReaderEvent::FrameTooSmall {
                current: &self.current,
                required: end,
            });
            let Some(mut next) = reply else {
                log::warn!(
                    "[reader] no buffer for frame {} ({end} bytes needed); dropping it",
                    frame.number
                );
                frame.discarded = true;
                break;
            };

            let larger = next.capacity() > self.current.capacity();
            next.clear();
            if larger {
                next.write_at(0, self.current.as_slice())?;
            }
            let previous = mem::replace(&mut self.current, next);
            log::debug!(
                "[reader] frame {}: {} → {} bytes",
                frame.number,
                previous.capacity(),
                self.current.capacity()
            );
            release(consumer, ReaderEvent::CopyComplete { previous });
            if !larger {
                log::warn!(
                    "[reader] replacement buffer for frame {} is not larger; dropping it",
                    frame.number
                );
                self.current.clear();
                frame.discarded = true;
                break;
            }
        }
        if frame.discarded {
            return Ok(DataOutcome::Discarded);
        }

        if fresh {
            self.current.write_at(offset, packet.payload)?;
        }
        frame.size = frame.size.max(end);
        if !frame.received.all_set(frame.fragments) {
            return Ok(if fresh {
                DataOutcome::Accepted
            } else {
                DataOutcome::Duplicate
            });
        }

        // Frame complete.
        frame.completed = true;
        let number = frame.number;
        let is_flush = frame.flush;
        let size = frame.size;
        let since = match self.last_completed {
            Some(prev) => prev.wrapping_add(1),
            None => self.first_seen.unwrap_or(number),
        };
        let skipped = u32::from(number.wrapping_sub(since));
        self.last_completed = Some(number);
        if skipped > 0 {
            log::debug!("[reader] missed {skipped} frame(s) before frame {number}");
        }

        self.current.set_used_size(size)?;
        let completed = mem::replace(&mut self.current, FrameBuffer::with_capacity(0));
        let next = consumer(ReaderEvent::FrameComplete {
            frame: completed,
            is_flush,
            skipped,
        });
        self.current = match next {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => {
                log::warn!(
                    "[reader] consumer returned no buffer; allocating {} bytes",
                    self.initial_buffer_size
                );
                FrameBuffer::with_capacity(self.initial_buffer_size)
            }
        };
        Ok(DataOutcome::Completed {
            frame_number: number,
            skipped,
        })
    }

    /// Ack for the frame being reassembled, if any.
    pub fn ack_state(&self) -> Option<AckPacket> {
        self.frame.as_ref().map(|f| AckPacket {
            frame_number: f.number,
            received: f.received,
        })
    }

    /// Whether the frame being acked is complete or discarded, so its ack
    /// can no longer change.
    pub fn frame_settled(&self) -> bool {
        self.frame.as_ref().is_some_and(|f| f.completed || f.discarded)
    }

    /// First-time fragments / fragments received over the last frames.
    pub fn estimated_efficiency(&self) -> f32 {
        self.efficiency.estimate()
    }

    pub fn current_capacity(&self) -> usize {
        self.current.capacity()
    }

    /// Release the current buffer through CANCEL.
    pub fn cancel<F>(mut self, consumer: &mut F)
    where
        F: FnMut(ReaderEvent<'_>) -> Option<FrameBuffer>,
    {
        if let Some(frame) = self.frame.take() {
            if !frame.completed {
                log::debug!("[reader] frame {} abandoned on stop", frame.number);
            }
        }
        let buffer = mem::replace(&mut self.current, FrameBuffer::with_capacity(0));
        release(consumer, ReaderEvent::Cancel { buffer });
    }

    fn validate(&self, packet: &DataPacket<'_>) -> Result<()> {
        let h = packet.header;
        let count = usize::from(h.fragments_per_frame);
        let index = usize::from(h.fragment_index);
        if count == 0 || count > MAX_FRAGMENTS_PER_FRAME {
            return Err(StreamError::protocol(format!(
                "frame {} claims {count} fragments",
                h.frame_number
            )));
        }
        if index >= count {
            return Err(StreamError::protocol(format!(
                "frame {} fragment {index} out of {count}",
                h.frame_number
            )));
        }
        let len = packet.payload.len();
        let last = index + 1 == count;
        if len > self.max_packet_size || (!last && len != self.max_packet_size) {
            return Err(StreamError::protocol(format!(
                "frame {} fragment {index} carries {len} bytes (packet size {})",
                h.frame_number, self.max_packet_size
            )));
        }
        Ok(())
    }

    fn begin_frame(&mut self, number: u16, fragments: usize, flush: bool) {
        if let Some(old) = self.frame.take() {
            self.efficiency.record(old.total, old.useful);
            if !old.completed {
                log::debug!(
                    "[reader] dropping frame {} ({} of {} fragments)",
                    old.number,
                    old.received.count_set(),
                    old.fragments
                );
            }
        }
        self.first_seen.get_or_insert(number);
        self.current.clear();
        self.frame = Some(Reassembly {
            number,
            fragments,
            flush,
            received: AckBitfield::new(),
            size: 0,
            total: 0,
            useful: 0,
            discarded: false,
            completed: false,
        });
    }
}

/// Hand a buffer back; any buffer the consumer returns here is dropped.
fn release<F>(consumer: &mut F, event: ReaderEvent<'_>)
where
    F: FnMut(ReaderEvent<'_>) -> Option<FrameBuffer>,
{
    let cause = event.cause();
    if let Some(extra) = consumer(event) {
        log::debug!("[reader] ignoring {} returned on {cause}", extra.id());
    }
}
