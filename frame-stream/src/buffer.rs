//! Owned frame storage moved between the application and the engines.
//!
//! A [`FrameBuffer`] is a fixed-capacity byte region plus a used length.  It
//! is never shared: whoever holds the value owns the bytes, and hand-offs
//! between producer, engine and consumer are plain moves.
//!
//! Every buffer gets a process-unique [`BufferId`] at allocation time so that
//! callers can recognise a buffer they handed over once it comes back in a
//! status or cause callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, StreamError};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`FrameBuffer`] allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Resizable byte region with a capacity and a used length.
///
/// Invariant: `used_size() <= capacity()`.
pub struct FrameBuffer {
    id: BufferId,
    /// Always `capacity` bytes long; bytes past `used` are scratch space.
    data: Vec<u8>,
    used: usize,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes with nothing used.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: BufferId::next(),
            data: vec![0u8; capacity],
            used: 0,
        }
    }

    /// Wrap `bytes` as a full buffer (`used == capacity == bytes.len()`).
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let used = bytes.len();
        Self {
            id: BufferId::next(),
            data: bytes,
            used,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used_size(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Mark `size` bytes as used.
    pub fn set_used_size(&mut self, size: usize) -> Result<()> {
        if size > self.capacity() {
            return Err(StreamError::BadParameters(format!(
                "used size {size} exceeds capacity {}",
                self.capacity()
            )));
        }
        self.used = size;
        Ok(())
    }

    /// The used part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Copy `bytes` into the buffer at `offset`, growing `used` to cover them.
    ///
    /// Fails without writing anything if the bytes do not fit.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.capacity())
            .ok_or_else(|| {
                StreamError::BadParameters(format!(
                    "write of {} bytes at offset {offset} overflows capacity {}",
                    bytes.len(),
                    self.capacity()
                ))
            })?;
        self.data[offset..end].copy_from_slice(bytes);
        self.used = self.used.max(end);
        Ok(())
    }

    /// Replace the contents with `bytes`, growing the capacity if needed.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        if bytes.len() > self.capacity() {
            self.resize(bytes.len());
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.used = bytes.len();
    }

    /// Change the capacity in place, keeping the leading bytes.
    ///
    /// Shrinking below the used length truncates it.
    pub fn resize(&mut self, new_capacity: usize) {
        self.data.resize(new_capacity, 0);
        self.used = self.used.min(new_capacity);
    }

    /// Forget the contents but keep the allocation.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Consume the buffer and return its used bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.used);
        self.data
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}
