//! Closed status/cause enumerations and engine lifecycle state.
//!
//! The integer values are the ones exchanged with embedding applications.
//! Decoding an unknown value is an error, never a silent fallback.
//!
//! ```text
//!  reader causes                        sender statuses
//!  0 FRAME_COMPLETE                     0 FRAME_SENT
//!  1 FRAME_TOO_SMALL ──▶ 2 COPY_COMPLETE 1 FRAME_CANCEL
//!  3 CANCEL
//! ```

use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::StreamError;

/// Why the reader is calling its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderCause {
    /// A frame is fully reassembled.
    FrameComplete,
    /// The current buffer cannot hold the incoming frame.
    FrameTooSmall,
    /// The previous buffer was migrated into its replacement and is released.
    CopyComplete,
    /// The reader is stopping; the current buffer is released.
    Cancel,
}

impl ReaderCause {
    pub const ALL: [ReaderCause; 4] = [
        ReaderCause::FrameComplete,
        ReaderCause::FrameTooSmall,
        ReaderCause::CopyComplete,
        ReaderCause::Cancel,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ReaderCause {
    type Error = StreamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReaderCause::FrameComplete),
            1 => Ok(ReaderCause::FrameTooSmall),
            2 => Ok(ReaderCause::CopyComplete),
            3 => Ok(ReaderCause::Cancel),
            other => Err(StreamError::UnknownCause(other)),
        }
    }
}

impl fmt::Display for ReaderCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReaderCause::FrameComplete => "FRAME_COMPLETE",
            ReaderCause::FrameTooSmall => "FRAME_TOO_SMALL",
            ReaderCause::CopyComplete => "COPY_COMPLETE",
            ReaderCause::Cancel => "CANCEL",
        })
    }
}

/// Terminal outcome of one accepted frame on the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderStatus {
    /// Every fragment was acknowledged.
    FrameSent,
    /// The frame was superseded, expired or abandoned on shutdown.
    FrameCancel,
}

impl SenderStatus {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for SenderStatus {
    type Error = StreamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SenderStatus::FrameSent),
            1 => Ok(SenderStatus::FrameCancel),
            other => Err(StreamError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for SenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SenderStatus::FrameSent => "FRAME_SENT",
            SenderStatus::FrameCancel => "FRAME_CANCEL",
        })
    }
}

/// Lifecycle of a sender, reader or resender.
///
/// ```text
///  Running ──stop()──▶ Stopping ──dispose()──▶ Disposed
/// ```
///
/// `dispose()` only succeeds once every loop task has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Running,
    Stopping,
    Disposed,
}

impl EngineState {
    pub fn is_valid(self) -> bool {
        self != EngineState::Disposed
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Stop signal and task handles shared by every engine.
///
/// Dropping a `Lifecycle` that was never disposed signals its tasks to stop
/// and logs a warning; the tasks then wind down on their own.
pub(crate) struct Lifecycle {
    tag: &'static str,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    disposed: bool,
}

impl Lifecycle {
    pub(crate) fn new(tag: &'static str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tag,
            stop_tx,
            tasks: Vec::new(),
            disposed: false,
        }
    }

    /// Receiver that observes [`Lifecycle::stop`].
    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Idempotent, never blocks.
    pub(crate) fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            log::debug!("[{}] stop requested", self.tag);
        }
    }

    pub(crate) async fn join(&mut self) {
        for task in self.tasks.iter_mut() {
            if task.is_finished() {
                continue;
            }
            if let Err(e) = task.await {
                log::error!("[{}] task failed: {e}", self.tag);
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    pub(crate) fn dispose(&mut self) -> Result<(), StreamError> {
        if self.disposed {
            return Err(StreamError::Invalid);
        }
        if !self.is_finished() {
            return Err(StreamError::Busy);
        }
        self.tasks.clear();
        self.disposed = true;
        log::debug!("[{}] disposed", self.tag);
        Ok(())
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.disposed
    }

    pub(crate) fn state(&self) -> EngineState {
        if self.disposed {
            EngineState::Disposed
        } else if *self.stop_tx.borrow() {
            EngineState::Stopping
        } else {
            EngineState::Running
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if !self.disposed {
            log::warn!("[{}] dropped without dispose(); stopping tasks", self.tag);
            self.stop_tx.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_cause_values() {
        for cause in ReaderCause::ALL {
            assert_eq!(ReaderCause::try_from(cause.as_u32()).unwrap(), cause);
        }
        assert_eq!(ReaderCause::FrameTooSmall.as_u32(), 1);
        assert!(matches!(
            ReaderCause::try_from(4),
            Err(StreamError::UnknownCause(4))
        ));
    }

    #[test]
    fn sender_status_values() {
        assert_eq!(SenderStatus::try_from(0).unwrap(), SenderStatus::FrameSent);
        assert_eq!(SenderStatus::try_from(1).unwrap(), SenderStatus::FrameCancel);
        assert!(matches!(
            SenderStatus::try_from(2),
            Err(StreamError::UnknownStatus(2))
        ));
    }

    #[test]
    fn display_names() {
        assert_eq!(ReaderCause::CopyComplete.to_string(), "COPY_COMPLETE");
        assert_eq!(SenderStatus::FrameCancel.to_string(), "FRAME_CANCEL");
    }

    #[tokio::test]
    async fn lifecycle_refuses_dispose_while_running() {
        let mut life = Lifecycle::new("test");
        let mut stop = life.stop_signal();
        life.track(tokio::spawn(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        }));
        assert_eq!(life.state(), EngineState::Running);
        assert!(matches!(life.dispose(), Err(StreamError::Busy)));

        life.stop();
        life.stop();
        assert_eq!(life.state(), EngineState::Stopping);
        life.join().await;
        assert!(life.is_finished());
        life.dispose().unwrap();
        assert!(!life.is_valid());
        assert_eq!(life.state(), EngineState::Disposed);
        assert!(matches!(life.dispose(), Err(StreamError::Invalid)));
    }

    #[test]
    fn only_disposed_is_invalid() {
        assert!(EngineState::default().is_valid());
        assert!(EngineState::Stopping.is_valid());
        assert!(!EngineState::Disposed.is_valid());
    }
}
