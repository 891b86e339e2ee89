//! Windowed link monitoring.
//!
//! Each engine keeps the last [`MONITORING_MAX_POINTS`] per-datagram points
//! in a ring and summarises the ones that fall within a requested interval
//! ending now:
//!
//! ```text
//!   oldest                                         newest
//!   [p][p][p][p][p][p][p][p][p][p][p][p][p][p][p][p]
//!                     └────────── interval ─────────┘ ◀── now
//!                     real_interval = now - oldest point used
//! ```
//!
//! The sender records one point per datagram put on the wire and one per
//! cancelled frame; the reader records one point per decoded datagram.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, StreamError};

/// Points kept per engine.
pub const MONITORING_MAX_POINTS: usize = 2048;

/// Bounded history of timestamped points, newest at the back.
#[derive(Debug)]
struct History<P> {
    points: VecDeque<(Instant, P)>,
}

impl<P> Default for History<P> {
    fn default() -> Self {
        Self {
            points: VecDeque::with_capacity(MONITORING_MAX_POINTS),
        }
    }
}

impl<P> History<P> {
    fn push(&mut self, at: Instant, point: P) {
        if self.points.len() == MONITORING_MAX_POINTS {
            self.points.pop_front();
        }
        self.points.push_back((at, point));
    }

    /// Points recorded in `[now - interval, now]`, newest first.
    fn window(&self, now: Instant, interval: Duration) -> impl Iterator<Item = &(Instant, P)> + '_ {
        self.points
            .iter()
            .rev()
            .skip_while(move |(at, _)| *at > now)
            .take_while(move |(at, _)| now.saturating_duration_since(*at) <= interval)
    }
}

fn check_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(StreamError::BadParameters(
            "monitoring interval must be > 0".into(),
        ));
    }
    Ok(())
}

/// Population mean and standard deviation.
fn mean_and_deviation(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SendPoint {
    /// One datagram left; `network_time` is how long its frame had waited
    /// since it was enqueued.
    Sent { bytes: u32, network_time: Duration },
    /// A frame of this many bytes was cancelled.
    Dropped { bytes: u32 },
}

/// Send-side summary over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SenderMonitoring {
    /// Time actually covered by the points used.
    pub real_interval: Duration,
    pub bytes_sent: u64,
    pub packets_sent: u32,
    pub mean_packet_size: u32,
    pub packet_size_std_dev: u32,
    /// Mean time from enqueue to a datagram going out.
    pub mean_network_time: Duration,
    /// Standard deviation of the enqueue-to-send time.
    pub network_jitter: Duration,
    pub bytes_dropped: u64,
    pub frames_dropped: u32,
}

impl fmt::Display for SenderMonitoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets / {} B sent in {:?} (mean {} B ± {}), network time {:?} ± {:?}, {} frames / {} B dropped",
            self.packets_sent,
            self.bytes_sent,
            self.real_interval,
            self.mean_packet_size,
            self.packet_size_std_dev,
            self.mean_network_time,
            self.network_jitter,
            self.frames_dropped,
            self.bytes_dropped
        )
    }
}

/// Send-side point history.
#[derive(Debug, Default)]
pub struct SenderMonitor {
    history: History<SendPoint>,
}

impl SenderMonitor {
    pub fn record_sent(&mut self, at: Instant, bytes: usize, enqueued_at: Instant) {
        self.history.push(
            at,
            SendPoint::Sent {
                bytes: saturate(bytes),
                network_time: at.saturating_duration_since(enqueued_at),
            },
        );
    }

    pub fn record_dropped(&mut self, at: Instant, bytes: usize) {
        self.history.push(at, SendPoint::Dropped { bytes: saturate(bytes) });
    }

    /// Summarise the points of the last `interval` before `now`.
    pub fn report(&self, now: Instant, interval: Duration) -> Result<SenderMonitoring> {
        check_interval(interval)?;
        let mut out = SenderMonitoring::default();
        let mut sizes = Vec::new();
        let mut network = Vec::new();
        let mut oldest = now;

        for (at, point) in self.history.window(now, interval) {
            oldest = *at;
            match *point {
                SendPoint::Sent { bytes, network_time } => {
                    out.bytes_sent += u64::from(bytes);
                    sizes.push(f64::from(bytes));
                    network.push(network_time.as_secs_f64());
                }
                SendPoint::Dropped { bytes } => {
                    out.bytes_dropped += u64::from(bytes);
                    out.frames_dropped += 1;
                }
            }
        }

        let (mean_size, size_dev) = mean_and_deviation(&sizes);
        let (mean_net, net_dev) = mean_and_deviation(&network);
        out.real_interval = now.saturating_duration_since(oldest);
        out.packets_sent = saturate(sizes.len());
        out.mean_packet_size = mean_size as u32;
        out.packet_size_std_dev = size_dev as u32;
        out.mean_network_time = Duration::from_secs_f64(mean_net);
        out.network_jitter = Duration::from_secs_f64(net_dev);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RecvPoint {
    bytes: u32,
    frame_number: u16,
}

/// Receive-side summary over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReaderMonitoring {
    /// Time actually covered by the points used.
    pub real_interval: Duration,
    pub bytes_received: u64,
    pub packets_received: u32,
    pub mean_packet_size: u32,
    pub packet_size_std_dev: u32,
    /// Standard deviation of the gaps between consecutive arrivals.
    pub reception_jitter: Duration,
    /// Frame numbers never seen between the ones that were.
    pub frames_missed: u32,
}

impl fmt::Display for ReaderMonitoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets / {} B received in {:?} (mean {} B ± {}), jitter {:?}, {} frames missed",
            self.packets_received,
            self.bytes_received,
            self.real_interval,
            self.mean_packet_size,
            self.packet_size_std_dev,
            self.reception_jitter,
            self.frames_missed
        )
    }
}

/// Receive-side point history.
#[derive(Debug, Default)]
pub struct ReaderMonitor {
    history: History<RecvPoint>,
}

impl ReaderMonitor {
    pub fn record(&mut self, at: Instant, bytes: usize, frame_number: u16) {
        self.history.push(
            at,
            RecvPoint {
                bytes: saturate(bytes),
                frame_number,
            },
        );
    }

    /// Summarise the points of the last `interval` before `now`.
    pub fn report(&self, now: Instant, interval: Duration) -> Result<ReaderMonitoring> {
        check_interval(interval)?;
        let mut out = ReaderMonitoring::default();
        let points: Vec<_> = self.history.window(now, interval).collect();
        let mut sizes = Vec::with_capacity(points.len());
        let mut gaps = Vec::new();
        let mut previous: Option<Instant> = None;
        let mut latest: Option<u16> = None;

        // Oldest first.
        for (at, point) in points.iter().rev() {
            out.bytes_received += u64::from(point.bytes);
            sizes.push(f64::from(point.bytes));
            if let Some(previous) = previous {
                gaps.push(at.saturating_duration_since(previous).as_secs_f64());
            }
            previous = Some(*at);

            // Only forward jumps count; repeats and late fragments do not.
            match latest {
                Some(latest_frame) => {
                    let delta = point.frame_number.wrapping_sub(latest_frame) as i16;
                    if delta > 0 {
                        out.frames_missed += (delta - 1) as u32;
                        latest = Some(point.frame_number);
                    }
                }
                None => latest = Some(point.frame_number),
            }
        }
        let oldest = points.last().map_or(now, |(at, _)| *at);

        let (mean_size, size_dev) = mean_and_deviation(&sizes);
        let (_, gap_dev) = mean_and_deviation(&gaps);
        out.real_interval = now.saturating_duration_since(oldest);
        out.packets_received = saturate(sizes.len());
        out.mean_packet_size = mean_size as u32;
        out.packet_size_std_dev = size_dev as u32;
        out.reception_jitter = Duration::from_secs_f64(gap_dev);
        Ok(out)
    }
}

fn saturate(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
