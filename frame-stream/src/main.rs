//! Entry point for `frame-stream`.
//!
//! Parses CLI arguments and dispatches into **send**, **read** or **relay**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, signal handling, argument parsing) and the
//! file I/O around the engines.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use frame_stream::{
    FrameBuffer, ReaderEvent, Role, SenderStatus, StreamConfig, StreamError, StreamReader,
    StreamResender, StreamSender, TransportChannel,
};

/// How often link statistics are logged.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Loss-tolerant frame streaming over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    net: NetArgs,

    #[command(subcommand)]
    mode: Mode,
}

/// Connection parameters shared by every mode.
#[derive(Args, Clone)]
struct NetArgs {
    /// Address of the sending side.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    server_address: String,
    /// Address of the reading side.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    client_address: String,
    #[arg(long, global = true, default_value_t = 5004)]
    server_stream_port: u16,
    #[arg(long, global = true, default_value_t = 5005)]
    server_control_port: u16,
    #[arg(long, global = true, default_value_t = 55004)]
    client_stream_port: u16,
    #[arg(long, global = true, default_value_t = 55005)]
    client_control_port: u16,
    /// Fragment payload size in bytes.
    #[arg(long, global = true, default_value_t = frame_stream::config::DEFAULT_PACKET_SIZE)]
    packet_size: usize,
    /// Bits per second, 0 for unlimited.
    #[arg(long, global = true, default_value_t = 0)]
    max_bitrate: u64,
    /// Frame lifetime in milliseconds.
    #[arg(long, global = true, default_value_t = 500)]
    max_latency_ms: u64,
    /// Upper bound of the retransmit interval in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    max_network_latency_ms: u64,
    /// Initial reader buffer size in bytes.
    #[arg(long, global = true, default_value_t = 64 * 1024)]
    buffer_size: usize,
    /// Frames allowed to wait behind the one being sent.
    #[arg(long, global = true, default_value_t = 8)]
    queue_size: usize,
}

impl NetArgs {
    fn to_config(&self) -> StreamConfig {
        StreamConfig {
            server_address: self.server_address.clone(),
            client_address: self.client_address.clone(),
            server_stream_port: self.server_stream_port,
            server_control_port: self.server_control_port,
            client_stream_port: self.client_stream_port,
            client_control_port: self.client_control_port,
            max_packet_size: self.packet_size,
            max_bitrate: self.max_bitrate,
            max_latency: Duration::from_millis(self.max_latency_ms),
            max_network_latency: Duration::from_millis(self.max_network_latency_ms),
            initial_buffer_size: self.buffer_size,
            frame_queue_size: self.queue_size,
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Stream a file to a reader as fixed-size frames.
    Send {
        #[arg(short, long)]
        input: PathBuf,
        /// Bytes per frame.
        #[arg(long, default_value_t = 16 * 1024)]
        frame_size: usize,
        /// Frames per second.
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Mark every Nth frame as a flush frame (0 = never).
        #[arg(long, default_value_t = 30)]
        flush_every: u64,
        /// Start over at end of file until interrupted.
        #[arg(long)]
        repeat: bool,
    },
    /// Receive frames and append them to a file.
    Read {
        #[arg(short, long)]
        output: PathBuf,
        /// Exit after this many frames.
        #[arg(long)]
        frames: Option<u64>,
    },
    /// Receive a stream and forward it to a second reader.
    Relay {
        /// Address of the second reader.
        #[arg(long)]
        egress_client_address: String,
        #[arg(long, default_value_t = 6004)]
        egress_stream_port: u16,
        #[arg(long, default_value_t = 6005)]
        egress_control_port: u16,
        #[arg(long, default_value_t = 56004)]
        egress_client_stream_port: u16,
        #[arg(long, default_value_t = 56005)]
        egress_client_control_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.net.to_config();
    config.validate().context("invalid connection parameters")?;

    match cli.mode {
        Mode::Send {
            input,
            frame_size,
            fps,
            flush_every,
            repeat,
        } => {
            let frames = FrameSource::open(&input, frame_size)?;
            run_send(config, frames, fps, flush_every, repeat).await
        }
        Mode::Read { output, frames } => run_read(config, output, frames).await,
        Mode::Relay {
            egress_client_address,
            egress_stream_port,
            egress_control_port,
            egress_client_stream_port,
            egress_client_control_port,
        } => {
            let egress = StreamConfig {
                server_stream_port: egress_stream_port,
                server_control_port: egress_control_port,
                client_address: egress_client_address,
                client_stream_port: egress_client_stream_port,
                client_control_port: egress_client_control_port,
                ..config.clone()
            };
            run_relay(config, egress).await
        }
    }
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

/// A file cut into frames.
struct FrameSource {
    data: Vec<u8>,
    frame_size: usize,
    offset: usize,
}

impl FrameSource {
    fn open(path: &Path, frame_size: usize) -> Result<Self> {
        if frame_size == 0 {
            bail!("--frame-size must be positive");
        }
        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .with_context(|| format!("cannot read {}", path.display()))?;
        if data.is_empty() {
            bail!("{} is empty", path.display());
        }
        Ok(Self {
            data,
            frame_size,
            offset: 0,
        })
    }

    fn next_frame(&mut self, buffer: &mut FrameBuffer, repeat: bool) -> bool {
        if self.offset >= self.data.len() {
            if !repeat {
                return false;
            }
            self.offset = 0;
        }
        let end = (self.offset + self.frame_size).min(self.data.len());
        buffer.fill_from(&self.data[self.offset..end]);
        self.offset = end;
        true
    }
}

#[derive(Default)]
struct SendStats {
    accepted: AtomicU64,
    sent: AtomicU64,
    cancelled: AtomicU64,
}

impl SendStats {
    fn outstanding(&self) -> u64 {
        let done = self.sent.load(Ordering::Relaxed) + self.cancelled.load(Ordering::Relaxed);
        self.accepted.load(Ordering::Relaxed).saturating_sub(done)
    }
}

async fn run_send(
    config: StreamConfig,
    mut frames: FrameSource,
    fps: u32,
    flush_every: u64,
    repeat: bool,
) -> Result<()> {
    if fps == 0 {
        bail!("--fps must be positive");
    }
    let channel = TransportChannel::open_udp(&config, Role::Sender)
        .await
        .context("cannot open UDP endpoints")?;
    log::info!(
        "Sending to {}:{} ({} fps)",
        config.client_address,
        config.client_stream_port,
        fps
    );

    let stats = Arc::new(SendStats::default());
    let free: Arc<Mutex<Vec<FrameBuffer>>> = Arc::default();
    let mut sender = {
        let stats = Arc::clone(&stats);
        let free = Arc::clone(&free);
        StreamSender::start(config, channel, move |status, frame| {
            match status {
                SenderStatus::FrameSent => stats.sent.fetch_add(1, Ordering::Relaxed),
                SenderStatus::FrameCancel => stats.cancelled.fetch_add(1, Ordering::Relaxed),
            };
            free.lock().push(frame);
        })?
    };

    let mut ticker = interval(Duration::from_secs(1) / fps);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = monitor_ticker();
    let mut index = 0u64;
    let mut exhausted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                log::info!("Link: {}", sender.monitoring(MONITOR_INTERVAL)?);
                continue;
            }
            _ = ticker.tick() => {}
        }
        if exhausted {
            if stats.outstanding() == 0 {
                break;
            }
            continue;
        }

        let reused = free.lock().pop();
        let mut buffer = reused.unwrap_or_else(|| FrameBuffer::with_capacity(frames.frame_size));
        if !frames.next_frame(&mut buffer, repeat) {
            exhausted = true;
            continue;
        }
        let flush = flush_every > 0 && index % flush_every == 0;
        index += 1;
        match sender.enqueue(buffer, flush) {
            Ok(_) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if matches!(e.reason, StreamError::QueueFull) => {
                log::warn!("Queue full, dropping frame {index}");
                free.lock().push(e.into_frame());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let efficiency = sender.estimated_efficiency();
    shutdown_sender(&mut sender).await?;
    log::info!(
        "Done: {} sent, {} cancelled, efficiency {:.2}",
        stats.sent.load(Ordering::Relaxed),
        stats.cancelled.load(Ordering::Relaxed),
        efficiency
    );
    Ok(())
}

fn monitor_ticker() -> tokio::time::Interval {
    let mut ticker = interval(MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the immediate first tick; there is nothing to report yet.
    ticker.reset();
    ticker
}

async fn shutdown_sender(sender: &mut StreamSender) -> Result<()> {
    sender.stop();
    sender.join().await;
    sender.dispose()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// read
// ---------------------------------------------------------------------------

async fn run_read(config: StreamConfig, output: PathBuf, limit: Option<u64>) -> Result<()> {
    let file = File::create(&output).with_context(|| format!("cannot create {}", output.display()))?;
    let mut out = BufWriter::new(file);

    let channel = TransportChannel::open_udp(&config, Role::Reader)
        .await
        .context("cannot open UDP endpoints")?;
    log::info!(
        "Reading from {}:{} into {}",
        config.server_address,
        config.server_stream_port,
        output.display()
    );

    // Completed frames travel to this task for writing and come back
    // through `free` for reuse.
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(FrameBuffer, u32)>();
    let free: Arc<Mutex<Vec<FrameBuffer>>> = Arc::default();
    let buffer_size = config.initial_buffer_size;
    let consumer = {
        let free = Arc::clone(&free);
        move |event: ReaderEvent<'_>| -> Option<FrameBuffer> {
            match event {
                ReaderEvent::FrameComplete { frame, skipped, .. } => {
                    let _ = frame_tx.send((frame, skipped));
                    let reused = free.lock().pop();
                    Some(reused.unwrap_or_else(|| FrameBuffer::with_capacity(buffer_size)))
                }
                ReaderEvent::FrameTooSmall { current, required } => Some(FrameBuffer::with_capacity(
                    required.max(current.capacity().saturating_mul(2)),
                )),
                ReaderEvent::CopyComplete { .. } | ReaderEvent::Cancel { .. } => None,
            }
        }
    };
    let mut reader =
        StreamReader::start(config, channel, FrameBuffer::with_capacity(buffer_size), consumer)?;

    let mut received = 0u64;
    let mut skipped_total = 0u64;
    let mut report = monitor_ticker();
    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                log::info!("Link: {}", reader.monitoring(MONITOR_INTERVAL)?);
                continue;
            }
            next = frame_rx.recv() => next,
        };
        let Some((frame, skipped)) = next else { break };
        out.write_all(frame.as_slice())
            .with_context(|| format!("cannot write {}", output.display()))?;
        free.lock().push(frame);
        received += 1;
        skipped_total += u64::from(skipped);
        if limit.is_some_and(|n| received >= n) {
            break;
        }
    }
    out.flush()?;

    let efficiency = reader.estimated_efficiency();
    reader.stop();
    reader.join().await;
    reader.dispose()?;
    log::info!("Done: {received} frames, {skipped_total} skipped, efficiency {efficiency:.2}");
    Ok(())
}

// ---------------------------------------------------------------------------
// relay
// ---------------------------------------------------------------------------

async fn run_relay(ingress: StreamConfig, egress: StreamConfig) -> Result<()> {
    egress.validate().context("invalid egress parameters")?;
    let ingress_channel = TransportChannel::open_udp(&ingress, Role::Reader)
        .await
        .context("cannot open ingress endpoints")?;
    let egress_channel = TransportChannel::open_udp(&egress, Role::Sender)
        .await
        .context("cannot open egress endpoints")?;
    log::info!(
        "Relaying {}:{} → {}:{}",
        ingress.server_address,
        ingress.server_stream_port,
        egress.client_address,
        egress.client_stream_port
    );

    let mut resender = StreamResender::start(ingress, ingress_channel, egress, egress_channel)?;
    let mut report = monitor_ticker();
    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("cannot wait for Ctrl-C")?;
                log::info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                log::info!("Ingress: {}", resender.ingress_monitoring(MONITOR_INTERVAL)?);
                log::info!("Egress: {}", resender.egress_monitoring(MONITOR_INTERVAL)?);
            }
        }
    }

    let (ingress_eff, egress_eff) = (resender.ingress_efficiency(), resender.egress_efficiency());
    resender.stop().await;
    resender.dispose()?;
    log::info!("Done: ingress efficiency {ingress_eff:.2}, egress efficiency {egress_eff:.2}");
    Ok(())
}
