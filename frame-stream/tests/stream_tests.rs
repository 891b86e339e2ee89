//! Integration tests for sender and reader engines over the in-memory link.
//!
//! Each test runs a real [`StreamSender`] and/or [`StreamReader`] with their
//! tokio tasks, wired through `simulator::channel_pair`.  Statuses and
//! consumer events are forwarded into channels so the test body can await
//! them in order.

use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{timeout, Instant};

use frame_stream::packet::{DataHeader, DataPacket};
use frame_stream::simulator::{channel_pair, SimulatorConfig};
use frame_stream::{
    BufferId, FrameBuffer, ReaderCause, ReaderEvent, SenderStatus, StreamConfig, StreamReader,
    StreamSender, TransportChannel,
};

fn config(packet_size: usize) -> StreamConfig {
    StreamConfig {
        max_packet_size: packet_size,
        max_latency: Duration::from_secs(5),
        max_network_latency: Duration::from_millis(100),
        initial_buffer_size: 64 * 1024,
        frame_queue_size: 16,
        ..StreamConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Await the next item or fail after ten seconds.
async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

type Statuses = UnboundedReceiver<(SenderStatus, BufferId)>;

fn start_sender(config: StreamConfig, channel: TransportChannel) -> (StreamSender, Statuses) {
    let (tx, rx) = unbounded_channel();
    let sender = StreamSender::start(config, channel, move |status, frame| {
        let _ = tx.send((status, frame.id()));
    })
    .expect("start sender");
    (sender, rx)
}

/// A completed frame as seen by the reader's consumer.
#[derive(Debug)]
struct Completed {
    bytes: Vec<u8>,
    is_flush: bool,
    skipped: u32,
}

fn start_reader(
    config: StreamConfig,
    channel: TransportChannel,
    initial: usize,
) -> (StreamReader, UnboundedReceiver<Completed>) {
    let (tx, rx) = unbounded_channel();
    let reader = StreamReader::start(
        config,
        channel,
        FrameBuffer::with_capacity(initial),
        move |event| match event {
            ReaderEvent::FrameComplete {
                frame,
                is_flush,
                skipped,
            } => {
                let capacity = frame.capacity();
                let _ = tx.send(Completed {
                    bytes: frame.into_vec(),
                    is_flush,
                    skipped,
                });
                Some(FrameBuffer::with_capacity(capacity))
            }
            ReaderEvent::FrameTooSmall { current, required } => Some(FrameBuffer::with_capacity(
                required.max(current.capacity() * 2),
            )),
            ReaderEvent::CopyComplete { .. } | ReaderEvent::Cancel { .. } => None,
        },
    )
    .expect("start reader");
    (reader, rx)
}

fn fragment(frame_number: u16, index: u8, count: u8, payload: &[u8]) -> Vec<u8> {
    DataPacket {
        header: DataHeader {
            frame_number,
            flags: 0,
            fragment_index: index,
            fragments_per_frame: count,
        },
        payload,
    }
    .encode()
    .unwrap()
}

// ---------------------------------------------------------------------------
// Sender + reader
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frames_arrive_whole_and_in_order() {
    let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
    let (mut reader, mut frames) = start_reader(config(1000), sim.reader.clone(), 64 * 1024);
    let (mut sender, mut statuses) = start_sender(config(1000), sim.sender.clone());

    let sizes = [1, 999, 1000, 1001, 4500, 100_000];
    let mut ids = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let frame = FrameBuffer::from_vec(pattern(*size, i as u8));
        ids.push(frame.id());
        sender.enqueue(frame, i == 0).unwrap();
    }

    for id in ids {
        assert_eq!(next(&mut statuses).await, (SenderStatus::FrameSent, id));
    }
    for (i, size) in sizes.iter().enumerate() {
        let got = next(&mut frames).await;
        assert_eq!(got.bytes, pattern(*size, i as u8), "frame {i}");
        assert_eq!(got.is_flush, i == 0);
        assert_eq!(got.skipped, 0);
    }
    assert_eq!(sim.data_stats.dropped(), 0);
    let efficiency = sender.estimated_efficiency();
    assert!(efficiency > 0.0 && efficiency <= 1.0, "{efficiency}");

    sender.stop();
    reader.stop();
    sender.join().await;
    reader.join().await;
    sender.dispose().unwrap();
    reader.dispose().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lossy_link_still_delivers_every_frame() {
    let sim = channel_pair(SimulatorConfig::lossy(0.25, 11), SimulatorConfig::lossy(0.25, 12));
    let (mut reader, mut frames) = start_reader(config(500), sim.reader.clone(), 8 * 1024);
    let (mut sender, mut statuses) = start_sender(config(500), sim.sender.clone());

    for i in 0..8u8 {
        let payload = pattern(3000, i);
        let frame = FrameBuffer::from_vec(payload.clone());
        let id = frame.id();
        sender.enqueue(frame, false).unwrap();

        assert_eq!(next(&mut statuses).await, (SenderStatus::FrameSent, id));
        let got = next(&mut frames).await;
        assert_eq!(got.bytes, payload);
        assert_eq!(got.skipped, 0);
    }

    assert!(sim.data_stats.dropped() > 0);
    let efficiency = sender.estimated_efficiency();
    assert!(efficiency > 0.0 && efficiency <= 1.0, "{efficiency}");

    sender.stop();
    reader.stop();
    sender.join().await;
    reader.join().await;
    sender.dispose().unwrap();
    reader.dispose().unwrap();
}

#[tokio::test]
async fn flush_supersedes_undelivered_frame() {
    // Nothing gets through, so the first frame is still in flight.
    let sim = channel_pair(SimulatorConfig::lossy(1.0, 1), SimulatorConfig::default());
    let (mut sender, mut statuses) = start_sender(config(1000), sim.sender.clone());

    let first = FrameBuffer::from_vec(pattern(5000, 1));
    let queued = FrameBuffer::from_vec(pattern(10, 2));
    let flush = FrameBuffer::from_vec(pattern(10, 3));
    let ids = [first.id(), queued.id(), flush.id()];
    sender.enqueue(first, false).unwrap();
    sender.enqueue(queued, false).unwrap();
    assert_eq!(sender.enqueue(flush, true).unwrap(), 1);

    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameCancel, ids[0]));
    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameCancel, ids[1]));

    sender.stop();
    sender.join().await;
    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameCancel, ids[2]));
    sender.dispose().unwrap();
}

#[tokio::test]
async fn flush_cancels_pending_frame_then_delivers() {
    let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
    let (mut reader, mut frames) = start_reader(config(1000), sim.reader.clone(), 64 * 1024);
    let (mut sender, mut statuses) = start_sender(config(1000), sim.sender.clone());

    // No await in between, so A has not been acked when B arrives.
    let a = FrameBuffer::from_vec(pattern(5000, 1));
    let b = FrameBuffer::from_vec(pattern(2500, 2));
    let (a_id, b_id) = (a.id(), b.id());
    sender.enqueue(a, false).unwrap();
    assert_eq!(sender.enqueue(b, true).unwrap(), 0);

    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameCancel, a_id));
    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameSent, b_id));
    let got = next(&mut frames).await;
    assert_eq!(got.bytes, pattern(2500, 2));
    assert!(got.is_flush);

    sender.stop();
    reader.stop();
    sender.join().await;
    reader.join().await;
    sender.dispose().unwrap();
    reader.dispose().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_frame_expires_after_max_latency() {
    let sim = channel_pair(SimulatorConfig::lossy(1.0, 2), SimulatorConfig::default());
    let latency = Duration::from_millis(40);
    let network_latency = Duration::from_millis(15);
    let cfg = StreamConfig {
        max_latency: latency,
        max_network_latency: network_latency,
        ..config(1000)
    };
    let (mut sender, mut statuses) = start_sender(cfg, sim.sender.clone());

    let started = Instant::now();
    let frame = FrameBuffer::from_vec(pattern(1000, 0));
    let id = frame.id();
    sender.enqueue(frame, false).unwrap();

    assert_eq!(next(&mut statuses).await, (SenderStatus::FrameCancel, id));
    let elapsed = started.elapsed();
    assert!(elapsed >= latency, "{elapsed:?}");
    assert!(elapsed < latency + network_latency, "{elapsed:?}");

    // One datagram per round, one round per retransmit interval.
    let sent = sim.data_stats.sent();
    assert!((2..=3).contains(&sent), "{sent} datagrams");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.data_stats.sent(), sent);

    let monitoring = sender.monitoring(Duration::from_secs(1)).unwrap();
    assert_eq!(u64::from(monitoring.packets_sent), sent);
    assert_eq!(monitoring.frames_dropped, 1);
    assert_eq!(monitoring.bytes_dropped, 1000);

    sender.stop();
    sender.join().await;
    sender.dispose().unwrap();
}

// ---------------------------------------------------------------------------
// Reader only, fed with hand-made fragments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reader_grows_buffer_for_large_frame() {
    let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
    let (tx, mut events) = unbounded_channel();
    let mut reader = StreamReader::start(
        config(1000),
        sim.reader.clone(),
        FrameBuffer::with_capacity(4096),
        move |event| {
            let cause = event.cause();
            let (reply, detail) = match event {
                ReaderEvent::FrameTooSmall { required, .. } => {
                    (Some(FrameBuffer::with_capacity(8192)), required)
                }
                ReaderEvent::FrameComplete { frame, .. } => {
                    let used = frame.used_size();
                    assert_eq!(frame.into_vec(), pattern(5000, 9));
                    (Some(FrameBuffer::with_capacity(8192)), used)
                }
                ReaderEvent::CopyComplete { previous } => (None, previous.capacity()),
                ReaderEvent::Cancel { buffer } => (None, buffer.capacity()),
            };
            let _ = tx.send((cause, detail));
            reply
        },
    )
    .unwrap();

    let frame = pattern(5000, 9);
    for (i, chunk) in frame.chunks(1000).enumerate() {
        sim.sender
            .data
            .send(&fragment(1, i as u8, 5, chunk))
            .await
            .unwrap();
    }

    assert_eq!(next(&mut events).await, (ReaderCause::FrameTooSmall, 5000));
    assert_eq!(next(&mut events).await, (ReaderCause::CopyComplete, 4096));
    assert_eq!(next(&mut events).await, (ReaderCause::FrameComplete, 5000));

    reader.stop();
    reader.join().await;
    assert_eq!(next(&mut events).await, (ReaderCause::Cancel, 8192));
    reader.dispose().unwrap();
}

#[tokio::test]
async fn reader_reports_skipped_frames() {
    let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
    let (mut reader, mut frames) = start_reader(config(100), sim.reader.clone(), 1024);
    let data = &sim.sender.data;

    data.send(&fragment(1, 0, 1, b"one")).await.unwrap();
    assert_eq!(next(&mut frames).await.bytes, b"one");

    // Frame 2 starts but never completes; frame 3 overtakes it.
    data.send(&fragment(2, 0, 2, &[0u8; 100])).await.unwrap();
    data.send(&fragment(3, 0, 1, b"three")).await.unwrap();
    let got = next(&mut frames).await;
    assert_eq!(got.bytes, b"three");
    assert_eq!(got.skipped, 1);

    // Late fragment of frame 2 is stale and changes nothing.
    data.send(&fragment(2, 1, 2, b"late")).await.unwrap();
    data.send(&fragment(6, 0, 1, b"six")).await.unwrap();
    let got = next(&mut frames).await;
    assert_eq!(got.bytes, b"six");
    assert_eq!(got.skipped, 2);

    reader.stop();
    reader.join().await;
    reader.dispose().unwrap();
}

#[tokio::test]
async fn reader_survives_malformed_packets() {
    let sim = channel_pair(SimulatorConfig::default(), SimulatorConfig::default());
    let (mut reader, mut frames) = start_reader(config(100), sim.reader.clone(), 1024);
    let data = &sim.sender.data;

    data.send(b"garbage").await.unwrap();
    let mut corrupt = fragment(1, 0, 1, b"payload");
    corrupt[3] ^= 0x40;
    data.send(&corrupt).await.unwrap();
    // Index past the announced count.
    data.send(&fragment(1, 4, 2, b"x")).await.unwrap();

    data.send(&fragment(1, 0, 1, b"good")).await.unwrap();
    let got = next(&mut frames).await;
    assert_eq!(got.bytes, b"good");
    assert!(!got.is_flush);

    reader.stop();
    reader.join().await;
    reader.dispose().unwrap();
}
