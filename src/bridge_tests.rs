// Tests for the capture and drain pumps using in-memory channels

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::bridge::{BridgeController, BridgeHandle, PumpExit, PumpKind, PumpState};
use crate::channel::{FrameSink, FrameSource};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ChannelError, StoreError};
use crate::frame::Frame;
use crate::queue::DurableQueue;

const WAIT: Duration = Duration::from_secs(5);

/// Yields whatever the test pushes; waits forever once the script is empty.
struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<Result<Frame, ChannelError>>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Records every frame it is asked to send. With `fail` set to
/// `(errno, n)`, the first `n` sends fail with that errno instead.
struct RecordingSink {
    tx: mpsc::UnboundedSender<Frame>,
    fail: Option<(i32, usize)>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        if let Some((errno, left)) = self.fail.as_mut() {
            if *left > 0 {
                *left -= 1;
                return Err(ChannelError::from_io(io::Error::from_raw_os_error(*errno)));
            }
        }
        let _ = self.tx.send(frame.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    queue: DurableQueue,
    source_tx: mpsc::UnboundedSender<Result<Frame, ChannelError>>,
    sent_rx: mpsc::UnboundedReceiver<Frame>,
    handle: BridgeHandle,
}

fn frame(bytes: &[u8]) -> Frame {
    Frame::copy_from_slice(bytes).unwrap()
}

fn start_with(dir: TempDir, poll_interval: Duration, fail: Option<(i32, usize)>) -> Harness {
    let path = dir.path().join("packets.db");
    let queue = DurableQueue::initialize(&path).expect("Should open store");
    let config = BridgeConfig::new("test0", &path).with_poll_interval(poll_interval);

    let (source_tx, rx) = mpsc::unbounded_channel();
    let (tx, sent_rx) = mpsc::unbounded_channel();
    let handle = BridgeController::new(config, queue.clone()).start(
        ScriptedSource { rx },
        RecordingSink { tx, fail },
    );

    Harness {
        _dir: dir,
        path,
        queue,
        source_tx,
        sent_rx,
        handle,
    }
}

fn start(poll_interval: Duration) -> Harness {
    start_with(TempDir::new().unwrap(), poll_interval, None)
}

async fn next_sent(h: &mut Harness) -> Frame {
    timeout(WAIT, h.sent_rx.recv())
        .await
        .expect("timed out waiting for a drained frame")
        .expect("sink closed")
}

async fn wait_for_len(queue: &DurableQueue, expected: usize) {
    timeout(WAIT, async {
        while queue.len().unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("store never reached {} entries", expected));
}

#[tokio::test]
async fn test_drains_existing_entries_in_order() {
    let dir = TempDir::new().unwrap();
    {
        let queue = DurableQueue::initialize(dir.path().join("packets.db")).unwrap();
        queue.enqueue(&frame(&[0xA1, 0xA2, 0xA3])).unwrap();
        queue.enqueue(&frame(&[0xB0; 10])).unwrap();
    }

    let mut h = start_with(dir, Duration::from_millis(20), None);
    assert_eq!(next_sent(&mut h).await.as_bytes(), &[0xA1, 0xA2, 0xA3]);
    assert_eq!(next_sent(&mut h).await.as_bytes(), &[0xB0; 10]);
    wait_for_len(&h.queue, 0).await;

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.stats.drained, 2);
    assert_eq!(report.stats.drain_bytes, 13);
}

#[tokio::test]
async fn test_captured_frames_are_relayed_in_order() {
    let mut h = start(Duration::from_millis(20));
    let frames: Vec<Vec<u8>> = (1u8..=50).map(|i| vec![i; (i as usize % 7) + 1]).collect();
    for f in &frames {
        h.source_tx.send(Ok(frame(f))).unwrap();
    }

    for expected in &frames {
        let got = next_sent(&mut h).await;
        assert_eq!(got.as_bytes(), expected.as_slice(), "frames must be relayed in capture order");
    }
    wait_for_len(&h.queue, 0).await;

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert_eq!(report.stats.captured, 50);
    assert_eq!(report.stats.drained, 50);
}

#[tokio::test]
async fn test_idle_drain_wakes_on_enqueue() {
    // Poll interval far beyond the test timeout: only the enqueue notification can wake drain
    let mut h = start(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.state(PumpKind::Drain), PumpState::Running);

    h.source_tx.send(Ok(frame(b"late arrival"))).unwrap();
    let got = next_sent(&mut h).await;
    assert_eq!(got.as_bytes(), b"late arrival");

    h.handle.shutdown();
    h.handle.join().await;
}

#[tokio::test]
async fn test_external_enqueue_wakes_drain() {
    let mut h = start(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.queue.enqueue(&frame(b"direct")).unwrap();
    assert_eq!(next_sent(&mut h).await.as_bytes(), b"direct");

    h.handle.shutdown();
    h.handle.join().await;
}

#[tokio::test]
async fn test_shutdown_stops_both_pumps() {
    let mut h = start(Duration::from_millis(20));
    assert_eq!(h.handle.state(PumpKind::Capture), PumpState::Running);
    assert_eq!(h.handle.state(PumpKind::Drain), PumpState::Running);

    h.handle.shutdown();
    timeout(WAIT, h.handle.all_stopped()).await.expect("pumps should stop");
    assert_eq!(h.handle.state(PumpKind::Capture), PumpState::Stopped);
    assert_eq!(h.handle.state(PumpKind::Drain), PumpState::Stopped);

    let report = h.handle.join().await;
    assert!(matches!(report.capture, PumpExit::Shutdown));
    assert!(matches!(report.drain, PumpExit::Shutdown));
}

#[tokio::test]
async fn test_send_failure_keeps_entry_and_capture_running() {
    let dir = TempDir::new().unwrap();
    let mut h = start_with(dir, Duration::from_millis(20), Some((libc::EINVAL, usize::MAX)));

    h.source_tx.send(Ok(frame(b"first"))).unwrap();
    timeout(WAIT, h.handle.stopped(PumpKind::Drain)).await.expect("drain should stop");
    assert_eq!(h.handle.state(PumpKind::Capture), PumpState::Running, "capture keeps buffering");

    h.source_tx.send(Ok(frame(b"second"))).unwrap();
    h.source_tx.send(Ok(frame(b"third"))).unwrap();
    wait_for_len(&h.queue, 3).await;

    let oldest = h.queue.peek_oldest().unwrap().expect("undelivered frame is kept");
    assert_eq!(oldest.frame.as_bytes(), b"first");

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(matches!(report.drain, PumpExit::Failed(BridgeError::Channel(ChannelError::Io(_)))));
    assert!(matches!(report.capture, PumpExit::Shutdown));
    assert_eq!(report.stats.drained, 0);
}

#[tokio::test]
async fn test_device_loss_stops_whole_bridge() {
    let mut h = start(Duration::from_millis(20));
    h.source_tx
        .send(Err(ChannelError::DeviceLost("interface removed".into())))
        .unwrap();

    timeout(WAIT, h.handle.all_stopped()).await.expect("device loss should stop both pumps");
    let report = h.handle.join().await;
    assert!(!report.is_clean());
    assert!(report.capture.is_failure());
    assert!(matches!(report.drain, PumpExit::Shutdown));
}

#[tokio::test]
async fn test_capture_read_error_leaves_drain_running() {
    let mut h = start(Duration::from_millis(20));
    h.source_tx
        .send(Err(ChannelError::Io(io::Error::from_raw_os_error(libc::EINVAL))))
        .unwrap();

    timeout(WAIT, h.handle.stopped(PumpKind::Capture)).await.expect("capture should stop");
    assert_eq!(h.handle.state(PumpKind::Drain), PumpState::Running);

    h.queue.enqueue(&frame(b"from another writer")).unwrap();
    assert_eq!(next_sent(&mut h).await.as_bytes(), b"from another writer");

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.capture.is_failure());
    assert!(!report.drain.is_failure());
}

#[tokio::test]
async fn test_invalid_stored_row_is_dropped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("packets.db");
    {
        let queue = DurableQueue::initialize(&path).unwrap();
        drop(queue);
        let conn = Connection::open(&path).unwrap();
        conn.execute("INSERT INTO packets (data) VALUES (?1)", [&b""[..]]).unwrap();
        conn.execute("INSERT INTO packets (data) VALUES (?1)", [&b"valid"[..]]).unwrap();
    }

    let mut h = start_with(dir, Duration::from_millis(20), None);
    assert_eq!(next_sent(&mut h).await.as_bytes(), b"valid");
    wait_for_len(&h.queue, 0).await;

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert_eq!(report.stats.corrupt_dropped, 1);
    assert_eq!(report.stats.drained, 1);
}

#[tokio::test]
async fn test_transient_send_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let mut h = start_with(dir, Duration::from_millis(20), Some((libc::ENOBUFS, 2)));

    h.source_tx.send(Ok(frame(b"after ENOBUFS"))).unwrap();
    assert_eq!(next_sent(&mut h).await.as_bytes(), b"after ENOBUFS");
    wait_for_len(&h.queue, 0).await;
    assert_eq!(h.handle.state(PumpKind::Drain), PumpState::Running);
    assert_eq!(h.handle.stats().channel_retries, 2);

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.stats.drained, 1);
}

#[tokio::test]
async fn test_persistent_transient_send_failure_stops_drain() {
    let dir = TempDir::new().unwrap();
    let mut h = start_with(dir, Duration::from_millis(20), Some((libc::ENOBUFS, usize::MAX)));

    h.source_tx.send(Ok(frame(b"never sent"))).unwrap();
    timeout(WAIT, h.handle.stopped(PumpKind::Drain)).await.expect("drain should give up");
    assert_eq!(h.handle.state(PumpKind::Capture), PumpState::Running);
    assert_eq!(h.queue.len().unwrap(), 1, "undelivered frame is kept");

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.drain.is_failure());
    // Default policy allows 5 attempts
    assert_eq!(report.stats.channel_retries, 4);
}

#[tokio::test]
async fn test_transient_read_error_is_retried() {
    let mut h = start(Duration::from_millis(20));
    h.source_tx
        .send(Err(ChannelError::Io(io::Error::from_raw_os_error(libc::ENOMEM))))
        .unwrap();
    h.source_tx.send(Ok(frame(b"after ENOMEM"))).unwrap();

    assert_eq!(next_sent(&mut h).await.as_bytes(), b"after ENOMEM");
    assert_eq!(h.handle.state(PumpKind::Capture), PumpState::Running);

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.stats.channel_retries, 1);
    assert_eq!(report.stats.captured, 1);
}

#[tokio::test]
async fn test_enqueue_failure_stops_whole_bridge() {
    // Long poll interval keeps drain idle until shutdown wakes it
    let mut h = start(Duration::from_secs(60));
    {
        let conn = Connection::open(&h.path).unwrap();
        conn.busy_timeout(Duration::from_secs(1)).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_insert BEFORE INSERT ON packets \
             BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;",
        )
        .unwrap();
    }

    h.source_tx.send(Ok(frame(b"cannot be stored"))).unwrap();
    timeout(WAIT, h.handle.all_stopped()).await.expect("store failure should stop both pumps");

    let report = h.handle.join().await;
    assert!(
        matches!(report.capture, PumpExit::Failed(BridgeError::Store(StoreError::Sqlite(_)))),
        "capture: {:?}",
        report.capture
    );
    assert!(matches!(report.drain, PumpExit::Shutdown), "drain: {:?}", report.drain);
    assert_eq!(report.stats.captured, 0);
    assert_eq!(report.stats.store_retries, 0, "constraint failures are not retried");
}

#[tokio::test]
async fn test_drain_store_failure_stops_whole_bridge() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("packets.db");
    let queue = DurableQueue::initialize(&path).unwrap();
    Connection::open(&path).unwrap().execute_batch("DROP TABLE packets;").unwrap();

    let (_source_tx, rx) = mpsc::unbounded_channel();
    let (tx, _sent_rx) = mpsc::unbounded_channel();
    let config = BridgeConfig::new("test0", &path).with_poll_interval(Duration::from_millis(20));
    let mut handle = BridgeController::new(config, queue).start(
        ScriptedSource { rx },
        RecordingSink { tx, fail: None },
    );

    timeout(WAIT, handle.all_stopped()).await.expect("store failure should stop both pumps");
    let report = handle.join().await;
    assert!(
        matches!(report.drain, PumpExit::Failed(BridgeError::Store(_))),
        "drain: {:?}",
        report.drain
    );
    assert!(matches!(report.capture, PumpExit::Shutdown), "capture: {:?}", report.capture);
}

#[tokio::test]
async fn test_locked_store_is_retried() {
    let mut h = start(Duration::from_secs(60));

    let (locked_tx, locked_rx) = oneshot::channel();
    let path = h.path.clone();
    let locker = std::thread::spawn(move || {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        locked_tx.send(()).unwrap();
        // Longer than one busy timeout, shorter than the whole retry budget
        std::thread::sleep(Duration::from_millis(600));
        conn.execute_batch("COMMIT;").unwrap();
    });
    locked_rx.await.unwrap();

    h.source_tx.send(Ok(frame(b"waited for lock"))).unwrap();
    assert_eq!(next_sent(&mut h).await.as_bytes(), b"waited for lock");
    locker.join().unwrap();
    wait_for_len(&h.queue, 0).await;

    h.handle.shutdown();
    let report = h.handle.join().await;
    assert!(report.is_clean(), "report: {:?}", report);
    assert!(report.stats.store_retries >= 1, "stats: {:?}", report.stats);
    assert_eq!(report.stats.captured, 1);
}
