//! Bidirectional bridge between a frame channel and the durable queue.
//!
//! Two pumps run as independent tasks and share nothing but the queue:
//!
//! - **capture** receives frames from the interface and appends them to the
//!   queue tail;
//! - **drain** takes the oldest entry, writes it to the interface and only
//!   then removes it, so a crash between send and remove redelivers the
//!   frame rather than losing it.
//!
//! A transient interface or store error is retried under the configured
//! [`RetryPolicy`] before the pump gives up on it.
//!
//! Each pump moves `Running -> Stopping -> Stopped`. A shutdown request is
//! observed between operations; an enqueue or a send+remove pair already
//! started is always carried to completion first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{FrameSink, FrameSource};
use crate::config::{BridgeConfig, RetryPolicy};
use crate::error::{BridgeError, ChannelError, StoreError};
use crate::frame::Frame;
use crate::queue::{DurableQueue, EntryId, QueueEntry};
use crate::retry::{retry_store, Attempts};

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod bridge_tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpKind {
    Capture,
    Drain,
}

impl fmt::Display for PumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpKind::Capture => f.write_str("capture"),
            PumpKind::Drain => f.write_str("drain"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Running,
    Stopping,
    Stopped,
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    Shutdown,
    Failed(BridgeError),
}

impl PumpExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpExit::Failed(_))
    }
}

/// Per-direction counters
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub captured: AtomicU64,
    pub capture_bytes: AtomicU64,
    pub drained: AtomicU64,
    pub drain_bytes: AtomicU64,
    pub store_retries: AtomicU64,
    /// Interface reads and writes repeated after a transient error
    pub channel_retries: AtomicU64,
    /// Removes that found the entry already gone
    pub redundant_removes: AtomicU64,
    /// Stored rows that did not hold a valid frame and were dropped
    pub corrupt_dropped: AtomicU64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            capture_bytes: self.capture_bytes.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            drain_bytes: self.drain_bytes.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            channel_retries: self.channel_retries.load(Ordering::Relaxed),
            redundant_removes: self.redundant_removes.load(Ordering::Relaxed),
            corrupt_dropped: self.corrupt_dropped.load(Ordering::Relaxed),
        }
    }

    fn record_captured(&self, bytes: usize) -> u64 {
        self.capture_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.captured.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_drained(&self, bytes: usize) -> u64 {
        self.drain_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.drained.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub capture_bytes: u64,
    pub drained: u64,
    pub drain_bytes: u64,
    pub store_retries: u64,
    pub channel_retries: u64,
    pub redundant_removes: u64,
    pub corrupt_dropped: u64,
}

/// Final outcome of both pumps.
#[derive(Debug)]
pub struct BridgeReport {
    pub capture: PumpExit,
    pub drain: PumpExit,
    pub stats: StatsSnapshot,
}

impl BridgeReport {
    pub fn is_clean(&self) -> bool {
        !self.capture.is_failure() && !self.drain.is_failure()
    }
}

pub struct BridgeController {
    config: BridgeConfig,
    queue: DurableQueue,
    stats: Arc<BridgeStats>,
}

impl BridgeController {
    pub fn new(config: BridgeConfig, queue: DurableQueue) -> Self {
        Self {
            config,
            queue,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    /// Spawn both pumps. Must be called from within a tokio runtime.
    pub fn start<S, K>(self, source: S, sink: K) -> BridgeHandle
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (capture_state_tx, capture_state) = watch::channel(PumpState::Running);
        let (drain_state_tx, drain_state) = watch::channel(PumpState::Running);

        let pump = |kind, state| Pump {
            kind,
            queue: self.queue.clone(),
            retry: self.config.retry,
            poll_interval: self.config.poll_interval,
            stats: self.stats.clone(),
            state,
            shutdown: shutdown_rx.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let capture_pump = pump(PumpKind::Capture, capture_state_tx);
        let drain_pump = pump(PumpKind::Drain, drain_state_tx);

        tracing::info!(
            interface = %self.config.interface,
            store = %self.config.store_path.display(),
            "Bridge started"
        );

        BridgeHandle {
            capture: tokio::spawn(capture_pump.run_capture(source)),
            drain: tokio::spawn(drain_pump.run_drain(sink)),
            shutdown_tx,
            capture_state,
            drain_state,
            stats: self.stats,
        }
    }
}

/// Control handle for a running bridge.
pub struct BridgeHandle {
    capture: JoinHandle<PumpExit>,
    drain: JoinHandle<PumpExit>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    capture_state: watch::Receiver<PumpState>,
    drain_state: watch::Receiver<PumpState>,
    stats: Arc<BridgeStats>,
}

impl BridgeHandle {
    /// Ask both pumps to stop once their in-flight operation completes.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!("Bridge shutdown requested");
        }
    }

    pub fn state(&self, kind: PumpKind) -> PumpState {
        match kind {
            PumpKind::Capture => *self.capture_state.borrow(),
            PumpKind::Drain => *self.drain_state.borrow(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolves once the given pump has reached `Stopped`.
    pub async fn stopped(&mut self, kind: PumpKind) {
        let rx = match kind {
            PumpKind::Capture => &mut self.capture_state,
            PumpKind::Drain => &mut self.drain_state,
        };
        let _ = rx.wait_for(|state| *state == PumpState::Stopped).await;
    }

    /// Resolves once both pumps have reached `Stopped`.
    pub async fn all_stopped(&mut self) {
        self.stopped(PumpKind::Capture).await;
        self.stopped(PumpKind::Drain).await;
    }

    /// Wait for both pumps to finish. Does not request shutdown by itself.
    pub async fn join(self) -> BridgeReport {
        let capture = join_pump(PumpKind::Capture, self.capture).await;
        let drain = join_pump(PumpKind::Drain, self.drain).await;
        let stats = self.stats.snapshot();
        tracing::info!(
            captured = stats.captured,
            capture_bytes = stats.capture_bytes,
            drained = stats.drained,
            drain_bytes = stats.drain_bytes,
            store_retries = stats.store_retries,
            channel_retries = stats.channel_retries,
            "Bridge stopped"
        );
        BridgeReport {
            capture,
            drain,
            stats,
        }
    }
}

async fn join_pump(kind: PumpKind, handle: JoinHandle<PumpExit>) -> PumpExit {
    match handle.await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(pump = %kind, error = %e, "Pump task aborted");
            PumpExit::Failed(BridgeError::Pump(e.to_string()))
        }
    }
}

struct Pump {
    kind: PumpKind,
    queue: DurableQueue,
    retry: RetryPolicy,
    poll_interval: std::time::Duration,
    stats: Arc<BridgeStats>,
    state: watch::Sender<PumpState>,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Pump {
    async fn run_capture<S: FrameSource>(mut self, mut source: S) -> PumpExit {
        tracing::debug!(pump = %self.kind, "Pump running");
        let mut attempts = Attempts::new(self.retry);
        let exit = loop {
            let received = {
                let shutdown = &mut self.shutdown;
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => break PumpExit::Shutdown,
                    received = source.receive() => received,
                }
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(e) => {
                    let attempt = attempts.current();
                    match attempts.next_backoff(e.is_transient()) {
                        Some(backoff) => {
                            self.channel_retry(attempt, backoff, &e).await;
                            continue;
                        }
                        None => break self.channel_failed(e),
                    }
                }
            };
            attempts.reset();

            match self.enqueue(&frame).await {
                Ok(id) => {
                    let seq = self.stats.record_captured(frame.len());
                    tracing::debug!(seq, id = %id, bytes = frame.len(), "Captured frame into store");
                }
                Err(e) => break self.store_failed(e),
            }
        };
        drop(source);
        self.finish(exit)
    }

    async fn run_drain<K: FrameSink>(mut self, mut sink: K) -> PumpExit {
        tracing::debug!(pump = %self.kind, "Pump running");
        let exit = loop {
            if *self.shutdown.borrow() {
                break PumpExit::Shutdown;
            }

            let entry = match self.peek_oldest().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.wait_for_entries().await;
                    continue;
                }
                Err(StoreError::Corrupt { id, source }) => {
                    tracing::warn!(id, error = %source, "Dropping stored row that is not a valid frame");
                    match self.remove(EntryId(id)).await {
                        Ok(removed) => {
                            if removed {
                                self.stats.corrupt_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            continue;
                        }
                        Err(e) => break self.store_failed(e),
                    }
                }
                Err(e) => break self.store_failed(e),
            };

            let QueueEntry { id, frame } = entry;
            if let Err(e) = self.send(&mut sink, &frame).await {
                // Entry stays in the store for the next run
                break self.channel_failed(e);
            }

            match self.remove(id).await {
                Ok(removed) => {
                    if !removed {
                        self.stats.redundant_removes.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(id = %id, "Entry was already removed");
                    }
                    let seq = self.stats.record_drained(frame.len());
                    tracing::debug!(seq, id = %id, bytes = frame.len(), "Drained frame to interface");
                }
                Err(e) => break self.store_failed(e),
            }
        };
        drop(sink);
        self.finish(exit)
    }

    /// Sleep until an enqueue, the poll interval, or shutdown.
    async fn wait_for_entries(&mut self) {
        let shutdown = &mut self.shutdown;
        tokio::select! {
            _ = shutdown_requested(shutdown) => {}
            _ = self.queue.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn enqueue(&self, frame: &Frame) -> Result<EntryId, StoreError> {
        let queue = &self.queue;
        retry_store(
            &self.retry,
            "enqueue",
            move || {
                let frame = frame.clone();
                queue.run_blocking(move |q| q.enqueue(&frame))
            },
            |_, _| self.record_retry(),
        )
        .await
    }

    async fn peek_oldest(&self) -> Result<Option<QueueEntry>, StoreError> {
        let queue = &self.queue;
        retry_store(
            &self.retry,
            "peek",
            move || queue.run_blocking(|q| q.peek_oldest()),
            |_, _| self.record_retry(),
        )
        .await
    }

    async fn remove(&self, id: EntryId) -> Result<bool, StoreError> {
        let queue = &self.queue;
        retry_store(
            &self.retry,
            "remove",
            move || queue.run_blocking(move |q| q.remove(id)),
            |_, _| self.record_retry(),
        )
        .await
    }

    async fn send<K: FrameSink>(&self, sink: &mut K, frame: &Frame) -> Result<(), ChannelError> {
        let mut attempts = Attempts::new(self.retry);
        loop {
            let e = match sink.send(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let attempt = attempts.current();
            match attempts.next_backoff(e.is_transient()) {
                Some(backoff) => self.channel_retry(attempt, backoff, &e).await,
                None => return Err(e),
            }
        }
    }

    async fn channel_retry(&self, attempt: u32, backoff: std::time::Duration, err: &ChannelError) {
        tracing::warn!(
            pump = %self.kind,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Transient interface error, retrying"
        );
        self.stats.channel_retries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(backoff).await;
    }

    fn record_retry(&self) {
        self.stats.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn channel_failed(&self, err: ChannelError) -> PumpExit {
        if err.is_device_lost() {
            tracing::error!(pump = %self.kind, error = %err, "Interface lost, stopping bridge");
            self.request_bridge_shutdown();
        } else {
            tracing::error!(pump = %self.kind, error = %err, "Interface error, stopping pump");
        }
        PumpExit::Failed(err.into())
    }

    // Without a working store nothing captured can be kept, so both
    // directions stop.
    fn store_failed(&self, err: StoreError) -> PumpExit {
        tracing::error!(pump = %self.kind, error = %err, "Packet store failed, stopping bridge");
        self.request_bridge_shutdown();
        PumpExit::Failed(err.into())
    }

    fn request_bridge_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn finish(self, exit: PumpExit) -> PumpExit {
        self.state.send_replace(PumpState::Stopping);
        match &exit {
            PumpExit::Shutdown => tracing::debug!(pump = %self.kind, "Pump stopping on request"),
            PumpExit::Failed(e) => tracing::debug!(pump = %self.kind, error = %e, "Pump stopping after failure"),
        }
        self.state.send_replace(PumpState::Stopped);
        tracing::info!(pump = %self.kind, "Pump stopped");
        exit
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
