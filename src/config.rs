use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BridgeError;
use crate::frame::MAX_FRAME_LEN;

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;

/// Linux interface names are limited to IFNAMSIZ - 1 bytes.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Link-layer framing of the virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Point-to-point, IP packets with no link header.
    #[default]
    Tun,
    /// Ethernet frames with a link header.
    Tap,
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingMode::Tun => f.write_str("tun"),
            FramingMode::Tap => f.write_str("tap"),
        }
    }
}

/// Bounded retry for transient store and interface failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Everything the bridge needs to know, passed explicitly at construction.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub interface: String,
    pub mode: FramingMode,
    pub store_path: PathBuf,
    pub debug: bool,
    /// Upper bound on how long an idle drain pump sleeps before re-checking
    /// the store.
    pub poll_interval: Duration,
    /// Longest device read accepted as one frame. Longer reads are dropped
    /// rather than stored cut short.
    pub read_buffer_len: usize,
    pub retry: RetryPolicy,
}

impl BridgeConfig {
    pub fn new(interface: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            mode: FramingMode::default(),
            store_path: store_path.into(),
            debug: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_buffer_len: MAX_FRAME_LEN,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_mode(mut self, mode: FramingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_read_buffer_len(mut self, len: usize) -> Self {
        self.read_buffer_len = len.clamp(1, MAX_FRAME_LEN);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.interface.is_empty() {
            return Err(BridgeError::Config("interface name must not be empty".into()));
        }
        if self.interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(BridgeError::Config(format!(
                "interface name {:?} is longer than {} bytes",
                self.interface, MAX_INTERFACE_NAME_LEN
            )));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(BridgeError::Config("store path must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(BridgeError::Config("poll interval must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(BridgeError::Config("retry policy needs at least one attempt".into()));
        }
        Ok(())
    }
}
