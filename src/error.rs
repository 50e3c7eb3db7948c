// Error types for the bridge, its device channel and its packet store

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Zero-length frames are not accepted")]
    Empty,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(usize),
}

/// Failures of the virtual interface.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The interface could not be created, opened or configured.
    #[error("Failed to open interface {name}: {source}")]
    Device {
        name: String,
        #[source]
        source: tun::Error,
    },

    /// An unrecoverable read or write error on an open interface.
    #[error("Interface I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The interface is gone (EOF, removed device, closed descriptor).
    #[error("Interface lost: {0}")]
    DeviceLost(String),

    #[error("Invalid frame from interface: {0}")]
    Frame(#[from] FrameError),
}

impl ChannelError {
    /// Whether the error means the whole device is unusable, as opposed to a
    /// failure confined to one direction.
    pub fn is_device_lost(&self) -> bool {
        match self {
            ChannelError::DeviceLost(_) => true,
            ChannelError::Io(e) => is_device_gone(e),
            _ => false,
        }
    }

    /// Resource shortage on the host that is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Io(e) => {
                matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
                    || matches!(e.raw_os_error(), Some(libc::ENOBUFS) | Some(libc::ENOMEM))
            }
            _ => false,
        }
    }

    /// Wrap an I/O error, promoting errnos that mean the device vanished.
    pub fn from_io(err: io::Error) -> Self {
        if is_device_gone(&err) {
            ChannelError::DeviceLost(err.to_string())
        } else {
            ChannelError::Io(err)
        }
    }
}

fn is_device_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EBADF) | Some(libc::EIO)
    )
}

/// Failures of the durable packet store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open packet store {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Packet store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored entry {id} holds an invalid frame: {source}")]
    Corrupt {
        id: i64,
        #[source]
        source: FrameError,
    },

    #[error("Packet store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Lock contention that is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        let err = match self {
            StoreError::Sqlite(e) => e,
            _ => return false,
        };
        matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pump task failed: {0}")]
    Pump(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
