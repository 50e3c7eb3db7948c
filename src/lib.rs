//! Sparrow packet bridge library
//!
//! Relays frames between a TUN/TAP interface and a durable SQLite queue so
//! that traffic can be carried across a link that is not always connected,
//! such as a storage medium moved between two machines.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod queue;
pub mod retry;
pub mod tun_adapter;

pub use bridge::{BridgeController, BridgeHandle, BridgeReport, PumpExit, PumpKind, PumpState};
pub use channel::{FrameSink, FrameSource};
pub use config::{BridgeConfig, FramingMode, RetryPolicy};
pub use error::{BridgeError, ChannelError, FrameError, StoreError};
pub use frame::{Frame, MAX_FRAME_LEN};
pub use queue::{DurableQueue, EntryId, QueueEntry};
pub use tun_adapter::TunChannel;
