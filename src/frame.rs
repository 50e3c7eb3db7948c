//! Frame type carried between the interface and the packet store.

use bytes::Bytes;
use std::fmt;

use crate::error::FrameError;

#[cfg(test)]
#[path = "frame_tests.rs"]
mod frame_tests;

/// Largest frame the bridge accepts, bounded by the 16-bit length the
/// tun/tap driver can report for a single read.
pub const MAX_FRAME_LEN: usize = 65535;

/// One opaque link-layer or IP frame. Never empty, never above
/// [`MAX_FRAME_LEN`].
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(FrameError::Empty);
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Copy a frame out of a reusable read buffer.
    pub fn copy_from_slice(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(data.len()));
        }
        Ok(Self {
            payload: Bytes::copy_from_slice(data),
        })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    // A constructed frame is never empty; kept for the usual len/is_empty pair.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
