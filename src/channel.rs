//! Frame-oriented view of a virtual interface.
//!
//! The capture pump owns a [`FrameSource`] and the drain pump owns a
//! [`FrameSink`]; a device is split into the two halves so that blocking in
//! one direction never holds up the other.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::frame::Frame;

#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. Each call yields exactly what one device
    /// read delivered.
    async fn receive(&mut self) -> Result<Frame, ChannelError>;
}

#[async_trait]
pub trait FrameSink: Send {
    /// Write the whole frame, continuing after short writes.
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError>;
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        (**self).receive().await
    }
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        (**self).send(frame).await
    }
}
