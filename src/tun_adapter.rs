use std::io::{self, ErrorKind};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tun::{AsyncDevice, Configuration, Layer};

use crate::channel::{FrameSink, FrameSource};
use crate::config::FramingMode;
use crate::error::ChannelError;
use crate::frame::{Frame, MAX_FRAME_LEN};

#[cfg(test)]
#[path = "tun_adapter_tests.rs"]
mod tun_adapter_tests;

pub type TunReader = DeviceReader<ReadHalf<AsyncDevice>>;
pub type TunWriter = DeviceWriter<WriteHalf<AsyncDevice>>;

/// An opened TUN/TAP interface.
pub struct TunChannel {
    dev: AsyncDevice,
    name: String,
    mode: FramingMode,
    read_buffer_len: usize,
}

impl TunChannel {
    /// Create the interface, or attach to an existing one with the same name.
    /// Must be called from within a tokio runtime.
    pub fn open(name: &str, mode: FramingMode, read_buffer_len: usize) -> Result<Self, ChannelError> {
        let layer = match mode {
            FramingMode::Tun => Layer::L3,
            FramingMode::Tap => Layer::L2,
        };
        let mut config = Configuration::default();
        config.name(name).layer(layer);
        #[cfg(target_os = "linux")]
        {
            config.platform(|platform| {
                platform.packet_information(false); // IFF_NO_PI
            });
        }
        let dev = tun::create_as_async(&config).map_err(|source| ChannelError::Device {
            name: name.to_string(),
            source,
        })?;
        tracing::debug!(interface = %name, mode = %mode, "Connected to interface");
        Ok(Self {
            dev,
            name: name.to_string(),
            mode,
            read_buffer_len: read_buffer_len.clamp(1, MAX_FRAME_LEN),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (TunReader, TunWriter) {
        let (rd, wr) = tokio::io::split(self.dev);
        (
            DeviceReader::new(rd, self.read_buffer_len),
            DeviceWriter::new(wr),
        )
    }
}

/// Reads one frame per device read.
pub struct DeviceReader<R> {
    inner: R,
    // One byte past `limit`, so a read that filled it is known to be too long
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin + Send> DeviceReader<R> {
    pub fn new(inner: R, read_buffer_len: usize) -> Self {
        let limit = read_buffer_len.clamp(1, MAX_FRAME_LEN);
        Self {
            inner,
            buf: vec![0u8; limit + 1],
            limit,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for DeviceReader<R> {
    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        loop {
            match self.inner.read(&mut self.buf).await {
                Ok(0) => {
                    return Err(ChannelError::DeviceLost("end of stream on read".into()));
                }
                Ok(n) if n > self.limit => {
                    tracing::warn!(
                        at_least = n,
                        limit = self.limit,
                        "Dropping device read longer than the read buffer"
                    );
                    continue;
                }
                Ok(n) => return Ok(Frame::copy_from_slice(&self.buf[..n])?),
                Err(e) if is_retryable(&e) => continue,
                Err(e) => return Err(ChannelError::from_io(e)),
            }
        }
    }
}

/// Writes whole frames, resuming after short writes.
pub struct DeviceWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> DeviceWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for DeviceWriter<W> {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let data = frame.as_bytes();
        let mut written = 0;
        while written < data.len() {
            match self.inner.write(&data[written..]).await {
                Ok(0) => {
                    return Err(ChannelError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "interface accepted zero bytes",
                    )));
                }
                Ok(n) => {
                    if written + n < data.len() {
                        tracing::trace!(written = written + n, total = data.len(), "Short write to interface");
                    }
                    written += n;
                }
                Err(e) if is_retryable(&e) => continue,
                Err(e) => return Err(ChannelError::from_io(e)),
            }
        }
        self.inner.flush().await.map_err(ChannelError::from_io)?;
        Ok(())
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}
