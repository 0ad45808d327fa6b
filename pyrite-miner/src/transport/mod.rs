//! Byte-stream transport between a chain driver and its serial bus.
//!
//! The driver works against the [`Transport`] trait so that protocol
//! logic is testable without hardware. [`SerialTransport`] is the real
//! thing over a host serial port; [`mock::MockTransport`] is a scripted
//! stand-in for tests.

pub mod mock;

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// Non-blocking byte-stream I/O for one physical bus.
#[async_trait]
pub trait Transport: Send {
    /// Write one complete frame to the bus.
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Drain whatever bytes are currently pending into `buf`, returning
    /// the count. Must return promptly; 0 means nothing was available.
    async fn recv_available(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Reconfigure the local line rate.
    async fn set_baud(&mut self, baud: u32) -> io::Result<()>;

    /// Discard any unread input.
    async fn clear(&mut self) -> io::Result<()>;
}

/// [`Transport`] over a host serial port.
pub struct SerialTransport {
    stream: SerialStream,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let stream = tokio_serial::new(path, baud)
            .open_native_async()
            .map_err(io::Error::other)?;
        Ok(Self { stream })
    }

    pub fn from_stream(stream: SerialStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    async fn recv_available(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        // Poll the read exactly once; report zero instead of waiting when
        // the port has nothing buffered.
        match self.stream.read_buf(buf).now_or_never() {
            Some(result) => result,
            None => Ok(0),
        }
    }

    async fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.stream.set_baud_rate(baud).map_err(io::Error::other)
    }

    async fn clear(&mut self) -> io::Result<()> {
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}
