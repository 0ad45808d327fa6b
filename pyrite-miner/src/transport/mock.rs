//! Scripted transport for unit tests and bus simulation.

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use bytes::BytesMut;

use super::Transport;

/// Emulates a serial port: reads come from pre-queued chunks, delivered
/// one chunk per poll so partial-frame arrival is easy to script; writes
/// are captured for inspection.
#[derive(Debug, Default)]
pub struct MockTransport {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    baud_history: Vec<u32>,
    clear_count: usize,
    fail_io: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a chunk to be returned by one future `recv_available` call.
    pub fn queue_read(&mut self, chunk: &[u8]) {
        self.reads.push_back(chunk.to_vec());
    }

    /// Everything sent so far, in order.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Drain the captured writes.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// Baud rates applied to the local port, in order.
    pub fn baud_history(&self) -> &[u32] {
        &self.baud_history
    }

    /// How many times the input buffer was cleared.
    pub fn clear_count(&self) -> usize {
        self.clear_count
    }

    /// Make every subsequent I/O call fail, simulating a lost connection.
    pub fn set_fail_io(&mut self, fail: bool) {
        self.fail_io = fail;
    }

    fn check_io(&self) -> io::Result<()> {
        if self.fail_io {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated connection loss",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.check_io()?;
        self.written.extend_from_slice(frame);
        Ok(())
    }

    async fn recv_available(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.check_io()?;
        match self.reads.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    async fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.check_io()?;
        self.baud_history.push(baud);
        Ok(())
    }

    async fn clear(&mut self) -> io::Result<()> {
        self.check_io()?;
        self.clear_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_one_chunk_per_poll() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[1, 2, 3]);
        mock.queue_read(&[4]);

        let mut buf = BytesMut::new();
        assert_eq!(mock.recv_available(&mut buf).await.unwrap(), 3);
        assert_eq!(mock.recv_available(&mut buf).await.unwrap(), 1);
        assert_eq!(mock.recv_available(&mut buf).await.unwrap(), 0);
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn captures_writes_in_order() {
        let mut mock = MockTransport::new();
        mock.send(&[0x55, 0xaa]).await.unwrap();
        mock.send(&[0x03]).await.unwrap();

        assert_eq!(mock.written(), &[0x55, 0xaa, 0x03]);
        assert_eq!(mock.take_written(), vec![0x55, 0xaa, 0x03]);
        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn simulated_failure_hits_all_operations() {
        let mut mock = MockTransport::new();
        mock.set_fail_io(true);

        let mut buf = BytesMut::new();
        assert!(mock.send(&[0]).await.is_err());
        assert!(mock.recv_available(&mut buf).await.is_err());
        assert!(mock.set_baud(115_200).await.is_err());
        assert!(mock.clear().await.is_err());
    }
}
