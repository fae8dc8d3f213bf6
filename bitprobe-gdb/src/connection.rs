//! The byte stream the server speaks over.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A bidirectional byte stream with a polled read side.
///
/// The single-threaded server never blocks indefinitely on input: the wait
/// loop polls for an interrupt byte while the target runs, so reads take a
/// timeout and report `None` when nothing arrived.
pub trait Connection {
    /// Read one byte, waiting at most `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>>;
    /// Queue bytes for transmission.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Push queued bytes out.
    fn flush(&mut self) -> io::Result<()>;
}

/// A [`Connection`] over a TCP stream, the usual host-side transport.
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Connection for TcpConnection {
    fn read_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        self.stream.set_read_timeout(Some(timeout))?;

        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
            Ok(_) => Ok(Some(byte[0])),
            Err(error)
                if error.kind() == io::ErrorKind::WouldBlock
                    || error.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// An in-memory connection for driving the server in tests.
#[derive(Debug, Default)]
pub struct LoopbackConnection {
    /// Bytes the "host" has queued for the server.
    pub input: std::collections::VecDeque<u8>,
    /// Everything the server sent.
    pub output: Vec<u8>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue host-to-server bytes.
    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }
}

impl Connection for LoopbackConnection {
    fn read_byte(&mut self, _timeout: Duration) -> io::Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
