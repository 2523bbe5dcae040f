//! Client socket handles and line framing.
//!
//! A connection is split in two once it is accepted:
//! - the session thread keeps a `LineReader` over a clone of the socket
//! - the `Connection` write handle travels with the LOGIN command and then
//!   lives in the client record, where workers use it to deliver replies

use crate::protocol::Reply;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Size of a single socket read.
const READ_CHUNK: usize = 512;

/// Write side of a client connection.
///
/// Writes from different threads (the session answering a parse error, a
/// worker answering a command) are serialized by the inner mutex.
#[derive(Debug)]
pub struct Connection {
    stream: Mutex<TcpStream>,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Mutex::new(stream),
            peer,
            closed: AtomicBool::new(false),
        }
    }

    /// Address of the remote end, if it was known at accept time.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Write raw bytes to the client.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        let mut stream = self.stream.lock();
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Write a reply followed by its line terminator.
    pub fn send_reply(&self, reply: &Reply) -> io::Result<()> {
        trace!(key = reply.key, body = %reply.body, "Sending reply");
        self.send(&reply.to_bytes())
    }

    /// Shut the socket down in both directions.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.stream.lock().shutdown(Shutdown::Both) {
            // The peer may already be gone.
            debug!(peer = ?self.peer, error = %e, "Shutdown failed");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Splits a byte stream into `\n`-terminated lines of bounded length.
pub struct LineReader<R> {
    inner: R,
    buffer: BytesMut,
    max_line: usize,
}

impl<R: Read> LineReader<R> {
    /// Create a reader rejecting lines longer than `max_line` bytes,
    /// terminator excluded.
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(max_line + 1),
            max_line,
        }
    }

    /// Read the next line, terminator included.
    ///
    /// Returns `Ok(None)` at end of stream. A final line without terminator
    /// is still returned. An over-long line is an `InvalidData` error; the
    /// stream cannot be resynchronized after it.
    pub fn read_line(&mut self) -> io::Result<Option<BytesMut>> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if pos > self.max_line {
                    return Err(line_too_long(pos, self.max_line));
                }
                return Ok(Some(self.buffer.split_to(pos + 1)));
            }

            if self.buffer.len() > self.max_line {
                return Err(line_too_long(self.buffer.len(), self.max_line));
            }

            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buffer.split()));
            }

            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

fn line_too_long(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line too long ({len} > {max} bytes)"),
    )
}

/// Loopback socket pair for tests: (server side, client side).
#[cfg(test)]
pub(crate) fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_lines() {
        let mut reader = LineReader::new(Cursor::new(b"LOGIN a\r\nRDV\nTIMELINE".to_vec()), 256);
        assert_eq!(&reader.read_line().unwrap().unwrap()[..], b"LOGIN a\r\n");
        assert_eq!(&reader.read_line().unwrap().unwrap()[..], b"RDV\n");
        assert_eq!(&reader.read_line().unwrap().unwrap()[..], b"TIMELINE");
        assert!(reader.read_line().unwrap().is_none());
    }

    #[test]
    fn test_line_too_long() {
        let mut data = vec![b'x'; 300];
        data.push(b'\n');
        let mut reader = LineReader::new(Cursor::new(data), 256);
        let err = reader.read_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_line_at_limit() {
        let mut data = vec![b'x'; 256];
        data.push(b'\n');
        let mut reader = LineReader::new(Cursor::new(data), 256);
        assert_eq!(reader.read_line().unwrap().unwrap().len(), 257);
    }

    #[test]
    fn test_send_and_close_once() {
        let (server, client) = socket_pair();
        let conn = Connection::new(server);
        conn.send_reply(&Reply::new(1, "hello")).unwrap();

        let mut reader = LineReader::new(client, 256);
        assert_eq!(&reader.read_line().unwrap().unwrap()[..], b"hello\n");

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(conn.send(b"late\n").is_err());

        // The client observes end of stream.
        assert!(reader.read_line().unwrap().is_none());
    }
}
