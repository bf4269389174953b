//! Length-prefixed message channel over a duplex Unix stream.
//!
//! Each frame is a 4-byte big-endian length followed by the payload. A
//! connection is not multiplexed: concurrent senders must serialize their
//! `send` calls themselves. Any transport error closes the connection for
//! good.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::errors::{HyperError, Result};
use crate::reduction;

pub const HEADER_SIZE: usize = 4;
pub const MAX_FRAME_SIZE: usize = 1 << 30;
const BUFSIZE: usize = 8192;

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    buffer: Vec<u8>,
    closed: bool,
    eof: bool,
    timeout: Option<Duration>,
}

impl Connection {
    fn new(stream: UnixStream) -> Connection {
        Connection {
            stream,
            buffer: Vec::with_capacity(BUFSIZE),
            closed: false,
            eof: false,
            timeout: None,
        }
    }

    /// Two connected ends. One stays with the parent, the other is handed to
    /// the child at spawn time.
    pub fn pair() -> Result<(Connection, Connection)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Connection::new(a), Connection::new(b)))
    }

    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Connection> {
        Ok(Connection::new(UnixStream::connect(path)?))
    }

    /// Adopt a descriptor inherited from the spawning process.
    ///
    /// # Safety
    /// `fd` must be an open Unix stream socket owned by nobody else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Connection {
        Connection::new(UnixStream::from_raw_fd(fd))
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.stream.into_raw_fd()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// A second handle on the same stream, e.g. to read and write from
    /// different threads. The receive buffer is not shared.
    pub fn try_clone(&self) -> Result<Connection> {
        self.ensure_open()?;
        let mut conn = Connection::new(self.stream.try_clone()?);
        conn.timeout = self.timeout;
        Ok(conn)
    }

    /// Default timeout for [`Connection::recv`]. `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(HyperError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, err: io::Error) -> HyperError {
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        HyperError::Io(err)
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(HyperError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let header = (payload.len() as u32).to_be_bytes();
        let res = self
            .stream
            .write_all(&header)
            .and_then(|_| self.stream.write_all(payload))
            .and_then(|_| self.stream.flush());
        match res {
            Ok(()) => {
                trace!(len = payload.len(), "frame sent");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn send_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = reduction::serialize(message)?;
        self.send(&bytes)
    }

    /// Next frame, `None` once the peer has closed its end.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let timeout = self.timeout;
        self.recv_timeout(timeout)
    }

    pub fn recv_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.recv()? {
            Some(bytes) => Ok(Some(reduction::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn recv_message_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        match self.recv_timeout(timeout)? {
            Some(bytes) => Ok(Some(reduction::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`Connection::recv`] with an explicit deadline. A frame that
    /// arrives only partially before the deadline stays buffered.
    pub fn recv_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            if self.eof {
                if !self.buffer.is_empty() {
                    self.closed = true;
                    return Err(HyperError::Protocol("peer closed mid-frame".into()));
                }
                return Ok(None);
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(HyperError::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };
            if let Err(e) = self.stream.set_read_timeout(remaining) {
                return Err(self.fail(e));
            }
            self.fill()?;
        }
    }

    /// Whether a complete frame (or EOF) is available within `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        if self.frame_ready() || self.eof {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let Err(e) = self.stream.set_read_timeout(Some(deadline - now)) {
                return Err(self.fail(e));
            }
            match self.fill() {
                Ok(()) => {}
                Err(HyperError::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            }
            if self.frame_ready() || self.eof {
                return Ok(true);
            }
        }
    }

    fn frame_ready(&self) -> bool {
        if self.buffer.len() < HEADER_SIZE {
            return false;
        }
        let len = frame_len(&self.buffer);
        self.buffer.len() >= HEADER_SIZE + len
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let len = frame_len(&self.buffer);
        if len > MAX_FRAME_SIZE {
            self.closed = true;
            return Err(HyperError::Protocol(format!("incoming frame of {} bytes", len)));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let frame = self.buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.buffer.drain(..HEADER_SIZE + len);
        trace!(len, "frame received");
        Ok(Some(frame))
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; BUFSIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Err(HyperError::Timeout)
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Close both directions. The peer sees end-of-stream.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

fn frame_len(buffer: &[u8]) -> usize {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buffer[..HEADER_SIZE]);
    u32::from_be_bytes(header) as usize
}

/// Accepts connections on a filesystem socket path.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Listener> {
        let path = path.as_ref().to_path_buf();
        let inner = UnixListener::bind(&path)?;
        Ok(Listener { inner, path })
    }

    pub fn accept(&self) -> Result<Connection> {
        let (stream, _) = self.inner.accept()?;
        Ok(Connection::new(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn frames_arrive_whole_and_in_order() -> Result<()> {
        let (mut a, mut b) = Connection::pair()?;
        a.send(b"first")?;
        a.send(&[])?;
        a.send(&vec![7u8; 3 * BUFSIZE + 11])?;
        assert_eq!(b.recv()?.as_deref(), Some(&b"first"[..]));
        assert_eq!(b.recv()?, Some(vec![]));
        assert_eq!(b.recv()?.map(|f| f.len()), Some(3 * BUFSIZE + 11));
        Ok(())
    }

    #[test]
    fn recv_reports_peer_close_as_end_of_stream() -> Result<()> {
        let (mut a, mut b) = Connection::pair()?;
        a.send(b"last")?;
        a.close();
        assert_eq!(b.recv()?.as_deref(), Some(&b"last"[..]));
        assert_eq!(b.recv()?, None);
        Ok(())
    }

    #[test]
    fn recv_times_out_without_losing_partial_frames() -> Result<()> {
        let (a, mut b) = Connection::pair()?;
        let mut raw = a.stream.try_clone()?;
        raw.write_all(&10u32.to_be_bytes())?;
        raw.write_all(b"hello")?;
        let err = b.recv_timeout(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, HyperError::Timeout));
        assert!(!b.is_closed());
        raw.write_all(b"world")?;
        assert_eq!(b.recv()?.as_deref(), Some(&b"helloworld"[..]));
        Ok(())
    }

    #[test]
    fn closed_connection_refuses_io() -> Result<()> {
        let (mut a, _b) = Connection::pair()?;
        a.close();
        assert!(matches!(a.send(b"x"), Err(HyperError::ConnectionClosed)));
        assert!(matches!(a.recv(), Err(HyperError::ConnectionClosed)));
        Ok(())
    }

    #[test]
    fn send_to_vanished_peer_closes_permanently() -> Result<()> {
        let (mut a, b) = Connection::pair()?;
        drop(b);
        let mut failed = false;
        for _ in 0..64 {
            if a.send(&[0u8; BUFSIZE]).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(a.is_closed());
        assert!(matches!(a.send(b"x"), Err(HyperError::ConnectionClosed)));
        Ok(())
    }

    #[test]
    fn poll_sees_pending_frames() -> Result<()> {
        let (mut a, mut b) = Connection::pair()?;
        assert!(!b.poll(Duration::from_millis(20))?);
        a.send(b"ping")?;
        assert!(b.poll(Duration::from_secs(1))?);
        assert_eq!(b.recv()?.as_deref(), Some(&b"ping"[..]));
        Ok(())
    }

    #[test]
    fn listener_accepts_clients() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("conn.sock");
        let listener = Listener::bind(&path)?;
        let client = thread::spawn(move || -> Result<Option<Vec<u8>>> {
            let mut c = Connection::connect(&path)?;
            c.send(b"hi")?;
            c.recv()
        });
        let mut server = listener.accept()?;
        let got = server.recv()?;
        assert_eq!(got.as_deref(), Some(&b"hi"[..]));
        server.send(b"there")?;
        let reply = client.join().expect("client thread panicked")?;
        assert_eq!(reply.as_deref(), Some(&b"there"[..]));
        Ok(())
    }
}
