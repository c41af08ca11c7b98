//! Blocking socket layer.
//!
//! The connection talks to the broker through [`Transport`], opened by a
//! [`Connector`]. [`TcpConnector`] is the production implementation; tests
//! can substitute their own.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use mqlink_core::frame_len;

use crate::error::{ClientError, Result};

const READ_CHUNK: usize = 4096;

/// A connected byte stream.
pub trait Transport: Read + Write + Send {
    /// Another handle to the same stream, used as the write half.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions, waking a blocked reader.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Opens transports.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Transport>> {
        let addrs: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", address),
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected to {}", addr);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => map_io_error(e),
            None => ClientError::ConnectionClosed,
        })
    }
}

/// Timeouts become [`ClientError::ConnectionTimeout`]; everything else stays I/O.
pub(crate) fn map_io_error(err: io::Error) -> ClientError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ClientError::ConnectionTimeout,
        _ => ClientError::Io(err),
    }
}

/// Assembles whole MQTT frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Split off the next complete frame if one is buffered.
    ///
    /// A malformed Remaining Length leaves the buffer untouched; the caller
    /// decides whether to [`clear`](Self::clear) it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match frame_len(&self.buf)? {
            Some(len) => Ok(Some(self.buf.split_to(len).freeze())),
            None => Ok(None),
        }
    }

    /// Read until a complete frame is available.
    ///
    /// Returns `Ok(None)` when the peer closes the stream. Bytes of an
    /// unfinished frame are dropped in that case.
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            if !self.fill(reader, &mut chunk)? {
                return Ok(None);
            }
        }
    }

    /// Like [`read_frame`](Self::read_frame), but the whole frame must
    /// arrive before `deadline`.
    ///
    /// Each read is limited to the time left, so a peer trickling bytes
    /// cannot stretch the wait. The read timeout is cleared afterwards.
    pub fn read_frame_until(
        &mut self,
        stream: &mut dyn Transport,
        deadline: Instant,
    ) -> Result<Option<Bytes>> {
        let result = self.read_frame_by(stream, deadline);
        if let Err(e) = stream.set_read_timeout(None) {
            debug!("Failed to clear read timeout: {}", e);
        }
        result
    }

    fn read_frame_by(
        &mut self,
        stream: &mut dyn Transport,
        deadline: Instant,
    ) -> Result<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::ConnectionTimeout);
            }
            stream.set_read_timeout(Some(remaining))?;
            if !self.fill(stream, &mut chunk)? {
                return Ok(None);
            }
        }
    }

    /// One read into the buffer. `false` means end of stream.
    fn fill<R: Read + ?Sized>(&mut self, reader: &mut R, chunk: &mut [u8]) -> Result<bool> {
        loop {
            match reader.read(chunk) {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        debug!("Peer closed with {} bytes of a partial frame", self.buf.len());
                        self.buf.clear();
                    }
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_error(e)),
            }
        }
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        let len = self.buf.len();
        self.buf.advance(len);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::time::Instant;

    use super::*;

    /// Hands out at most one byte per read.
    struct Trickle<R>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(1);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_frames_from_single_read() {
        let data = [0x20, 0x02, 0x00, 0x00, 0xD0, 0x00];
        let mut reader = FrameReader::new();
        let mut src = Cursor::new(&data[..]);

        let first = reader.read_frame(&mut src).unwrap().unwrap();
        assert_eq!(&first[..], &[0x20, 0x02, 0x00, 0x00]);
        let second = reader.read_frame(&mut src).unwrap().unwrap();
        assert_eq!(&second[..], &[0xD0, 0x00]);
        assert!(reader.read_frame(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_frames_from_fragmented_reads() {
        let mut data = vec![0x30, 0x82, 0x01, 0x00, 0x01, b'x'];
        data.extend(std::iter::repeat(b'p').take(127));
        let mut reader = FrameReader::new();
        let mut src = Trickle(Cursor::new(data.clone()));

        let frame = reader.read_frame(&mut src).unwrap().unwrap();
        assert_eq!(frame.len(), 3 + 130);
        assert_eq!(&frame[..], &data[..]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_at_eof() {
        let mut reader = FrameReader::new();
        let mut src = Cursor::new(vec![0x40, 0x02, 0x00]);
        assert!(reader.read_frame(&mut src).unwrap().is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_malformed_length() {
        let mut reader = FrameReader::new();
        let mut src = Cursor::new(vec![0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(
            reader.read_frame(&mut src),
            Err(ClientError::Protocol(_))
        ));
        reader.clear();
        assert_eq!(reader.buffered(), 0);
    }

    fn tcp_pair() -> (Box<dyn Transport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stream = TcpConnector
            .connect(&addr, Duration::from_secs(2))
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        (stream, server)
    }

    #[test]
    fn test_read_frame_until_times_out() {
        let (mut stream, _server) = tcp_pair();
        let mut reader = FrameReader::new();

        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);
        let result = reader.read_frame_until(stream.as_mut(), deadline);
        assert!(matches!(result, Err(ClientError::ConnectionTimeout)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_read_frame_until_bounds_trickled_frame() {
        let (mut stream, mut server) = tcp_pair();
        let writer = std::thread::spawn(move || {
            for byte in [0x20u8, 0x02, 0x00, 0x00] {
                if server.write_all(&[byte]).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(150));
            }
        });

        // Every gap is shorter than the deadline, the whole frame is not
        let mut reader = FrameReader::new();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(250);
        let result = reader.read_frame_until(stream.as_mut(), deadline);
        assert!(matches!(result, Err(ClientError::ConnectionTimeout)));
        assert!(started.elapsed() < Duration::from_millis(450));
        writer.join().unwrap();
    }

    #[test]
    fn test_read_frame_until_returns_frame() {
        let (mut stream, mut server) = tcp_pair();
        server.write_all(&[0x20, 0x02, 0x01, 0x00]).unwrap();

        let mut reader = FrameReader::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = reader
            .read_frame_until(stream.as_mut(), deadline)
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], &[0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector.connect(&addr, Duration::from_secs(1));
        assert!(result.is_err());
    }
}
