//! Peer socket with a buffered write queue.
use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::{Link, LocalDuration, LocalTime};

/// Maximum number of bytes queued for sending to a single peer. A peer
/// whose queue grows past this limit is not draining its socket and is
/// disconnected (flood control).
pub const SEND_BUFFER_LIMIT: usize = 36 * 1024 * 1024;

/// How long a peer's send queue may stay non-empty without the peer
/// accepting a single byte before it counts as a stuck sender.
pub const SEND_STUCK_TIMEOUT: LocalDuration = LocalDuration::from_mins(90);

/// A peer socket wrapping an underlying stream, eg. [`net::TcpStream`].
///
/// Writes are queued locally and flushed when the socket reports
/// writability, so that protocol code never blocks on a slow peer.
/// Queued bytes are transmitted in order.
///
/// The socket keeps two clocks for the stuck-sender check: the last time
/// a write was accepted by the peer, and the last time the send queue was
/// empty.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// Remote peer address.
    pub addr: net::SocketAddr,
    /// Link direction.
    pub link: Link,
    /// Bytes queued for sending.
    out: VecDeque<u8>,
    /// Last time the underlying stream accepted bytes.
    last_send: LocalTime,
    /// Last time the send queue was observed empty.
    last_send_empty: LocalTime,
}

impl<R: Read + Write> Socket<R> {
    /// Wrap a stream in a socket.
    pub fn from(raw: R, addr: net::SocketAddr, link: Link, now: LocalTime) -> Self {
        Self {
            raw,
            addr,
            link,
            out: VecDeque::new(),
            last_send: now,
            last_send_empty: now,
        }
    }

    /// Queue bytes for sending. Returns the total number of queued bytes;
    /// the caller is responsible for disconnecting the peer when the queue
    /// exceeds [`SEND_BUFFER_LIMIT`].
    pub fn push(&mut self, bytes: &[u8], now: LocalTime) -> usize {
        if self.out.is_empty() {
            self.last_send_empty = now;
        }
        self.out.extend(bytes);
        self.out.len()
    }

    /// Number of bytes waiting to be sent.
    pub fn queued(&self) -> usize {
        self.out.len()
    }

    /// Attempt to flush the queued bytes into the underlying stream.
    ///
    /// Returns `Ok(())` when the queue has fully drained. `WouldBlock` and
    /// `WriteZero` mean the socket can't take more data right now; the
    /// caller should retry when the socket is writable again.
    pub fn flush(&mut self, now: LocalTime) -> io::Result<()> {
        while !self.out.is_empty() {
            let (front, _) = self.out.as_slices();

            match self.raw.write(front) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.out.drain(..n);
                    self.last_send = now;
                }
                Err(err) => return Err(err),
            }
        }
        self.last_send_empty = now;
        self.raw.flush()
    }

    /// Whether this peer is a stuck sender: its queue has been non-empty
    /// for the given timeout without the peer accepting a single byte.
    pub fn is_stuck(&self, now: LocalTime, timeout: LocalDuration) -> bool {
        !self.out.is_empty()
            && now - self.last_send >= timeout
            && now - self.last_send_empty >= timeout
    }
}

impl<R: Read> Read for Socket<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

impl Socket<net::TcpStream> {
    /// The local address of the underlying stream.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut down the underlying stream in both directions.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A writer with a byte budget; writes past it would block.
    struct Chunked {
        written: Vec<u8>,
        accept: usize,
    }

    impl Write for Chunked {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = usize::min(self.accept, buf.len());
            self.accept -= n;
            self.written.extend_from_slice(&buf[..n]);

            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Chunked {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    fn now() -> LocalTime {
        LocalTime::from_secs(1_000_000)
    }

    fn socket(accept: usize) -> Socket<Chunked> {
        Socket::from(
            Chunked {
                written: Vec::new(),
                accept,
            },
            ([127, 0, 0, 1], 8333).into(),
            Link::Outbound,
            now(),
        )
    }

    #[test]
    fn test_flush_preserves_order() {
        let mut sock = socket(16);

        sock.push(b"hello", now());
        sock.push(b" world", now());
        sock.flush(now()).unwrap();

        assert_eq!(sock.queued(), 0);
        assert_eq!(&sock.raw.written, b"hello world");
    }

    #[test]
    fn test_flush_would_block_keeps_queue() {
        let mut sock = socket(0);

        sock.push(b"hello", now());
        let err = sock.flush(now()).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(sock.queued(), 5);
    }

    #[test]
    fn test_stuck_sender_is_detected() {
        let mut sock = socket(0);

        sock.push(b"hello", now());
        sock.flush(now()).unwrap_err();

        // Not stuck while the timeout hasn't elapsed.
        assert!(!sock.is_stuck(now(), SEND_STUCK_TIMEOUT));

        // Queue non-empty for the whole window, not a byte accepted.
        let later = now() + SEND_STUCK_TIMEOUT;
        assert!(sock.is_stuck(later, SEND_STUCK_TIMEOUT));
    }

    #[test]
    fn test_accepted_bytes_reset_stuck_clock() {
        let mut sock = socket(2);

        sock.push(b"hello", now());

        // The peer accepted a couple of bytes just before the deadline;
        // even though the queue never drained, it isn't stuck.
        let almost = now() + SEND_STUCK_TIMEOUT - LocalDuration::from_mins(1);
        sock.flush(almost).unwrap_err();
        assert_eq!(sock.queued(), 3);

        assert!(!sock.is_stuck(now() + SEND_STUCK_TIMEOUT, SEND_STUCK_TIMEOUT));
    }

    #[test]
    fn test_empty_queue_is_never_stuck() {
        let mut sock = socket(16);

        sock.push(b"hello", now());
        sock.flush(now()).unwrap();
        assert_eq!(sock.queued(), 0);

        assert!(!sock.is_stuck(now() + SEND_STUCK_TIMEOUT, SEND_STUCK_TIMEOUT));

        // A fresh push after a long idle stretch starts a new window from
        // the moment the queue stopped being empty.
        let later = now() + SEND_STUCK_TIMEOUT * 2;
        sock.raw.accept = 0;
        sock.push(b"again", later);
        sock.flush(later).unwrap_err();

        assert!(!sock.is_stuck(later + LocalDuration::from_mins(1), SEND_STUCK_TIMEOUT));
        assert!(sock.is_stuck(later + SEND_STUCK_TIMEOUT, SEND_STUCK_TIMEOUT));
    }
}
