//! Sessions
//!
//! A session is the logical connection handed to consumers. It lives
//! on exactly one underlay for its whole lifetime. `Session::pair`
//! builds both ends of the in-memory pipe: the consumer half
//! (`Session`, returned from dial/accept) and the transport half
//! (`SessionHandle`, registered with the underlay for the framing
//! layer to drive).

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::shutdown::Shutdown;

/// In-memory buffer between the consumer and transport halves.
const SESSION_BUFFER: usize = 64 * 1024;

/// Consumer half of a session.
#[derive(Debug)]
pub struct Session {
    id: u32,
    is_client: bool,
    mtu: usize,
    io: DuplexStream,
    done: Shutdown,
}

/// Transport half of a session, owned by the underlay.
#[derive(Debug)]
pub struct SessionHandle {
    id: u32,
    mtu: usize,
    io: DuplexStream,
    done: Shutdown,
}

impl Session {
    /// Create a connected session pair.
    pub fn pair(id: u32, is_client: bool, mtu: usize) -> (Session, SessionHandle) {
        let (consumer, transport) = tokio::io::duplex(SESSION_BUFFER);
        let done = Shutdown::new();
        (
            Session {
                id,
                is_client,
                mtu,
                io: consumer,
                done: done.clone(),
            },
            SessionHandle {
                id,
                mtu,
                io: transport,
                done,
            },
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// End the session. The owning underlay detaches it on the next
    /// scheduler update. Dropping the session has the same effect.
    pub fn close(&self) {
        self.done.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.done.close();
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = if self.is_client { 'C' } else { 'S' };
        write!(f, "Session[{}-{:08x}]", side, self.id)
    }
}

impl AsyncRead for Session {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Session {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl SessionHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Completion signal shared with the consumer half.
    pub(crate) fn done(&self) -> Shutdown {
        self.done.clone()
    }
}

impl AsyncRead for SessionHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionHandle {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pair_is_connected() {
        let (mut session, mut handle) = Session::pair(7, true, 1400);
        assert_eq!(session.id(), 7);
        assert_eq!(session.mtu(), 1400);
        assert_eq!(handle.id(), 7);

        session.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        handle.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");

        handle.write_all(b"down").await.unwrap();
        let mut buf = [0u8; 4];
        session.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down");
    }

    #[tokio::test]
    async fn test_drop_signals_done() {
        let (session, handle) = Session::pair(1, true, 1400);
        let done = handle.done();
        assert!(!done.is_closed());
        drop(session);
        assert!(done.is_closed());
    }

    #[test]
    fn test_display_names_side() {
        let (client, _h) = Session::pair(0xabcd, true, 1400);
        assert_eq!(client.to_string(), "Session[C-0000abcd]");
        let (server, _h) = Session::pair(0xabcd, false, 1400);
        assert_eq!(server.to_string(), "Session[S-0000abcd]");
    }
}
