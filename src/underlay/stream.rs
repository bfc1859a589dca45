//! Stream underlay
//!
//! Connection-oriented carrier over TCP. Clients open it with one
//! block cipher; servers wrap an accepted raw connection with the
//! candidate cipher list the user table produced.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::trace;

use crate::cipher::BlockCipher;
use crate::endpoint::UnderlayNetwork;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

use super::base::BaseUnderlay;
use super::scheduler::Scheduler;
use super::session::{Session, SessionHandle};
use super::Underlay;

#[derive(Debug)]
enum CipherRole {
    /// Client side: the one cipher this carrier was dialed with.
    Client(BlockCipher),
    /// Server side: every cipher an incoming carrier may prove.
    Server(Vec<BlockCipher>),
}

/// TCP-backed carrier.
#[derive(Debug)]
pub struct StreamUnderlay {
    base: BaseUnderlay,
    conn: tokio::sync::Mutex<TcpStream>,
    local: SocketAddr,
    peer: SocketAddr,
    cipher: CipherRole,
}

impl StreamUnderlay {
    /// Open a carrier to `remote` (client side).
    pub async fn connect(
        network: UnderlayNetwork,
        remote: SocketAddr,
        mtu: usize,
        cipher: BlockCipher,
    ) -> Result<Arc<Self>> {
        if !network.is_stream() {
            return Err(Error::InvalidOperation("stream underlay needs a tcp network"));
        }
        if !network.accepts(&remote) {
            return Err(Error::InvalidAddress(format!(
                "{} is not a {} address",
                remote, network
            )));
        }
        let conn = TcpStream::connect(remote).await?;
        conn.set_nodelay(true)?;
        let local = conn.local_addr()?;
        let peer = conn.peer_addr()?;
        Ok(Arc::new(Self {
            base: BaseUnderlay::new(mtu, true),
            conn: tokio::sync::Mutex::new(conn),
            local,
            peer,
            cipher: CipherRole::Client(cipher),
        }))
    }

    /// Wrap an accepted raw connection (server side).
    pub fn serve(conn: TcpStream, mtu: usize, candidates: Vec<BlockCipher>) -> Result<Arc<Self>> {
        conn.set_nodelay(true)?;
        let local = conn.local_addr()?;
        let peer = conn.peer_addr()?;
        Ok(Arc::new(Self {
            base: BaseUnderlay::new(mtu, false),
            conn: tokio::sync::Mutex::new(conn),
            local,
            peer,
            cipher: CipherRole::Server(candidates),
        }))
    }

    /// The cipher this carrier was dialed with, if it is the client
    /// side.
    pub fn cipher(&self) -> Option<&BlockCipher> {
        match &self.cipher {
            CipherRole::Client(block) => Some(block),
            CipherRole::Server(_) => None,
        }
    }

    /// The candidate ciphers an incoming carrier may authenticate
    /// against, if it is the server side.
    pub fn candidates(&self) -> Option<&[BlockCipher]> {
        match &self.cipher {
            CipherRole::Client(_) => None,
            CipherRole::Server(candidates) => Some(candidates),
        }
    }

    /// Hand a remote-opened session up to the accept side. Called by
    /// the framing layer once the session is ready for consumers.
    pub async fn deliver(&self, session: Session) -> Result<()> {
        self.base.deliver(session).await
    }
}

#[async_trait]
impl Underlay for StreamUnderlay {
    fn mtu(&self) -> usize {
        self.base.mtu()
    }

    fn scheduler(&self) -> &Scheduler {
        self.base.scheduler()
    }

    fn done(&self) -> &Shutdown {
        self.base.shutdown()
    }

    async fn add_session(&self, session: SessionHandle, _peer: Option<SocketAddr>) -> Result<()> {
        self.base.add_session(session)
    }

    async fn accept(&self) -> Result<Session> {
        self.base.accept().await
    }

    /// Supervise the carrier: any inbound traffic refreshes the
    /// activity clock; EOF or a socket error terminates the loop.
    async fn run_event_loop(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut buf = vec![0u8; self.base.mtu().max(1)];
        loop {
            tokio::select! {
                _ = self.base.shutdown().wait() => return Ok(()),
                res = conn.read(&mut buf) => match res {
                    Ok(0) => return Err(Error::ConnectionClosed),
                    Ok(n) => {
                        trace!("{} read {} bytes", self, n);
                        self.base.scheduler().touch();
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    fn close(&self) {
        self.base.close();
    }
}

impl std::fmt::Display for StreamUnderlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamUnderlay[{} - {}]", self.local, self.peer)
    }
}
