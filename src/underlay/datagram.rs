//! Datagram underlay
//!
//! Connectionless carrier over UDP. One client carrier serves one
//! remote endpoint; one server carrier serves every peer of a bound
//! socket, which is why the server side holds the whole user table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::cipher::BlockCipher;
use crate::config::User;
use crate::endpoint::UnderlayNetwork;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

use super::base::BaseUnderlay;
use super::scheduler::Scheduler;
use super::session::{Session, SessionHandle};
use super::Underlay;

enum DatagramRole {
    Client(BlockCipher),
    Server(HashMap<String, User>),
}

/// UDP-backed carrier.
pub struct DatagramUnderlay {
    base: BaseUnderlay,
    socket: UdpSocket,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    role: DatagramRole,
}

impl DatagramUnderlay {
    /// Open a carrier to `remote` (client side).
    pub async fn connect(
        network: UnderlayNetwork,
        remote: SocketAddr,
        mtu: usize,
        cipher: BlockCipher,
    ) -> Result<Arc<Self>> {
        if !network.is_datagram() {
            return Err(Error::InvalidOperation("datagram underlay needs a udp network"));
        }
        if !network.accepts(&remote) {
            return Err(Error::InvalidAddress(format!(
                "{} is not a {} address",
                remote, network
            )));
        }
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        Ok(Arc::new(Self {
            base: BaseUnderlay::new(mtu, true),
            socket,
            local,
            remote: Some(remote),
            role: DatagramRole::Client(cipher),
        }))
    }

    /// Bind the server-side carrier with address/port reuse enabled.
    pub fn bind(
        network: UnderlayNetwork,
        local: SocketAddr,
        mtu: usize,
        users: HashMap<String, User>,
    ) -> Result<Arc<Self>> {
        if !network.is_datagram() {
            return Err(Error::InvalidOperation("datagram underlay needs a udp network"));
        }
        if !network.accepts(&local) {
            return Err(Error::InvalidAddress(format!(
                "{} is not a {} address",
                local, network
            )));
        }
        let domain = if local.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        Ok(Arc::new(Self {
            base: BaseUnderlay::new(mtu, false),
            socket,
            local,
            remote: None,
            role: DatagramRole::Server(users),
        }))
    }

    /// The cipher this carrier was dialed with, if it is the client
    /// side.
    pub fn cipher(&self) -> Option<&BlockCipher> {
        match &self.role {
            DatagramRole::Client(block) => Some(block),
            DatagramRole::Server(_) => None,
        }
    }

    /// The user table incoming peers authenticate against, if it is
    /// the server side.
    pub fn users(&self) -> Option<&HashMap<String, User>> {
        match &self.role {
            DatagramRole::Client(_) => None,
            DatagramRole::Server(users) => Some(users),
        }
    }

    /// Hand a remote-opened session up to the accept side. Called by
    /// the framing layer once the session is ready for consumers.
    pub async fn deliver(&self, session: Session) -> Result<()> {
        self.base.deliver(session).await
    }
}

#[async_trait]
impl Underlay for DatagramUnderlay {
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

    /// Supervise the carrier: inbound datagrams refresh the activity
    /// clock; a socket error terminates the loop.
    async fn run_event_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; self.base.mtu().max(1)];
        loop {
            tokio::select! {
                _ = self.base.shutdown().wait() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        trace!("{} received {} bytes from {}", self, n, from);
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

impl std::fmt::Display for DatagramUnderlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote {
            Some(remote) => write!(f, "DatagramUnderlay[{} - {}]", self.local, remote),
            None => write!(f, "DatagramUnderlay[{}]", self.local),
        }
    }
}
