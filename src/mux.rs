//! Multiplex controller
//!
//! Mediates between logical sessions and the pool of physical
//! carriers (underlays). Clients obtain or create an underlay for
//! each outbound session according to the multiplex factor; servers
//! listen on their endpoints, wrap incoming carriers with the
//! candidate cipher list, and hand demultiplexed sessions to the
//! accept queue. The controller owns underlay lifecycle: opening,
//! idle collection, teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cipher::{self, BlockCipher, BlockContext};
use crate::config::User;
use crate::endpoint::{Endpoint, UnderlayNetwork};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::underlay::{DatagramUnderlay, Scheduler, Session, StreamUnderlay, Underlay};

/// Interval between idle-collector sweeps.
const IDLE_UNDERLAY_TICK: Duration = Duration::from_secs(5);

/// Capacity of the shared session accept queue.
const ACCEPT_QUEUE_CAPACITY: usize = 256;

/// Backlog for stream listeners.
const LISTEN_BACKLOG: u32 = 1024;

/// Controller role, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Role-only configuration; keeps client fields out of server
/// controllers and vice versa.
#[derive(Debug)]
enum RoleState {
    Client {
        password: Vec<u8>,
        multiplex_factor: usize,
    },
    Server {
        users: HashMap<String, User>,
    },
}

/// State guarded by the controller lock.
struct MuxState {
    endpoints: Vec<Endpoint>,
    underlays: Vec<Arc<dyn Underlay>>,
    used: bool,
    role: RoleState,
}

impl std::fmt::Debug for MuxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxState")
            .field("endpoints", &self.endpoints)
            .field("underlays", &self.underlays.len())
            .field("used", &self.used)
            .field("role", &self.role)
            .finish()
    }
}

/// The multiplex controller.
///
/// Presents a listener-like surface on the server (`accept`/`close`)
/// and a dialer on the client (`dial`). One instance per process
/// role.
#[derive(Debug)]
pub struct Mux {
    role: Role,
    state: Mutex<MuxState>,
    accept_tx: mpsc::Sender<Session>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    accept_err_tx: mpsc::Sender<Error>,
    accept_err_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,
    done: Shutdown,
    rng: Mutex<StdRng>,
    /// Back-reference handed to listener tasks; controllers only
    /// exist behind an `Arc`.
    weak: Weak<Mux>,
}

impl Mux {
    /// Create a controller and start its idle collector. Must be
    /// called within a Tokio runtime.
    pub fn new(role: Role) -> Arc<Self> {
        Self::with_cleaner_tick(role, IDLE_UNDERLAY_TICK)
    }

    fn with_cleaner_tick(role: Role, tick: Duration) -> Arc<Self> {
        match role {
            Role::Client => info!("Initializing client multiplexer"),
            Role::Server => info!("Initializing server multiplexer"),
        }
        let role_state = match role {
            Role::Client => RoleState::Client {
                password: Vec::new(),
                multiplex_factor: 0,
            },
            Role::Server => RoleState::Server {
                users: HashMap::new(),
            },
        };
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let (accept_err_tx, accept_err_rx) = mpsc::channel(1);
        let mux = Arc::new_cyclic(|weak| Self {
            role,
            state: Mutex::new(MuxState {
                endpoints: Vec::new(),
                underlays: Vec::new(),
                used: false,
                role: role_state,
            }),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            accept_err_tx,
            accept_err_rx: tokio::sync::Mutex::new(accept_err_rx),
            done: Shutdown::new(),
            rng: Mutex::new(StdRng::from_entropy()),
            weak: weak.clone(),
        });

        // Idle collector: prune closed and idle underlays on every
        // tick until the controller is done.
        let weak = Arc::downgrade(&mux);
        let done = mux.done.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(mux) = weak.upgrade() else { return };
                        let mut state = mux.state.lock();
                        clean_underlays(&mut state);
                    }
                    _ = done.wait() => return,
                }
            }
        });
        mux
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Set the client password.
    ///
    /// # Panics
    ///
    /// Calling this on a server controller, or after the controller
    /// has been used, is a programming error and panics.
    pub fn set_client_password(&self, password: Vec<u8>) -> &Self {
        let mut state = self.state.lock();
        if state.used {
            panic!("can't set client password after the mux is used");
        }
        match &mut state.role {
            RoleState::Client { password: slot, .. } => *slot = password,
            RoleState::Server { .. } => panic!("can't set client password in a server mux"),
        }
        self
    }

    /// Set the multiplex factor: the reuse weight of each active
    /// underlay against the weight-1 choice of opening a new one.
    /// Zero disables reuse.
    ///
    /// # Panics
    ///
    /// Calling this on a server controller, or after the controller
    /// has been used, is a programming error and panics.
    pub fn set_client_multiplex_factor(&self, n: usize) -> &Self {
        let mut state = self.state.lock();
        if state.used {
            panic!("can't set multiplex factor after the mux is used");
        }
        match &mut state.role {
            RoleState::Client {
                multiplex_factor, ..
            } => *multiplex_factor = n,
            RoleState::Server { .. } => panic!("can't set multiplex factor in a server mux"),
        }
        info!("Mux multiplex factor is set to {}", n);
        self
    }

    /// Set the server user table.
    ///
    /// # Panics
    ///
    /// Calling this on a client controller, or after the controller
    /// has been used, is a programming error and panics.
    pub fn set_server_users(&self, users: HashMap<String, User>) -> &Self {
        let mut state = self.state.lock();
        if state.used {
            panic!("can't set server users after the mux is used");
        }
        match &mut state.role {
            RoleState::Server { users: slot } => *slot = users,
            RoleState::Client { .. } => panic!("can't set server users in a client mux"),
        }
        self
    }

    /// Set the endpoints to dial (client) or listen on (server).
    ///
    /// # Panics
    ///
    /// Calling this after the controller has been used is a
    /// programming error and panics.
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) -> &Self {
        let mut state = self.state.lock();
        if state.used {
            panic!("can't set endpoints after the mux is used");
        }
        state.endpoints = endpoints;
        self
    }

    /// Next demultiplexed session, a stored listener error, or
    /// `ConnectionClosed` once the controller is closed, whichever
    /// comes first.
    pub async fn accept(&self) -> Result<Session> {
        let mut err_rx = self.accept_err_rx.lock().await;
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            Some(err) = err_rx.recv() => Err(err),
            Some(conn) = rx.recv() => Ok(conn),
            _ = self.done.wait() => Err(Error::ConnectionClosed),
        }
    }

    /// Tear the controller down: close every pooled underlay, empty
    /// the pool, raise the done signal. Idempotent; never blocks.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.done.is_closed() {
            return Ok(());
        }
        match self.role {
            Role::Client => info!("Closing client multiplexer"),
            Role::Server => info!("Closing server multiplexer"),
        }
        for underlay in &state.underlays {
            underlay.close();
        }
        state.underlays.clear();
        self.done.close();
        Ok(())
    }

    /// The controller listens on many endpoints at once and has no
    /// single local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Listen on every configured endpoint. Server-only; never
    /// blocks. Fatal listener errors surface through `accept`.
    pub fn start(&self) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidOperation("start is server-only"));
        }
        let Some(this) = self.weak.upgrade() else {
            return Err(Error::ConnectionClosed);
        };
        let mut state = self.state.lock();
        match &state.role {
            RoleState::Server { users } if users.is_empty() => {
                return Err(Error::Config("no user found".to_string()));
            }
            _ => {}
        }
        if state.endpoints.is_empty() {
            return Err(Error::Config(
                "no server listening endpoint found".to_string(),
            ));
        }
        for endpoint in &state.endpoints {
            if endpoint.local_addr().is_none() {
                return Err(Error::Config(
                    "endpoint local address is not set".to_string(),
                ));
            }
        }
        state.used = true;
        for endpoint in state.endpoints.clone() {
            let mux = Arc::clone(&this);
            tokio::spawn(async move {
                mux.accept_underlay_loop(endpoint).await;
            });
        }
        Ok(())
    }

    /// Open a session for the client to consume. The session may ride
    /// an existing underlay, chosen by the multiplex factor.
    pub async fn dial(&self) -> Result<Session> {
        if self.role != Role::Client {
            return Err(Error::InvalidOperation("dial is client-only"));
        }
        if self.done.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let password;
        let endpoints;
        let picked = {
            let mut state = self.state.lock();
            let RoleState::Client {
                password: pw,
                multiplex_factor,
            } = &state.role
            else {
                unreachable!("client mux carries client state")
            };
            if pw.is_empty() {
                return Err(Error::Config("client password is not set".to_string()));
            }
            if state.endpoints.is_empty() {
                return Err(Error::Config(
                    "no server listening endpoint found".to_string(),
                ));
            }
            for endpoint in &state.endpoints {
                if endpoint.remote_addr().is_none() {
                    return Err(Error::Config(
                        "endpoint remote address is not set".to_string(),
                    ));
                }
            }
            password = pw.clone();
            endpoints = state.endpoints.clone();
            let factor = *multiplex_factor;
            state.used = true;
            clean_underlays(&mut state);
            self.maybe_pick_existing(&state, factor)
        };

        let mut underlay = match picked {
            Some(underlay) => {
                debug!("Reusing existing underlay {}", underlay);
                underlay
            }
            None => {
                let underlay = self.new_underlay(&password, &endpoints).await?;
                debug!("Created new underlay {}", underlay);
                underlay
            }
        };

        if !underlay.scheduler().inc_pending() {
            // The carrier started tearing down between selection and
            // attach. Try once with a fresh one.
            underlay = self.new_underlay(&password, &endpoints).await?;
            debug!("Created yet another new underlay {}", underlay);
            if !underlay.scheduler().inc_pending() {
                return Err(Error::Transport(
                    "underlay torn down before session attach".to_string(),
                ));
            }
        }
        let _pending = PendingGuard(underlay.scheduler());

        let id = self.rng.lock().gen::<u32>();
        let (session, handle) = Session::pair(id, true, underlay.mtu());
        underlay
            .add_session(handle, None)
            .await
            .map_err(|e| Error::Transport(format!("add session failed: {}", e)))?;
        Ok(session)
    }

    /// Weighted reuse selection over the active pool: each active
    /// underlay has weight `factor`, the create-new choice has
    /// weight 1.
    fn maybe_pick_existing(&self, state: &MuxState, factor: usize) -> Option<Arc<dyn Underlay>> {
        let active: Vec<&Arc<dyn Underlay>> = state
            .underlays
            .iter()
            .filter(|u| !u.done().is_closed() && !u.scheduler().is_disabled())
            .collect();
        let index = reuse_pick(active.len(), factor, &mut *self.rng.lock())?;
        Some(Arc::clone(active[index]))
    }

    /// Open a new underlay on a uniformly chosen endpoint, append it
    /// to the pool, and spawn its event loop.
    async fn new_underlay(
        &self,
        password: &[u8],
        endpoints: &[Endpoint],
    ) -> Result<Arc<dyn Underlay>> {
        let endpoint = {
            let mut rng = self.rng.lock();
            endpoints[rng.gen_range(0..endpoints.len())].clone()
        };
        let remote = endpoint
            .remote_addr()
            .ok_or_else(|| Error::Config("endpoint remote address is not set".to_string()))?;

        let underlay: Arc<dyn Underlay> = if endpoint.network().is_stream() {
            let block = cipher::block_cipher_from_password(password, false)?;
            StreamUnderlay::connect(endpoint.network(), remote, endpoint.mtu(), block).await?
        } else {
            let block = cipher::block_cipher_from_password(password, true)?;
            DatagramUnderlay::connect(endpoint.network(), remote, endpoint.mtu(), block).await?
        };

        // The connect ran outside the lock; withdraw the carrier if
        // the controller closed meanwhile.
        {
            let mut state = self.state.lock();
            if self.done.is_closed() {
                underlay.close();
                return Err(Error::ConnectionClosed);
            }
            state.underlays.push(Arc::clone(&underlay));
        }
        spawn_event_loop(&underlay);
        Ok(underlay)
    }

    /// Listener task for one endpoint. Fatal errors land in the
    /// accept-error slot and end the task.
    async fn accept_underlay_loop(self: Arc<Self>, endpoint: Endpoint) {
        let Some(local) = endpoint.local_addr() else {
            self.report_accept_error(Error::Config(
                "endpoint local address is not set".to_string(),
            ));
            return;
        };
        let network = endpoint.network();
        if network.is_stream() {
            let listener = match bind_stream_listener(network, local) {
                Ok(listener) => listener,
                Err(e) => {
                    self.report_accept_error(e);
                    return;
                }
            };
            info!("Mux is listening to endpoint {} {}", network, local);
            loop {
                tokio::select! {
                    _ = self.done.wait() => return,
                    res = listener.accept() => {
                        let (conn, _peer) = match res {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                self.report_accept_error(Error::Transport(format!(
                                    "accept underlay failed: {}",
                                    e
                                )));
                                return;
                            }
                        };
                        let candidates = {
                            let state = self.state.lock();
                            let RoleState::Server { users } = &state.role else {
                                return;
                            };
                            server_candidates(users)
                        };
                        let underlay: Arc<dyn Underlay> =
                            match StreamUnderlay::serve(conn, endpoint.mtu(), candidates) {
                                Ok(underlay) => underlay,
                                Err(e) => {
                                    debug!("wrapping accepted underlay failed: {}", e);
                                    continue;
                                }
                            };
                        debug!("Created new server underlay {}", underlay);
                        {
                            let mut state = self.state.lock();
                            state.underlays.push(Arc::clone(&underlay));
                            clean_underlays(&mut state);
                        }
                        spawn_event_loop(&underlay);
                        self.spawn_accept_bridge(&underlay);
                    }
                }
            }
        } else {
            // One datagram underlay multiplexes all peers.
            let users = {
                let state = self.state.lock();
                let RoleState::Server { users } = &state.role else {
                    return;
                };
                users.clone()
            };
            let underlay: Arc<dyn Underlay> =
                match DatagramUnderlay::bind(network, local, endpoint.mtu(), users) {
                    Ok(underlay) => underlay,
                    Err(e) => {
                        self.report_accept_error(e);
                        return;
                    }
                };
            info!("Mux is listening to endpoint {} {}", network, local);
            info!("Created new server underlay {}", underlay);
            {
                let mut state = self.state.lock();
                state.underlays.push(Arc::clone(&underlay));
                clean_underlays(&mut state);
            }
            spawn_event_loop(&underlay);
            self.spawn_accept_bridge(&underlay);
        }
    }

    /// Forward every session the underlay surfaces into the shared
    /// accept queue, until the underlay ends.
    fn spawn_accept_bridge(&self, underlay: &Arc<dyn Underlay>) {
        let underlay = Arc::clone(underlay);
        let tx = self.accept_tx.clone();
        tokio::spawn(async move {
            loop {
                match underlay.accept().await {
                    Ok(conn) => {
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if !e.is_closed() {
                            debug!("{} accept: {}", underlay, e);
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Store the first fatal listener error; later ones are dropped.
    fn report_accept_error(&self, err: Error) {
        debug!("listener error: {}", err);
        let _ = self.accept_err_tx.try_send(err);
    }
}

/// Releases one pending slot when dropped, so the bracket around the
/// session attach holds on every exit path.
struct PendingGuard<'a>(&'a Scheduler);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.dec_pending();
    }
}

/// Weighted draw over `active` underlays with reuse weight `factor`
/// each, against the weight-1 create-new choice. `None` means create
/// new.
fn reuse_pick<R: Rng>(active: usize, factor: usize, rng: &mut R) -> Option<usize> {
    if active == 0 || factor == 0 {
        return None;
    }
    let reuse_factor = active * factor;
    let n = rng.gen_range(0..=reuse_factor);
    (n < reuse_factor).then_some(n / factor)
}

/// Remove closed underlays from the pool; close and remove idle
/// ones. Callers hold the controller lock.
fn clean_underlays(state: &mut MuxState) {
    let mut closed = 0;
    let mut remaining = Vec::with_capacity(state.underlays.len());
    for underlay in state.underlays.drain(..) {
        if underlay.done().is_closed() {
            continue;
        }
        if underlay.scheduler().idle() {
            underlay.close();
            closed += 1;
            continue;
        }
        remaining.push(underlay);
    }
    state.underlays = remaining;
    if closed > 0 {
        debug!("Mux cleaned {} underlays", closed);
    }
}

/// Bind a stream listener with address/port reuse enabled.
fn bind_stream_listener(network: UnderlayNetwork, local: SocketAddr) -> Result<TcpListener> {
    if !network.accepts(&local) {
        return Err(Error::InvalidAddress(format!(
            "{} is not a {} address",
            local, network
        )));
    }
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket
        .bind(local)
        .map_err(|e| Error::Transport(format!("bind {} failed: {}", local, e)))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| Error::Transport(format!("listen on {} failed: {}", local, e)))
}

/// Build the candidate cipher list from the user table. Users whose
/// stored password cannot be decoded or derived are skipped.
fn server_candidates(users: &HashMap<String, User>) -> Vec<BlockCipher> {
    let mut blocks = Vec::new();
    for user in users.values() {
        let stored = user.hashed_password.as_deref().unwrap_or("");
        let password = match hex::decode(stored) {
            Ok(decoded) => decoded,
            Err(_) => {
                debug!(
                    "Unable to decode hashed password {:?} of user {}",
                    stored, user.name
                );
                continue;
            }
        };
        let password = if password.is_empty() {
            let plaintext = user.password.as_deref().unwrap_or("");
            cipher::hash_password(plaintext.as_bytes(), user.name.as_bytes()).to_vec()
        } else {
            password
        };
        let mut from_user = match cipher::block_cipher_list_from_password(&password, false) {
            Ok(list) => list,
            Err(e) => {
                debug!("Unable to create block ciphers of user {}: {}", user.name, e);
                continue;
            }
        };
        for block in &mut from_user {
            block.set_block_context(BlockContext {
                user_name: user.name.clone(),
            });
        }
        blocks.append(&mut from_user);
    }
    blocks
}

/// Drive the underlay until it terminates, then close it. Normal
/// end-of-stream terminations stay quiet.
fn spawn_event_loop(underlay: &Arc<dyn Underlay>) {
    let underlay = Arc::clone(underlay);
    tokio::spawn(async move {
        if let Err(e) = underlay.run_event_loop().await {
            if !e.is_closed() {
                debug!("{} event loop: {}", underlay, e);
            }
        }
        underlay.close();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UdpSocket};

    const PASSWORD: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    /// Accept loop that keeps every accepted connection open.
    async fn sink_listener() -> SocketAddr {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });
        addr
    }

    fn client_mux(addr: SocketAddr, factor: usize) -> Arc<Mux> {
        let mux = Mux::new(Role::Client);
        mux.set_client_password(PASSWORD.to_vec());
        mux.set_client_multiplex_factor(factor);
        mux.set_endpoints(vec![Endpoint::client(UnderlayNetwork::Tcp, addr, 1400)]);
        mux
    }

    fn one_user() -> HashMap<String, User> {
        HashMap::from([(
            "alice".to_string(),
            User {
                name: "alice".to_string(),
                password: Some("hunter2".to_string()),
                hashed_password: None,
            },
        )])
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_dial_without_reuse_opens_one_underlay_per_session() {
        let addr = sink_listener().await;
        let mux = client_mux(addr, 0);

        let before = crate::metrics::UNDERLAY_ACTIVE_OPENS.get();
        let s1 = mux.dial().await.unwrap();
        let s2 = mux.dial().await.unwrap();
        let s3 = mux.dial().await.unwrap();
        assert_eq!(s1.mtu(), 1400);
        assert_ne!(s1.id(), s2.id());

        let underlays: Vec<_> = mux.state.lock().underlays.clone();
        assert_eq!(underlays.len(), 3);
        for underlay in &underlays {
            assert_eq!(underlay.scheduler().session_count(), 1);
            assert_eq!(underlay.scheduler().pending_count(), 0);
        }
        assert!(crate::metrics::UNDERLAY_ACTIVE_OPENS.get() >= before + 3);
        drop((s1, s2, s3));
    }

    #[tokio::test]
    async fn test_dial_with_high_factor_reuses_underlays() {
        let addr = sink_listener().await;
        let mux = client_mux(addr, 16);
        *mux.rng.lock() = StdRng::seed_from_u64(42);

        let mut sessions = Vec::new();
        for _ in 0..50 {
            sessions.push(mux.dial().await.unwrap());
        }

        let underlays: Vec<_> = mux.state.lock().underlays.clone();
        // With factor 16, the expected number of opens over 50 dials
        // is under four; the bound leaves statistical headroom.
        assert!(
            underlays.len() <= 12,
            "expected heavy reuse, got {} underlays",
            underlays.len()
        );
        let total: usize = underlays
            .iter()
            .map(|u| u.scheduler().session_count())
            .sum();
        assert_eq!(total, 50);
        drop(sessions);
    }

    #[tokio::test]
    async fn test_idle_collection_empties_pool() {
        let addr = sink_listener().await;
        let mux = Mux::with_cleaner_tick(Role::Client, Duration::from_millis(20));
        mux.set_client_password(PASSWORD.to_vec());
        mux.set_endpoints(vec![Endpoint::client(UnderlayNetwork::Tcp, addr, 1400)]);

        let session = mux.dial().await.unwrap();
        let underlay = mux.state.lock().underlays[0].clone();
        underlay.scheduler().set_idle_timeout(Duration::ZERO);

        drop(session);
        wait_for(|| mux.state.lock().underlays.is_empty(), "idle collection").await;
        assert!(underlay.done().is_closed());

        // The next dial opens a fresh underlay.
        let _session = mux.dial().await.unwrap();
        assert_eq!(mux.state.lock().underlays.len(), 1);
        assert!(!mux.state.lock().underlays[0].done().is_closed());
    }

    #[tokio::test]
    async fn test_server_bind_failure_surfaces_through_accept() {
        let mux = Mux::new(Role::Server);
        mux.set_server_users(one_user());
        // TEST-NET address: not assignable, so the bind always fails.
        mux.set_endpoints(vec![Endpoint::server(
            UnderlayNetwork::Tcp,
            "203.0.113.1:0".parse().unwrap(),
            1400,
        )]);

        mux.start().unwrap();
        let err = mux.accept().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        // Reserve a port, then let the mux bind it with reuse.
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let mux = Mux::new(Role::Server);
        mux.set_server_users(one_user());
        mux.set_endpoints(vec![Endpoint::server(UnderlayNetwork::Tcp, addr, 1400)]);
        mux.start().unwrap();

        // Two inbound underlays.
        let mut peers = Vec::new();
        for _ in 0..2 {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match TcpStream::connect(addr).await {
                    Ok(conn) => break peers.push(conn),
                    Err(_) if Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(10)).await
                    }
                    Err(e) => panic!("connect to mux listener: {}", e),
                }
            }
        }
        wait_for(|| mux.state.lock().underlays.len() == 2, "two underlays").await;
        let underlays: Vec<_> = mux.state.lock().underlays.clone();

        let blocked = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        mux.close().unwrap();
        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        // Close is idempotent and the pool stays empty.
        mux.close().unwrap();
        assert!(mux.state.lock().underlays.is_empty());
        for underlay in &underlays {
            assert!(underlay.done().is_closed());
        }
        // Future accepts keep returning end-of-stream.
        assert!(matches!(
            mux.accept().await.unwrap_err(),
            Error::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn test_dial_retries_once_on_torn_down_underlay() {
        let addr = sink_listener().await;
        // A factor this large makes the torn-down underlay the pick
        // with near certainty, driving the retry path.
        let mux = client_mux(addr, 100_000);

        let first = mux.dial().await.unwrap();
        let torn = mux.state.lock().underlays[0].clone();
        torn.scheduler().begin_teardown();

        let second = mux.dial().await.unwrap();
        let underlays: Vec<_> = mux.state.lock().underlays.clone();
        assert_eq!(underlays.len(), 2);
        // The new session landed on the fresh underlay, not the
        // tearing-down one.
        assert_eq!(torn.scheduler().session_count(), 1);
        assert_eq!(underlays[1].scheduler().session_count(), 1);
        assert_eq!(underlays[1].scheduler().pending_count(), 0);

        // The torn-down carrier is collected once quiescent.
        drop(first);
        wait_for(|| torn.scheduler().session_count() == 0, "detach").await;
        torn.scheduler().set_idle_timeout(Duration::ZERO);
        clean_underlays(&mut mux.state.lock());
        assert_eq!(mux.state.lock().underlays.len(), 1);
        assert!(torn.done().is_closed());
        drop(second);
    }

    #[tokio::test]
    async fn test_dial_over_datagram_endpoint() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = peer.local_addr().unwrap();
        let mux = Mux::new(Role::Client);
        mux.set_client_password(PASSWORD.to_vec());
        mux.set_endpoints(vec![Endpoint::client(UnderlayNetwork::Udp, remote, 1280)]);

        let session = mux.dial().await.unwrap();
        assert_eq!(session.mtu(), 1280);
        assert_eq!(mux.state.lock().underlays.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_bridges_underlay_sessions() {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let mux = Mux::new(Role::Server);
        let underlay = StreamUnderlay::serve(server_side, 1400, Vec::new()).unwrap();
        let dyn_underlay: Arc<dyn Underlay> = underlay.clone();
        mux.state.lock().underlays.push(Arc::clone(&dyn_underlay));
        mux.spawn_accept_bridge(&dyn_underlay);

        let (session, handle) = Session::pair(42, false, 1400);
        underlay.deliver(session).await.unwrap();
        let accepted = mux.accept().await.unwrap();
        assert_eq!(accepted.id(), 42);
        drop(handle);
    }

    #[tokio::test]
    async fn test_role_gates() {
        let server = Mux::new(Role::Server);
        assert!(matches!(
            server.dial().await.unwrap_err(),
            Error::InvalidOperation(_)
        ));
        let client = Mux::new(Role::Client);
        assert!(matches!(
            client.start().unwrap_err(),
            Error::InvalidOperation(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_role_setter_panics_without_side_effects() {
        let server = Mux::new(Role::Server);
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            server.set_client_password(PASSWORD.to_vec());
        }));
        assert!(panicked.is_err());
        let state = server.state.lock();
        assert!(!state.used);
        assert!(state.underlays.is_empty());
    }

    #[tokio::test]
    async fn test_setters_panic_after_use() {
        let addr = sink_listener().await;
        let mux = client_mux(addr, 0);
        let _session = mux.dial().await.unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mux.set_endpoints(Vec::new());
        }));
        assert!(panicked.is_err());
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mux.set_client_multiplex_factor(3);
        }));
        assert!(panicked.is_err());
    }

    #[tokio::test]
    async fn test_start_validates_preconditions() {
        let mux = Mux::new(Role::Server);
        assert!(matches!(mux.start().unwrap_err(), Error::Config(_)));

        mux.set_server_users(one_user());
        assert!(matches!(mux.start().unwrap_err(), Error::Config(_)));

        // Endpoint without a local address.
        mux.set_endpoints(vec![Endpoint::client(
            UnderlayNetwork::Tcp,
            "203.0.113.10:8964".parse().unwrap(),
            1400,
        )]);
        assert!(matches!(mux.start().unwrap_err(), Error::Config(_)));
    }

    #[tokio::test]
    async fn test_dial_validates_preconditions() {
        let mux = Mux::new(Role::Client);
        assert!(matches!(mux.dial().await.unwrap_err(), Error::Config(_)));

        mux.set_client_password(PASSWORD.to_vec());
        assert!(matches!(mux.dial().await.unwrap_err(), Error::Config(_)));

        // Endpoint without a remote address.
        mux.set_endpoints(vec![Endpoint::server(
            UnderlayNetwork::Tcp,
            "127.0.0.1:8964".parse().unwrap(),
            1400,
        )]);
        assert!(matches!(mux.dial().await.unwrap_err(), Error::Config(_)));
    }

    #[tokio::test]
    async fn test_dial_after_close_returns_end_of_stream() {
        let addr = sink_listener().await;
        let mux = client_mux(addr, 0);
        mux.close().unwrap();
        assert!(matches!(
            mux.dial().await.unwrap_err(),
            Error::ConnectionClosed
        ));
    }

    #[test]
    fn test_reuse_pick_disabled_cases() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(reuse_pick(0, 8, &mut rng), None);
        assert_eq!(reuse_pick(4, 0, &mut rng), None);
    }

    #[test]
    fn test_reuse_probability_law() {
        let mut rng = StdRng::seed_from_u64(42);
        let (active, factor) = (4usize, 3usize);
        let trials = 20_000usize;

        let mut created = 0usize;
        let mut hits = vec![0usize; active];
        for _ in 0..trials {
            match reuse_pick(active, factor, &mut rng) {
                None => created += 1,
                Some(i) => hits[i] += 1,
            }
        }

        let p_new = created as f64 / trials as f64;
        let expected_new = 1.0 / ((active * factor) as f64 + 1.0);
        assert!(
            (p_new - expected_new).abs() < 0.02,
            "create-new probability {} deviates from {}",
            p_new,
            expected_new
        );

        let reused = (trials - created) as f64;
        for (i, &count) in hits.iter().enumerate() {
            let conditional = count as f64 / reused;
            assert!(
                (conditional - 1.0 / active as f64).abs() < 0.02,
                "underlay {} picked with conditional probability {}",
                i,
                conditional
            );
        }
    }

    #[test]
    fn test_server_candidates_tagged_and_skipping() {
        let mut users = one_user();
        users.insert(
            "bob".to_string(),
            User {
                name: "bob".to_string(),
                password: None,
                hashed_password: Some(hex::encode(cipher::hash_password(b"pw", b"bob"))),
            },
        );
        users.insert(
            "mallory".to_string(),
            User {
                name: "mallory".to_string(),
                password: None,
                hashed_password: Some("zz-not-hex".to_string()),
            },
        );

        let blocks = server_candidates(&users);
        // Three cipher kinds per decodable user; mallory is skipped.
        assert_eq!(blocks.len(), 6);
        let mut names: Vec<_> = blocks
            .iter()
            .map(|b| b.block_context().user_name.clone())
            .collect();
        names.sort();
        assert_eq!(names, ["alice", "alice", "alice", "bob", "bob", "bob"]);
    }

    #[test]
    fn test_server_candidates_hashed_matches_plaintext() {
        let hashed = hex::encode(cipher::hash_password(b"pw", b"carol"));
        let from_hash = server_candidates(&HashMap::from([(
            "carol".to_string(),
            User {
                name: "carol".to_string(),
                password: None,
                hashed_password: Some(hashed),
            },
        )]));
        let from_plain = server_candidates(&HashMap::from([(
            "carol".to_string(),
            User {
                name: "carol".to_string(),
                password: Some("pw".to_string()),
                hashed_password: None,
            },
        )]));

        assert_eq!(from_hash.len(), from_plain.len());
        let nonce = [0u8; crate::cipher::NONCE_SIZE];
        for (a, b) in from_hash.iter().zip(from_plain.iter()) {
            assert_eq!(a.kind(), b.kind());
            let sealed = a.encrypt(&nonce, b"probe", &[]).unwrap();
            assert_eq!(b.decrypt(&nonce, &sealed, &[]).unwrap(), b"probe");
        }
    }
}
