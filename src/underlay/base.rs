//! Shared underlay chassis
//!
//! Everything a carrier needs besides its socket: the scheduler view,
//! the attached-session table, the accept channel for remote-opened
//! sessions and the completion signal. Concrete underlays embed this.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::metrics;
use crate::shutdown::Shutdown;

use super::scheduler::Scheduler;
use super::session::{Session, SessionHandle};

/// Capacity of the per-underlay accept channel.
const SESSION_CHAN_CAPACITY: usize = 64;

#[derive(Debug)]
pub(crate) struct BaseUnderlay {
    mtu: usize,
    scheduler: Arc<Scheduler>,
    sessions: Arc<Mutex<HashMap<u32, SessionHandle>>>,
    accept_tx: mpsc::Sender<Session>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    shutdown: Shutdown,
    closed: AtomicBool,
}

impl BaseUnderlay {
    /// Create the chassis and count the carrier as established.
    /// `active` tells the open counters apart: true for client dials,
    /// false for server accepts.
    pub(crate) fn new(mtu: usize, active: bool) -> Self {
        if active {
            metrics::record_active_open();
        } else {
            metrics::record_passive_open();
        }
        let (accept_tx, accept_rx) = mpsc::channel(SESSION_CHAN_CAPACITY);
        Self {
            mtu,
            scheduler: Arc::new(Scheduler::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown: Shutdown::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn mtu(&self) -> usize {
        self.mtu
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Attach a session to this carrier. The session is reaped from
    /// the table when its completion signal fires.
    pub(crate) fn add_session(&self, handle: SessionHandle) -> Result<()> {
        if self.shutdown.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let id = handle.id();
        let session_done = handle.done();
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                return Err(Error::Protocol(format!("session {:08x} already attached", id)));
            }
            sessions.insert(id, handle);
        }
        self.scheduler.session_attached();

        let sessions = Arc::clone(&self.sessions);
        let scheduler = Arc::clone(&self.scheduler);
        let underlay_done = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session_done.wait() => {}
                _ = underlay_done.wait() => {}
            }
            if sessions.lock().remove(&id).is_some() {
                scheduler.session_detached();
            }
        });
        Ok(())
    }

    /// Hand a remote-opened session up to the accept side. Called by
    /// the framing layer once the session is ready for consumers.
    pub(crate) async fn deliver(&self, session: Session) -> Result<()> {
        if self.shutdown.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.accept_tx
            .send(session)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next remote-opened session, or `ConnectionClosed` after
    /// teardown.
    pub(crate) async fn accept(&self) -> Result<Session> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            maybe = rx.recv() => maybe.ok_or(Error::ConnectionClosed),
            _ = self.shutdown.wait() => Err(Error::ConnectionClosed),
        }
    }

    /// Tear the carrier down: refuse new attaches, end every attached
    /// session, raise the completion signal. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.begin_teardown();
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.done().close();
            self.scheduler.session_detached();
        }
        self.shutdown.close();
        metrics::record_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_then_accept() {
        let base = BaseUnderlay::new(1400, false);
        let (session, _handle) = Session::pair(11, false, 1400);
        base.deliver(session).await.unwrap();
        let accepted = base.accept().await.unwrap();
        assert_eq!(accepted.id(), 11);
    }

    #[tokio::test]
    async fn test_accept_returns_closed_after_teardown() {
        let base = BaseUnderlay::new(1400, false);
        base.close();
        let err = base.accept().await.unwrap_err();
        assert!(err.is_closed());
        // Further delivers are refused as well.
        let (session, _handle) = Session::pair(1, false, 1400);
        assert!(base.deliver(session).await.is_err());
    }

    #[tokio::test]
    async fn test_add_session_updates_scheduler() {
        let base = BaseUnderlay::new(1400, true);
        let (session, handle) = Session::pair(5, true, 1400);
        base.add_session(handle).unwrap();
        assert_eq!(base.scheduler().session_count(), 1);

        // A duplicate id is refused.
        let (_dup_session, dup_handle) = Session::pair(5, true, 1400);
        assert!(base.add_session(dup_handle).is_err());

        // Ending the session detaches it.
        session.close();
        tokio::task::yield_now().await;
        let mut tries = 0;
        while base.scheduler().session_count() != 0 && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            tries += 1;
        }
        assert_eq!(base.scheduler().session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_attached_sessions() {
        let base = BaseUnderlay::new(1400, true);
        let (session, handle) = Session::pair(9, true, 1400);
        base.add_session(handle).unwrap();
        base.close();
        base.close();
        assert!(base.shutdown().is_closed());
        assert_eq!(base.scheduler().session_count(), 0);
        assert!(!base.scheduler().inc_pending());
        drop(session);
    }
}
