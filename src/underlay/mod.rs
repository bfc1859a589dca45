//! Underlay carriers
//!
//! An underlay is an authenticated, encrypted point-to-point carrier
//! able to multiplex many sessions. The controller only sees the
//! `Underlay` capability set; the concrete stream and datagram
//! carriers live in this module.

mod base;
mod datagram;
mod scheduler;
mod session;
mod stream;

pub use datagram::DatagramUnderlay;
pub use scheduler::{Scheduler, DEFAULT_IDLE_TIMEOUT};
pub use session::{Session, SessionHandle};
pub use stream::StreamUnderlay;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::shutdown::Shutdown;

/// Capability set of a carrier, as consumed by the controller.
#[async_trait]
pub trait Underlay: Send + Sync + std::fmt::Display {
    /// MTU sessions on this carrier may assume.
    fn mtu(&self) -> usize;

    /// The pending/idle/disabled view used for reuse and collection.
    fn scheduler(&self) -> &Scheduler;

    /// Completion signal; raised once the carrier is torn down.
    fn done(&self) -> &Shutdown;

    /// Attach a locally created session. `peer` carries the datagram
    /// peer address where the carrier needs one.
    async fn add_session(&self, session: SessionHandle, peer: Option<SocketAddr>) -> Result<()>;

    /// Next remote-opened session, or `ConnectionClosed` once the
    /// carrier is torn down.
    async fn accept(&self) -> Result<Session>;

    /// Drive the carrier until it terminates. The caller closes the
    /// underlay when this returns.
    async fn run_event_loop(&self) -> Result<()>;

    /// Tear the carrier down. Idempotent.
    fn close(&self);
}
