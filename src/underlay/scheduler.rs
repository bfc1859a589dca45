//! Per-underlay scheduling view
//!
//! The controller decides reuse and collection from three indicators:
//! how many dials are currently attaching (`pending`), whether the
//! carrier has gone idle, and whether it has been administratively
//! disabled. All of it is lock-free except the activity instant.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Idle timeout applied to underlays that do not configure their own.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending/idle/disabled indicators for one underlay.
#[derive(Debug)]
pub struct Scheduler {
    /// Dials currently attaching a session.
    pending: AtomicUsize,
    /// Sessions currently attached.
    sessions: AtomicUsize,
    /// Administratively removed from reuse selection.
    disabled: AtomicBool,
    /// Teardown has begun; no further attaches are admitted.
    tearing_down: AtomicBool,
    last_active: Mutex<Instant>,
    idle_timeout: Mutex<Duration>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            idle_timeout: Mutex::new(DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// Announce a dial that is about to attach a session. Returns
    /// false iff the underlay is being torn down, in which case the
    /// caller must pick another carrier.
    pub fn inc_pending(&self) -> bool {
        if self.tearing_down.load(Ordering::Acquire) {
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.touch();
        true
    }

    /// Release a previously announced attach.
    pub fn dec_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Whether the idle collector may close this underlay: nothing
    /// attached, nothing attaching, and no activity for the idle
    /// timeout.
    pub fn idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
            && self.sessions.load(Ordering::Acquire) == 0
            && self.last_active.lock().elapsed() >= *self.idle_timeout.lock()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Remove this underlay from reuse selection without closing it.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock() = timeout;
    }

    /// Refuse all future attaches. Called once teardown starts.
    pub(crate) fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::Release);
    }

    /// Record carrier activity.
    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub(crate) fn session_attached(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn session_detached(&self) {
        let _ = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.touch();
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_bracket() {
        let sched = Scheduler::new();
        assert!(sched.inc_pending());
        assert!(sched.inc_pending());
        assert_eq!(sched.pending_count(), 2);
        sched.dec_pending();
        sched.dec_pending();
        assert_eq!(sched.pending_count(), 0);
        // An extra release must not underflow.
        sched.dec_pending();
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn test_teardown_refuses_attach() {
        let sched = Scheduler::new();
        sched.begin_teardown();
        assert!(!sched.inc_pending());
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn test_idle_requires_quiescence() {
        let sched = Scheduler::new();
        sched.set_idle_timeout(Duration::ZERO);
        assert!(sched.idle());

        assert!(sched.inc_pending());
        assert!(!sched.idle());
        sched.dec_pending();

        sched.session_attached();
        assert!(!sched.idle());
        sched.session_detached();
        assert!(sched.idle());
    }

    #[test]
    fn test_disable_is_sticky() {
        let sched = Scheduler::new();
        assert!(!sched.is_disabled());
        sched.disable();
        assert!(sched.is_disabled());
        // Disabled underlays still admit in-flight attaches.
        assert!(sched.inc_pending());
    }
}
