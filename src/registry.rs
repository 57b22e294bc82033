//! Session registry
//!
//! Tracks the 1:1 association between an accepted client connection and its
//! upstream connection. This map is the only shared mutable state in the
//! relay: all socket state stays owned by the bridge task of its session.
//! Connection ids come from an atomic arena counter rather than socket
//! identity, so they stay meaningful in logs after the socket is gone.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{Error, Result};

/// Opaque id assigned to a client connection at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata recorded for a live session pair
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Endpoint the client connected to (e.g. `/realtime-proxy`)
    pub endpoint: &'static str,
    /// Model negotiated with the upstream
    pub model: String,
    /// When the pair became ready
    pub established_at: DateTime<Utc>,
}

/// Registry of live session pairs, keyed by client connection id.
///
/// Alongside the pair map it holds a slot counter for the session cap. Slots
/// are taken at accept time and span the whole bridge lifetime, so sessions
/// still dialing upstream count against the cap even though they have no
/// registry entry yet.
pub struct SessionRegistry {
    next_id: AtomicU64,
    slots: AtomicUsize,
    sessions: Mutex<HashMap<ConnectionId, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh connection id
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Take a session slot, failing when `max` are already taken.
    /// Check and increment are a single atomic operation, so concurrent
    /// accepts cannot both squeeze under the cap.
    pub fn try_reserve(&self, max: usize) -> bool {
        self.slots
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .is_ok()
    }

    /// Give back a slot taken by [`try_reserve`](Self::try_reserve)
    pub fn release(&self) {
        self.slots.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of taken slots (live bridges, dialing ones included)
    pub fn in_flight(&self) -> usize {
        self.slots.load(Ordering::Relaxed)
    }

    /// Register a session pair.
    ///
    /// Fails if an entry already exists for this client id: a client
    /// connection gets at most one upstream connection over its life.
    pub fn register(&self, id: ConnectionId, entry: SessionEntry) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(Error::DuplicateSession(id));
        }
        sessions.insert(id, entry);
        Ok(())
    }

    /// Remove a session pair. Idempotent: unknown ids are a no-op.
    /// Returns whether an entry was actually removed.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.sessions.lock().remove(&id).is_some()
    }

    /// Whether a session pair exists for this id
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Number of live session pairs
    pub fn active(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SessionEntry {
        SessionEntry {
            endpoint: "/realtime-proxy",
            model: "gpt-4o-realtime-preview".to_string(),
            established_at: Utc::now(),
        }
    }

    #[test]
    fn test_allocate_is_monotonic_and_unique() {
        let registry = SessionRegistry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let registry = SessionRegistry::new();
        let id = registry.allocate();

        registry.register(id, entry()).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.active(), 1);

        let err = registry.register(id, entry()).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession(dup) if dup == id));
        // The original entry survives
        assert_eq!(registry.active(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.allocate();
        registry.register(id, entry()).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(!registry.contains(id));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_reregister_after_unregister() {
        // The invariant is per live entry; a freed id could be reused by a
        // new pair (in practice ids are never recycled by the arena).
        let registry = SessionRegistry::new();
        let id = registry.allocate();
        registry.register(id, entry()).unwrap();
        registry.unregister(id);
        registry.register(id, entry()).unwrap();
        assert!(registry.contains(id));
    }

    #[test]
    fn test_reserve_counts_sessions_still_dialing() {
        let registry = SessionRegistry::new();

        // Two accepts under a cap of two, neither registered yet
        assert!(registry.try_reserve(2));
        assert!(registry.try_reserve(2));
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.in_flight(), 2);

        // A third accept is refused even though no pair ever registered
        assert!(!registry.try_reserve(2));

        registry.release();
        assert!(registry.try_reserve(2));
    }

    #[test]
    fn test_reserve_zero_cap_refuses_everything() {
        let registry = SessionRegistry::new();
        assert!(!registry.try_reserve(0));
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_connection_id_display() {
        let registry = SessionRegistry::new();
        let id = registry.allocate();
        assert_eq!(id.to_string(), "conn-1");
    }
}
