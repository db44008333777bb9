//! C2 - Stream-ID manager: parity-disciplined, monotonic, collision-free allocation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// Which side of the endpoint this manager allocates IDs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client-initiated streams use odd ids, starting at 1.
    Caller,
    /// Responder-initiated streams use even ids, starting at 2 (reserved; see §4.2).
    Responder,
}

pub struct StreamIdManager {
    next: AtomicU32,
    active: Mutex<HashSet<u32>>,
}

impl StreamIdManager {
    pub fn new(side: Side) -> Self {
        let start = match side {
            Side::Caller => 1,
            Side::Responder => 2,
        };
        Self {
            next: AtomicU32::new(start),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the next id for this side and mark it active.
    pub fn generate_id(&self) -> u32 {
        let id = self.next.fetch_add(2, Ordering::SeqCst);
        self.active.lock().insert(id);
        id
    }

    /// Release an id. Idempotent: releasing twice has the same effect as once.
    pub fn release_id(&self, id: u32) {
        self.active.lock().remove(&id);
    }

    pub fn is_active(&self, id: u32) -> bool {
        self.active.lock().contains(&id)
    }

    /// Record an id that arrived from the remote side as active, without allocating
    /// it from this side's counter (used by the responder when it observes a new
    /// caller-initiated stream).
    pub fn mark_active(&self, id: u32) {
        self.active.lock().insert(id);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_ids_are_odd_and_monotonic() {
        let mgr = StreamIdManager::new(Side::Caller);
        let a = mgr.generate_id();
        let b = mgr.generate_id();
        assert_eq!(a, 1);
        assert_eq!(b, 3);
        assert!(a % 2 == 1 && b % 2 == 1);
    }

    #[test]
    fn responder_ids_are_even() {
        let mgr = StreamIdManager::new(Side::Responder);
        let a = mgr.generate_id();
        assert_eq!(a, 2);
        assert!(a.is_multiple_of(2));
    }

    #[test]
    fn release_is_idempotent() {
        let mgr = StreamIdManager::new(Side::Caller);
        let id = mgr.generate_id();
        assert!(mgr.is_active(id));
        mgr.release_id(id);
        assert!(!mgr.is_active(id));
        mgr.release_id(id);
        assert!(!mgr.is_active(id));
    }

    #[test]
    fn released_ids_are_never_reused() {
        let mgr = StreamIdManager::new(Side::Caller);
        let a = mgr.generate_id();
        mgr.release_id(a);
        let b = mgr.generate_id();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
