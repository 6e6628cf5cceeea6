use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one accepted connection.
///
/// Ids come from a process-wide counter and are never reused, so a registry
/// entry holding a stale id can never address a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Allocator for [`ConnectionId`]s, shared by every listener of one daemon.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_monotonic() {
        let ids = ConnectionIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "conn-1");
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let ids = Arc::new(ConnectionIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<ConnectionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
