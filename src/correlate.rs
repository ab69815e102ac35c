//! API-call correlation.
//!
//! Maps in-flight echo ids to the frontend session that issued the call so
//! an upstream's response finds its way back to the right socket, at most
//! once. Entries are best-effort: a periodic sweeper evicts anything older
//! than the TTL and evicted callers simply see no reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// How long an in-flight API call is remembered.
pub const CORRELATION_TTL: Duration = Duration::from_secs(60);
/// Sweep cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Entry<H> {
    session_id: String,
    handle: H,
    inserted_at: Instant,
    caller_gone: bool,
}

/// Mutex-guarded echo-id map. `H` is the session handle type used to
/// deliver the response; it only needs to be cloneable.
pub struct CorrelationTable<H> {
    entries: Mutex<HashMap<String, Entry<H>>>,
}

impl<H: Clone> CorrelationTable<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record an in-flight call. A duplicate echo id replaces the older
    /// entry — the previous caller's reply window is over.
    pub fn insert(&self, echo: &str, session_id: &str, handle: H) {
        let mut entries = self.entries.lock();
        entries.insert(
            echo.to_string(),
            Entry {
                session_id: session_id.to_string(),
                handle,
                inserted_at: Instant::now(),
                caller_gone: false,
            },
        );
    }

    /// Take the handle for a response. The entry is removed either way;
    /// a `None` means the caller is unknown or already gone.
    pub fn complete(&self, echo: &str) -> Option<H> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(echo)?;
        if entry.caller_gone {
            return None;
        }
        Some(entry.handle)
    }

    /// Flag every entry belonging to a closed session. Future responses for
    /// them are dropped; the sweeper reclaims the slots.
    pub fn mark_session_gone(&self, session_id: &str) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if entry.session_id == session_id {
                entry.caller_gone = true;
            }
        }
    }

    /// Evict entries older than `ttl`. Returns how many were removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - entries.len()
    }

    /// Number of in-flight entries (for stats).
    pub fn in_flight(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<H: Clone> Default for CorrelationTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic eviction loop; runs until the shutdown signal flips.
pub async fn run_sweeper<H: Clone + Send + 'static>(
    table: Arc<CorrelationTable<H>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = table.sweep(CORRELATION_TTL);
                if evicted > 0 {
                    debug!(target: "dispatch", "evicted {evicted} expired correlation entries");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_delivers_at_most_once() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        table.insert("e1", "s1", 7);

        assert_eq!(table.complete("e1"), Some(7));
        assert_eq!(table.complete("e1"), None, "second completion finds nothing");
        assert_eq!(table.complete("unknown"), None);
    }

    #[test]
    fn test_caller_gone_drops_response() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        table.insert("e1", "s1", 7);
        table.insert("e2", "s2", 8);

        table.mark_session_gone("s1");
        assert_eq!(table.complete("e1"), None);
        // Other sessions are unaffected.
        assert_eq!(table.complete("e2"), Some(8));
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        table.insert("e1", "s1", 1);
        table.insert("e2", "s1", 2);

        assert_eq!(table.sweep(Duration::from_secs(60)), 0);
        assert_eq!(table.in_flight(), 2);

        // Zero TTL expires everything immediately.
        assert_eq!(table.sweep(Duration::ZERO), 2);
        assert_eq!(table.in_flight(), 0);
        assert_eq!(table.complete("e1"), None);
    }

    #[test]
    fn test_duplicate_echo_replaces_entry() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        table.insert("e1", "s1", 1);
        table.insert("e1", "s2", 2);
        assert_eq!(table.complete("e1"), Some(2));
    }
}
