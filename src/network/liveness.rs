//! Peer Liveness Tracking
//!
//! Tracks which peers in the static table are currently reachable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Liveness of a single peer
#[derive(Debug, Clone, Copy)]
struct LivenessRecord {
    alive: bool,
    last_seen: Instant,
}

/// Liveness table for every peer in the configuration.
///
/// Peers start out alive. The local node is always reported alive and is
/// never stored in the table.
pub struct PeerTable {
    local: String,
    records: Mutex<HashMap<String, LivenessRecord>>,
}

impl PeerTable {
    pub fn new<I, S>(local: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let local = local.into();
        let now = Instant::now();
        let records = peers
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| *name != local)
            .map(|name| {
                (
                    name,
                    LivenessRecord {
                        alive: true,
                        last_seen: now,
                    },
                )
            })
            .collect();

        Self {
            local,
            records: Mutex::new(records),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, LivenessRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check whether `peer` is in the table (or is this node)
    pub fn contains(&self, peer: &str) -> bool {
        peer == self.local || self.records().contains_key(peer)
    }

    /// Record any successful contact with `peer`. Returns true if the peer
    /// was previously considered down.
    pub fn record_contact(&self, peer: &str) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(peer) else {
            return false;
        };

        record.last_seen = Instant::now();
        if record.alive {
            return false;
        }
        record.alive = true;
        tracing::info!("Peer {} is reachable again", peer);
        true
    }

    /// Mark `peer` unreachable after a failed send. Returns true on a
    /// transition from alive.
    pub fn mark_unreachable(&self, peer: &str) -> bool {
        let mut records = self.records();
        match records.get_mut(peer) {
            Some(record) if record.alive => {
                record.alive = false;
                tracing::warn!("Peer {} marked unreachable", peer);
                true
            }
            _ => false,
        }
    }

    /// Mark down every peer silent for longer than `timeout`. Returns the
    /// names that transitioned.
    pub fn expire(&self, timeout: Duration) -> Vec<String> {
        let mut records = self.records();
        let mut expired = Vec::new();

        for (name, record) in records.iter_mut() {
            if record.alive && record.last_seen.elapsed() > timeout {
                record.alive = false;
                tracing::warn!(
                    "Peer {} timed out ({:?} since last contact)",
                    name,
                    record.last_seen.elapsed()
                );
                expired.push(name.clone());
            }
        }

        expired.sort();
        expired
    }

    pub fn is_alive(&self, peer: &str) -> bool {
        if peer == self.local {
            return true;
        }
        self.records().get(peer).map(|r| r.alive).unwrap_or(false)
    }

    /// Time since the last contact with `peer`
    pub fn last_seen(&self, peer: &str) -> Option<Duration> {
        self.records().get(peer).map(|r| r.last_seen.elapsed())
    }

    /// Liveness of every node, this one included
    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        let mut status: BTreeMap<String, bool> = self
            .records()
            .iter()
            .map(|(name, record)| (name.clone(), record.alive))
            .collect();
        status.insert(self.local.clone(), true);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn table() -> PeerTable {
        PeerTable::new("node-1", ["node-1", "node-2", "node-3"])
    }

    #[test]
    fn test_initial_snapshot() {
        let peers = table();
        let status = peers.snapshot();
        assert_eq!(status.len(), 3);
        assert!(status.values().all(|alive| *alive));
        assert!(peers.contains("node-1"));
        assert!(!peers.contains("node-9"));
    }

    #[test]
    fn test_unreachable_then_contact() {
        let peers = table();
        assert!(peers.mark_unreachable("node-2"));
        assert!(!peers.mark_unreachable("node-2"));
        assert!(!peers.is_alive("node-2"));

        assert!(peers.record_contact("node-2"));
        assert!(peers.is_alive("node-2"));
        assert!(!peers.record_contact("node-2"));
    }

    #[test]
    fn test_local_node_always_alive() {
        let peers = table();
        assert!(!peers.mark_unreachable("node-1"));
        assert!(peers.is_alive("node-1"));
        assert!(peers.expire(Duration::ZERO).iter().all(|n| n != "node-1"));
        assert_eq!(peers.snapshot().get("node-1"), Some(&true));
    }

    #[test]
    fn test_expire_silent_peers() {
        let peers = table();
        thread::sleep(Duration::from_millis(30));
        peers.record_contact("node-3");

        let expired = peers.expire(Duration::from_millis(20));
        assert_eq!(expired, vec!["node-2".to_string()]);
        assert!(!peers.is_alive("node-2"));
        assert!(peers.is_alive("node-3"));
    }

    #[test]
    fn test_unknown_peer_is_not_alive() {
        let peers = table();
        assert!(!peers.is_alive("stranger"));
        assert!(!peers.record_contact("stranger"));
        assert!(peers.last_seen("stranger").is_none());
    }
}
