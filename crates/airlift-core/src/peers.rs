//! The set of currently-visible peers.
//!
//! Upserts are linearized per peer id behind the directory mutex
//! (last-writer-wins on `last_seen`); every other component gets
//! read-only snapshots. A background sweep prunes entries older than the
//! configured staleness window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How a peer was last sighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// Short-range radio sighting with signal strength.
    Radio { rssi: i16 },
    /// Resolved on the local network.
    LocalNetwork,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    /// host:port endpoint for session negotiation, when known.
    pub discovery_address: Option<String>,
    pub reachability: Reachability,
    pub last_seen: Instant,
}

#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<Mutex<HashMap<String, Peer>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer sighting. A radio sighting never erases a known
    /// network endpoint; the freshest timestamp always wins.
    pub fn upsert(&self, sighting: Peer) {
        let mut map = self.inner.lock().expect("peer directory lock");
        match map.get_mut(&sighting.id) {
            Some(existing) => {
                existing.display_name = sighting.display_name;
                existing.reachability = sighting.reachability;
                existing.last_seen = sighting.last_seen;
                if sighting.discovery_address.is_some() {
                    existing.discovery_address = sighting.discovery_address;
                }
            }
            None => {
                tracing::debug!(peer = %sighting.id, "Peer appeared");
                map.insert(sighting.id.clone(), sighting);
            }
        }
    }

    pub fn remove(&self, peer_id: &str) -> Option<Peer> {
        self.inner.lock().expect("peer directory lock").remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.inner
            .lock()
            .expect("peer directory lock")
            .get(peer_id)
            .cloned()
    }

    /// Snapshot ordered most-recently-seen first.
    pub fn snapshot(&self) -> Vec<Peer> {
        let map = self.inner.lock().expect("peer directory lock");
        let mut peers: Vec<Peer> = map.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Drop peers unseen for longer than `stale_after`. Returns the
    /// number of entries removed.
    pub fn sweep(&self, now: Instant, stale_after: Duration) -> usize {
        let mut map = self.inner.lock().expect("peer directory lock");
        let before = map.len();
        map.retain(|_, peer| now.duration_since(peer.last_seen) <= stale_after);
        let removed = before - map.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept stale peers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer directory lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, seen: Instant) -> Peer {
        Peer {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            discovery_address: None,
            reachability: Reachability::Radio { rssi: -40 },
            last_seen: seen,
        }
    }

    #[test]
    fn upsert_refreshes_last_seen() {
        let dir = PeerDirectory::new();
        let t0 = Instant::now();
        dir.upsert(peer("aa", t0));

        let t1 = t0 + Duration::from_secs(3);
        dir.upsert(peer("aa", t1));

        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("aa").unwrap().last_seen, t1);
    }

    #[test]
    fn snapshot_orders_most_recent_first() {
        let dir = PeerDirectory::new();
        let t0 = Instant::now();
        dir.upsert(peer("old", t0));
        dir.upsert(peer("mid", t0 + Duration::from_secs(1)));
        dir.upsert(peer("new", t0 + Duration::from_secs(2)));

        let ids: Vec<_> = dir.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn radio_sighting_keeps_known_endpoint() {
        let dir = PeerDirectory::new();
        let t0 = Instant::now();
        let mut with_addr = peer("aa", t0);
        with_addr.discovery_address = Some("192.168.1.5:9000".to_string());
        dir.upsert(with_addr);

        dir.upsert(peer("aa", t0 + Duration::from_secs(1)));
        assert_eq!(
            dir.get("aa").unwrap().discovery_address.as_deref(),
            Some("192.168.1.5:9000")
        );
    }

    #[test]
    fn sweep_keeps_exactly_the_peers_inside_the_window() {
        let dir = PeerDirectory::new();
        let stale_after = Duration::from_secs(30);
        let t0 = Instant::now();

        // A burst of sightings at varying ages.
        for (id, age) in [("a", 0u64), ("b", 10), ("c", 29), ("d", 31), ("e", 120)] {
            dir.upsert(peer(id, t0 - Duration::from_secs(age)));
        }

        let removed = dir.sweep(t0, stale_after);
        assert_eq!(removed, 2);

        let mut ids: Vec<_> = dir.snapshot().into_iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn resighted_peer_survives_the_sweep() {
        let dir = PeerDirectory::new();
        let stale_after = Duration::from_secs(30);
        let t0 = Instant::now();

        dir.upsert(peer("aa", t0 - Duration::from_secs(40)));
        dir.upsert(peer("aa", t0 - Duration::from_secs(1)));

        assert_eq!(dir.sweep(t0, stale_after), 0);
        assert_eq!(dir.len(), 1);
    }
}
