//! Failure Detector (spec §4.1): unicast UDP heartbeats plus a sweep
//! tick that derives ACTIVE/FAILED status from heartbeat recency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time;

use crate::config::{ClusterConfig, TimingConfig};
use crate::protocol::PeerWireMsg;
use crate::utils::RelayError;
use crate::{pf_debug, pf_info, pf_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct LivenessEntry {
    status: PeerStatus,
    last_heartbeat: Instant,
}

/// Per-peer liveness view, shared between the send/sweep loops and
/// whichever component (mainly the election monitor) reads it.
struct LivenessTable {
    entries: HashMap<String, LivenessEntry>,
}

/// Maintains this process's view of every other peer's liveness.
///
/// Per spec §4.1: every remote peer starts ACTIVE ("optimistic; prevents
/// a spurious failure at boot before the first round of heartbeats has
/// been exchanged"); a peer only becomes FAILED on a sweep tick, and
/// only becomes ACTIVE again by observing a fresh heartbeat.
pub struct FailureDetector {
    server_id: String,
    socket: Arc<UdpSocket>,
    peers: Vec<(String, SocketAddr)>,
    table: Arc<Mutex<LivenessTable>>,
    timing: TimingConfig,
}

impl FailureDetector {
    pub async fn bind(
        server_id: &str,
        cluster: &ClusterConfig,
        socket: Arc<UdpSocket>,
    ) -> Result<Self, RelayError> {
        let now = Instant::now();
        let mut entries = HashMap::new();
        let mut peers = Vec::new();
        for peer in cluster.others(server_id) {
            entries.insert(
                peer.server_id.clone(),
                LivenessEntry {
                    status: PeerStatus::Active,
                    last_heartbeat: now,
                },
            );
            peers.push((peer.server_id.clone(), peer.udp_addr()?));
        }

        Ok(FailureDetector {
            server_id: server_id.to_string(),
            socket,
            peers,
            table: Arc::new(Mutex::new(LivenessTable { entries })),
            timing: cluster.timing,
        })
    }

    /// Records a heartbeat observed from `peer`, promoting it back to
    /// ACTIVE if it had been marked FAILED (spec §4.1).
    pub async fn observe_heartbeat(&self, peer: &str) {
        if peer == self.server_id {
            return;
        }
        let mut table = self.table.lock().await;
        let now = Instant::now();
        match table.entries.get_mut(peer) {
            Some(entry) => {
                if entry.status == PeerStatus::Failed {
                    pf_info!("peer {} recovered to ACTIVE", peer);
                }
                entry.status = PeerStatus::Active;
                entry.last_heartbeat = now;
            }
            None => {
                // A heartbeat from a peer outside the configured set is
                // not in this process's static cluster config; ignore.
                pf_warn!("heartbeat from unconfigured peer {}", peer);
            }
        }
    }

    /// Sorted list of ACTIVE peer ids, always including self (spec
    /// §4.1, INV-5).
    pub async fn active_peers(&self) -> Vec<String> {
        let table = self.table.lock().await;
        let mut active: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, e)| e.status == PeerStatus::Active)
            .map(|(id, _)| id.clone())
            .collect();
        active.push(self.server_id.clone());
        active.sort();
        active.dedup();
        active
    }

    pub async fn failed_peers(&self) -> Vec<String> {
        let table = self.table.lock().await;
        table
            .entries
            .iter()
            .filter(|(_, e)| e.status == PeerStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Runs the send loop and the sweep loop until `running` flips to
    /// false. Both share the same period (spec §4.1).
    pub async fn run(&self, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut ticker = time::interval(self.timing.heartbeat_interval());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        while running.load(std::sync::atomic::Ordering::Relaxed) {
            ticker.tick().await;
            self.send_heartbeats().await;
            self.sweep().await;
        }
    }

    async fn send_heartbeats(&self) {
        let msg = PeerWireMsg::Heartbeat {
            server_id: self.server_id.clone(),
        };
        let bytes = match serde_json::to_vec(&msg) {
            Ok(b) => b,
            Err(e) => {
                pf_warn!("failed to encode heartbeat: {}", e);
                return;
            }
        };
        for (peer_id, addr) in &self.peers {
            // Send errors are logged and ignored per spec §4.1: the
            // receiver simply misses this beat, and the next tick retries.
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                pf_warn!("failed to send heartbeat to {}: {}", peer_id, e);
            }
        }
    }

    async fn sweep(&self) {
        let death_timeout = self.timing.death_timeout();
        let now = Instant::now();
        let mut table = self.table.lock().await;
        for (peer_id, entry) in table.entries.iter_mut() {
            if entry.status == PeerStatus::Active
                && now.duration_since(entry.last_heartbeat) > death_timeout
            {
                entry.status = PeerStatus::Failed;
                pf_warn!("peer {} detected FAILED (no heartbeat)", peer_id);
            } else {
                pf_debug!(
                    "peer {} last heartbeat {:?} ago",
                    peer_id,
                    now.duration_since(entry.last_heartbeat)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_detector(server_id: &str, peer_ids: &[&str]) -> FailureDetector {
        let socket =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let now = Instant::now();
        let entries = peer_ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    LivenessEntry {
                        status: PeerStatus::Active,
                        last_heartbeat: now,
                    },
                )
            })
            .collect();
        FailureDetector {
            server_id: server_id.to_string(),
            socket,
            peers: vec![],
            table: Arc::new(Mutex::new(LivenessTable { entries })),
            timing: TimingConfig::default(),
        }
    }

    #[tokio::test]
    async fn active_peers_always_includes_self() {
        let det = make_detector("A", &[]).await;
        assert_eq!(det.active_peers().await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn sweep_marks_stale_peer_failed() {
        let det = make_detector("A", &["B"]).await;
        {
            let mut table = det.table.lock().await;
            table.entries.get_mut("B").unwrap().last_heartbeat =
                Instant::now() - det.timing.death_timeout() - std::time::Duration::from_secs(1);
        }
        det.sweep().await;
        assert_eq!(det.failed_peers().await, vec!["B".to_string()]);
        assert_eq!(det.active_peers().await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn observe_heartbeat_recovers_failed_peer() {
        let det = make_detector("A", &["B"]).await;
        {
            let mut table = det.table.lock().await;
            table.entries.get_mut("B").unwrap().status = PeerStatus::Failed;
        }
        det.observe_heartbeat("B").await;
        let mut active = det.active_peers().await;
        active.sort();
        assert_eq!(active, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn observe_heartbeat_from_self_is_noop() {
        let det = make_detector("A", &["B"]).await;
        det.observe_heartbeat("A").await;
        assert_eq!(det.active_peers().await, vec!["A".to_string()]);
    }
}
