//! Election Monitor (spec §4.2): derives a single cluster-wide leader
//! from the failure detector's liveness view by a deterministic,
//! rank-based rule, re-evaluated on a timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time;

use crate::config::ClusterConfig;
use crate::liveness::FailureDetector;
use crate::protocol::PeerWireMsg;
use crate::{pf_info, pf_warn};

/// This process's current view of cluster leadership. Cheap to clone;
/// read by the session handler on every new connection to decide
/// whether to serve or redirect (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub leader_id: String,
    pub is_self_leader: bool,
}

struct Inner {
    view: Option<ClusterView>,
}

pub struct ElectionMonitor {
    server_id: String,
    cluster: ClusterConfig,
    socket: Arc<UdpSocket>,
    detector: Arc<FailureDetector>,
    state: RwLock<Inner>,
}

impl ElectionMonitor {
    pub fn new(
        server_id: &str,
        cluster: ClusterConfig,
        socket: Arc<UdpSocket>,
        detector: Arc<FailureDetector>,
    ) -> Self {
        ElectionMonitor {
            server_id: server_id.to_string(),
            cluster,
            socket,
            detector,
            state: RwLock::new(Inner { view: None }),
        }
    }

    /// Current view, or `None` before the first evaluation has run
    /// (spec §4.2: "until the first evaluation, a server considers
    /// leadership undetermined and serves no clients").
    pub async fn current_view(&self) -> Option<ClusterView> {
        self.state.read().await.view.clone()
    }

    /// Applies an announcement received from `leader_id` without
    /// waiting for the next periodic tick (spec §4.2 "Handling
    /// announcements": on receipt of `leader_announcement(L)`, if
    /// `L != current_leader`, adopt it — unconditional, no rank
    /// comparison, so a legitimate winner's announcement is never
    /// rejected by a stale higher-rank view of a peer that has since
    /// died).
    pub async fn on_announcement(&self, leader_id: &str) {
        if self.cluster.peer(leader_id).is_none() {
            pf_warn!("leader_announcement from unconfigured peer {}", leader_id);
            return;
        }
        let mut state = self.state.write().await;
        let should_adopt = match &state.view {
            None => true,
            Some(current) => current.leader_id != leader_id,
        };
        if should_adopt {
            let new_view = ClusterView {
                leader_id: leader_id.to_string(),
                is_self_leader: leader_id == self.server_id,
            };
            if state.view.as_ref() != Some(&new_view) {
                pf_info!("adopting leader {} by announcement", leader_id);
            }
            state.view = Some(new_view);
        }
    }

    /// Runs the periodic re-evaluation loop until `running` clears.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        let mut ticker = time::interval(self.cluster.timing.election_period());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.evaluate().await;
        }
    }

    /// Computes the highest-rank (lexicographic `server_id` tie-break)
    /// peer among the currently ACTIVE set, per spec §4.2's election
    /// rule. If the winner is self, broadcasts `leader_announcement`.
    ///
    /// Sticky leader (spec §4.2 step 2): if a current leader is already
    /// recorded and it is still in the ACTIVE set, this does nothing —
    /// a rejoining higher-rank peer does not unseat a live,
    /// already-elected lower-rank leader.
    async fn evaluate(&self) {
        let active = self.detector.active_peers().await;

        if let Some(current) = self.state.read().await.view.as_ref() {
            if active.contains(&current.leader_id) {
                return;
            }
        }

        let winner = active
            .iter()
            .filter_map(|id| self.cluster.peer(id).map(|p| (p.rank, &p.server_id)))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, id)| id.clone());

        let Some(winner) = winner else {
            pf_warn!("election evaluation found no active peers, including self");
            return;
        };

        let mut state = self.state.write().await;
        let new_view = ClusterView {
            leader_id: winner.clone(),
            is_self_leader: winner == self.server_id,
        };
        let changed = state.view.as_ref() != Some(&new_view);
        state.view = Some(new_view);
        drop(state);

        if changed {
            pf_info!("elected leader: {}", winner);
        }
        if winner == self.server_id {
            self.broadcast_announcement().await;
        }
    }

    async fn broadcast_announcement(&self) {
        let msg = PeerWireMsg::LeaderAnnouncement {
            leader_id: self.server_id.clone(),
        };
        let bytes = match serde_json::to_vec(&msg) {
            Ok(b) => b,
            Err(e) => {
                pf_warn!("failed to encode leader_announcement: {}", e);
                return;
            }
        };
        for peer in self.cluster.others(&self.server_id) {
            let addr = match peer.udp_addr() {
                Ok(a) => a,
                Err(e) => {
                    pf_warn!("cannot resolve {}: {}", peer.server_id, e);
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                pf_warn!(
                    "failed to send leader_announcement to {}: {}",
                    peer.server_id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerDescriptor, TimingConfig};

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            peers: vec![
                PeerDescriptor {
                    server_id: "A".into(),
                    host: "127.0.0.1".into(),
                    tcp_port: 9001,
                    udp_port: 9101,
                    rank: 10,
                },
                PeerDescriptor {
                    server_id: "B".into(),
                    host: "127.0.0.1".into(),
                    tcp_port: 9002,
                    udp_port: 9102,
                    rank: 20,
                },
                PeerDescriptor {
                    server_id: "C".into(),
                    host: "127.0.0.1".into(),
                    tcp_port: 9003,
                    udp_port: 9103,
                    rank: 20,
                },
            ],
            timing: TimingConfig::default(),
        }
    }

    async fn monitor_for(server_id: &str) -> ElectionMonitor {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let detector = Arc::new(
            FailureDetector::bind(server_id, &cluster(), socket.clone())
                .await
                .unwrap(),
        );
        ElectionMonitor::new(server_id, cluster(), socket, detector)
    }

    #[tokio::test]
    async fn evaluate_picks_highest_rank() {
        let mon = monitor_for("A").await;
        mon.detector.observe_heartbeat("B").await;
        mon.detector.observe_heartbeat("C").await;
        mon.evaluate().await;
        let view = mon.current_view().await.unwrap();
        // B and C tie on rank 20; lexicographic tie-break picks B.
        assert_eq!(view.leader_id, "B");
        assert!(!view.is_self_leader);
    }

    #[tokio::test]
    async fn self_is_leader_when_highest_rank_active() {
        let mon = monitor_for("B").await;
        mon.detector.observe_heartbeat("A").await;
        mon.evaluate().await;
        let view = mon.current_view().await.unwrap();
        assert_eq!(view.leader_id, "B");
        assert!(view.is_self_leader);
    }

    #[tokio::test]
    async fn announcement_adopted_when_no_current_view() {
        let mon = monitor_for("A").await;
        mon.on_announcement("B").await;
        let view = mon.current_view().await.unwrap();
        assert_eq!(view.leader_id, "B");
    }

    #[tokio::test]
    async fn announcement_adopted_even_with_lower_rank_than_current() {
        let mon = monitor_for("A").await;
        mon.detector.observe_heartbeat("B").await;
        mon.detector.observe_heartbeat("C").await;
        mon.evaluate().await;
        assert_eq!(mon.current_view().await.unwrap().leader_id, "B");

        // A has lower rank than the current leader B, but announcement
        // adoption is unconditional on leader_id != current_leader: this
        // is the fast path that lets a legitimate winner propagate without
        // waiting a full election_period, even to a peer whose view is
        // stale (e.g. still shows a higher-rank leader that has since died).
        mon.on_announcement("A").await;
        assert_eq!(mon.current_view().await.unwrap().leader_id, "A");
    }
}
