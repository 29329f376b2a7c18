//! Lifecycle Controller (spec §4.6): owns every per-process component,
//! runs the start/stop sequence, and demuxes inbound UDP datagrams (the
//! "UDP Dispatcher" of spec §4.3, folded in here rather than split into
//! its own task since it has no state of its own to own).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::config::ClusterConfig;
use crate::election::ElectionMonitor;
use crate::liveness::FailureDetector;
use crate::protocol::PeerWireMsg;
use crate::session::{handle_connection, ReplicationTx, SharedState};
use crate::utils::{tcp_bind_with_retry, RelayError, MAX_FRAME_SIZE};
use crate::{pf_debug, pf_error, pf_info, pf_warn};

/// Coarse process lifecycle, purely for observability (spec §3's
/// supplemented `ServerStatus`). Not read by any control-flow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub messages_relayed: AtomicU64,
    pub clients_served: AtomicU64,
    pub elections_run: AtomicU64,
}

/// Startup delay before the failure detector begins sending, so that
/// every peer has finished binding its sockets (spec §4.6 step 3).
const STARTUP_DELAY: Duration = Duration::from_secs(2);

/// How often the lifecycle controller logs a counters summary line
/// (debug aid only, not a wire command; SPEC_FULL.md §6).
const COUNTERS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// The single top-level object for one cluster process (spec §9's
/// "explicit server object"). One instance per OS process.
pub struct ServerNode {
    server_id: String,
    cluster: Arc<ClusterConfig>,
    udp_socket: Arc<UdpSocket>,
    tcp_listener: TcpListener,
    detector: Arc<FailureDetector>,
    election: Arc<ElectionMonitor>,
    shared: Arc<Mutex<SharedState>>,
    running: Arc<AtomicBool>,
    status: Mutex<ServerStatus>,
    counters: Arc<Counters>,
}

impl ServerNode {
    /// Step 1 of the start sequence: bind both listening sockets. A
    /// bind failure here is fatal for the process (spec §4.6, §7 item 4).
    pub async fn bind(server_id: &str, cluster: ClusterConfig) -> Result<Self, RelayError> {
        let self_peer = cluster.peer(server_id).ok_or_else(|| {
            RelayError::new(format!("server_id {} not found in cluster config", server_id))
        })?;

        let tcp_bind_addr = SocketAddr::new([0, 0, 0, 0].into(), self_peer.tcp_port);
        let tcp_listener = tcp_bind_with_retry(tcp_bind_addr).await?;

        let udp_bind_addr = SocketAddr::new([0, 0, 0, 0].into(), self_peer.udp_port);
        let udp_socket = Arc::new(UdpSocket::bind(udp_bind_addr).await.map_err(|e| {
            RelayError::new(format!("failed to bind UDP {}: {}", udp_bind_addr, e))
        })?);

        let cluster = Arc::new(cluster);
        let detector =
            Arc::new(FailureDetector::bind(server_id, &cluster, udp_socket.clone()).await?);
        let election = Arc::new(ElectionMonitor::new(
            server_id,
            (*cluster).clone(),
            udp_socket.clone(),
            detector.clone(),
        ));

        pf_info!(
            "bound tcp://0.0.0.0:{} udp://0.0.0.0:{}",
            self_peer.tcp_port,
            self_peer.udp_port
        );

        Ok(ServerNode {
            server_id: server_id.to_string(),
            cluster,
            udp_socket,
            tcp_listener,
            detector,
            election,
            shared: Arc::new(Mutex::new(SharedState::new())),
            running: Arc::new(AtomicBool::new(true)),
            status: Mutex::new(ServerStatus::Starting),
            counters: Arc::new(Counters::default()),
        })
    }

    pub async fn status(&self) -> ServerStatus {
        *self.status.lock().await
    }

    /// This process's current view of cluster leadership, or `None`
    /// before the first election evaluation has run.
    pub async fn current_view(&self) -> Option<crate::election::ClusterView> {
        self.election.current_view().await
    }

    /// Sorted room names currently known to this process (leader or
    /// follower, via direct command or replication).
    pub async fn room_names(&self) -> Vec<String> {
        self.shared.lock().await.chat.room_names()
    }

    /// Runs the server until `stop()` is called from another task, or
    /// until this future is dropped. Implements the full start sequence
    /// (spec §4.6) then blocks serving TCP/UDP forever.
    pub async fn run(self: Arc<Self>) {
        let (replicate_tx, replicate_rx) = mpsc::unbounded_channel();

        let udp_task = tokio::spawn(self.clone().udp_receive_loop());
        let tcp_task = tokio::spawn(self.clone().tcp_accept_loop(replicate_tx.clone()));
        let replicate_task = tokio::spawn(self.clone().replication_send_loop(replicate_rx));
        let counters_task = tokio::spawn(self.clone().counters_log_loop());

        time::sleep(STARTUP_DELAY).await;
        let detector_task = tokio::spawn({
            let this = self.clone();
            async move { this.detector.run(this.running.clone()).await }
        });

        time::sleep(self.cluster.timing.death_timeout()).await;
        let election_task = tokio::spawn({
            let this = self.clone();
            async move { this.election.run(this.running.clone()).await }
        });

        *self.status.lock().await = ServerStatus::Running;
        pf_info!("server {} is READY", self.server_id);

        let _ = tokio::join!(
            udp_task,
            tcp_task,
            replicate_task,
            detector_task,
            election_task,
            counters_task
        );
    }

    /// Cooperative shutdown (spec §4.6 stop sequence): flips the
    /// running flag; background loops observe it on their next timeout
    /// tick and exit on their own.
    pub async fn stop(&self) {
        *self.status.lock().await = ServerStatus::Stopping;
        self.running.store(false, Ordering::Relaxed);
        // Closing listener/socket handles happens when `self` (and thus
        // these fields) is dropped by the caller after `run()` returns;
        // the loops themselves exit as soon as they observe the flag.
        *self.status.lock().await = ServerStatus::Stopped;
    }

    async fn tcp_accept_loop(self: Arc<Self>, replicate_tx: ReplicationTx) {
        while self.running.load(Ordering::Relaxed) {
            let accepted = time::timeout(Duration::from_millis(500), self.tcp_listener.accept()).await;
            let (stream, peer_addr) = match accepted {
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    pf_warn!("tcp accept error: {}", e);
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            self.counters.clients_served.fetch_add(1, Ordering::Relaxed);
            let this = self.clone();
            let replicate_tx = replicate_tx.clone();
            tokio::spawn(async move {
                handle_connection(
                    stream,
                    peer_addr,
                    this.server_id.clone(),
                    this.cluster.clone(),
                    this.cluster.timing,
                    this.election.clone(),
                    this.shared.clone(),
                    replicate_tx,
                    this.running.clone(),
                )
                .await;
            });
        }
    }

    async fn udp_receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        while self.running.load(Ordering::Relaxed) {
            let received =
                time::timeout(Duration::from_millis(500), self.udp_socket.recv_from(&mut buf)).await;
            let (len, _from) = match received {
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    pf_warn!("udp recv error: {}", e);
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            // Oversized datagrams are truncated by the transport and
            // treated as malformed (spec §4.3).
            if len == buf.len() {
                pf_warn!("dropping udp datagram at or above {} bytes", MAX_FRAME_SIZE);
                continue;
            }

            match serde_json::from_slice::<PeerWireMsg>(&buf[..len]) {
                Ok(PeerWireMsg::Heartbeat { server_id }) => {
                    self.detector.observe_heartbeat(&server_id).await;
                }
                Ok(PeerWireMsg::LeaderAnnouncement { leader_id }) => {
                    self.counters.elections_run.fetch_add(1, Ordering::Relaxed);
                    self.election.on_announcement(&leader_id).await;
                }
                Ok(PeerWireMsg::StateReplication { payload }) => {
                    let mut shared = self.shared.lock().await;
                    shared.chat.apply_replicated(payload);
                }
                Err(e) => {
                    pf_debug!("dropping malformed udp datagram: {}", e);
                }
            }
        }
    }

    /// Periodic debug-aid summary of the observability counters (spec
    /// §3, SPEC_FULL.md §6) — not a wire command, purely for an operator
    /// tailing logs.
    async fn counters_log_loop(self: Arc<Self>) {
        let mut elapsed = Duration::ZERO;
        while self.running.load(Ordering::Relaxed) {
            time::sleep(Duration::from_millis(500)).await;
            elapsed += Duration::from_millis(500);
            if elapsed < COUNTERS_LOG_INTERVAL {
                continue;
            }
            elapsed = Duration::ZERO;
            pf_info!(
                "counters: messages_relayed={} clients_served={} elections_run={}",
                self.counters.messages_relayed.load(Ordering::Relaxed),
                self.counters.clients_served.load(Ordering::Relaxed),
                self.counters.elections_run.load(Ordering::Relaxed)
            );
        }
    }

    async fn replication_send_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<crate::protocol::ReplicatedAction>,
    ) {
        while let Some(action) = rx.recv().await {
            let msg = PeerWireMsg::StateReplication { payload: action };
            let bytes = match serde_json::to_vec(&msg) {
                Ok(b) => b,
                Err(e) => {
                    pf_error!("failed to encode state_replication: {}", e);
                    continue;
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
                self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.udp_socket.send_to(&bytes, addr).await {
                    pf_warn!("failed to replicate to {}: {}", peer.server_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DurationSecs, PeerDescriptor, TimingConfig};
    use crate::protocol::{ClientCommand, ServerFrame};
    use crate::utils::{safe_tcp_read, safe_tcp_write};
    use std::net::TcpListener as StdTcpListener;
    use tokio::net::TcpStream;

    /// Grabs an ephemeral port by binding and immediately dropping a
    /// std listener on it; good enough for a test-local cluster config.
    fn free_port() -> u16 {
        StdTcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Fast enough that a two-node test doesn't spend most of its time
    /// sleeping, while still satisfying `TimingConfig::validate()`.
    fn fast_timing() -> TimingConfig {
        TimingConfig {
            heartbeat_interval: DurationSecs(0.05),
            death_timeout: DurationSecs(0.15),
            election_period: DurationSecs(0.2),
            session_recv_timeout: DurationSecs(0.2),
            client_ping_interval: DurationSecs(2.5),
            client_pong_timeout: DurationSecs(10.0),
        }
    }

    fn two_node_cluster() -> ClusterConfig {
        ClusterConfig {
            peers: vec![
                PeerDescriptor {
                    server_id: "A".into(),
                    host: "127.0.0.1".into(),
                    tcp_port: free_port(),
                    udp_port: free_port(),
                    rank: 10,
                },
                PeerDescriptor {
                    server_id: "B".into(),
                    host: "127.0.0.1".into(),
                    tcp_port: free_port(),
                    udp_port: free_port(),
                    rank: 20,
                },
            ],
            timing: fast_timing(),
        }
    }

    /// Sleeps past the fixed startup delay plus one death timeout, the
    /// point by which both nodes' election monitors have run at least
    /// once (spec §4.6 steps 3-4).
    async fn wait_for_election(timing: &TimingConfig) {
        time::sleep(STARTUP_DELAY + timing.death_timeout() + Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn two_node_cluster_elects_higher_rank_and_serves_clients() {
        let cluster = two_node_cluster();
        let node_a = Arc::new(ServerNode::bind("A", cluster.clone()).await.unwrap());
        let node_b = Arc::new(ServerNode::bind("B", cluster.clone()).await.unwrap());

        tokio::spawn(node_a.clone().run());
        tokio::spawn(node_b.clone().run());
        wait_for_election(&cluster.timing).await;

        let view_a = node_a.current_view().await.unwrap();
        let view_b = node_b.current_view().await.unwrap();
        assert_eq!(view_a.leader_id, "B");
        assert_eq!(view_b.leader_id, "B");
        assert!(view_b.is_self_leader);

        let leader_addr = cluster.peer("B").unwrap().tcp_addr().unwrap();
        let mut client = TcpStream::connect(leader_addr).await.unwrap();
        safe_tcp_write(
            &mut client,
            &ClientCommand::SetUsername {
                username: "alice".into(),
            },
        )
        .await
        .unwrap();
        let ack: ServerFrame = safe_tcp_read(&mut client).await.unwrap().unwrap();
        assert!(matches!(ack, ServerFrame::Ack { .. }));

        safe_tcp_write(
            &mut client,
            &ClientCommand::CreateRoom {
                room_name: "lobby".into(),
            },
        )
        .await
        .unwrap();
        let joined: ServerFrame = safe_tcp_read(&mut client).await.unwrap().unwrap();
        assert!(matches!(joined, ServerFrame::RoomJoined { .. }));

        // Best-effort UDP replication is async; give it a moment to land.
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node_a.room_names().await, vec!["lobby".to_string()]);

        node_a.stop().await;
        node_b.stop().await;
    }

    #[tokio::test]
    async fn connecting_to_follower_redirects_to_leader() {
        let cluster = two_node_cluster();
        let node_a = Arc::new(ServerNode::bind("A", cluster.clone()).await.unwrap());
        let node_b = Arc::new(ServerNode::bind("B", cluster.clone()).await.unwrap());

        tokio::spawn(node_a.clone().run());
        tokio::spawn(node_b.clone().run());
        wait_for_election(&cluster.timing).await;

        let follower_addr = cluster.peer("A").unwrap().tcp_addr().unwrap();
        let mut client = TcpStream::connect(follower_addr).await.unwrap();
        safe_tcp_write(
            &mut client,
            &ClientCommand::SetUsername {
                username: "bob".into(),
            },
        )
        .await
        .unwrap();
        let frame: ServerFrame = safe_tcp_read(&mut client).await.unwrap().unwrap();
        match frame {
            ServerFrame::Redirect { leader_id, .. } => assert_eq!(leader_id, "B"),
            other => panic!("expected a redirect frame, got {:?}", other),
        }

        node_a.stop().await;
        node_b.stop().await;
    }
}
