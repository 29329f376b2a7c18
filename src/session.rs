//! TCP Session Handler (spec §4.5): per-connection accept-time
//! redirect-or-register branch, and the leader-side command loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::config::{ClusterConfig, TimingConfig};
use crate::election::ElectionMonitor;
use crate::protocol::{ClientCommand, ReplicatedAction, ServerFrame};
use crate::state::ChatState;
use crate::utils::{safe_tcp_read, safe_tcp_write};
use crate::{pf_debug, pf_info, pf_warn};

/// A session's identity/room lifecycle (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    PendingIdentity,
    Ready,
}

/// Chat fan-out target: every `READY` session gets a channel so other
/// sessions' command loops can push `chat` frames to it without
/// touching its socket directly (avoids two tasks writing the same
/// stream concurrently).
pub type SessionRegistry = HashMap<String, mpsc::UnboundedSender<ServerFrame>>;

/// Everything the command dispatcher needs under one lock (spec §5:
/// "one process-wide coarse lock" covering liveness, room/identity
/// state, and the session registry).
pub struct SharedState {
    pub chat: ChatState,
    pub sessions: SessionRegistry,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            chat: ChatState::new(),
            sessions: HashMap::new(),
        }
    }
}

/// Broadcasts a leader-committed replicated action to every peer.
/// Implemented as a channel so the session loop never blocks on UDP
/// I/O while holding the state lock (spec §5).
pub type ReplicationTx = mpsc::UnboundedSender<ReplicatedAction>;

/// Handles one accepted TCP connection end to end: the accept-time
/// redirect-or-register branch, the command loop if registered, and
/// teardown on disconnect.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    server_id: String,
    cluster: Arc<ClusterConfig>,
    timing: TimingConfig,
    election: Arc<ElectionMonitor>,
    shared: Arc<Mutex<SharedState>>,
    replicate_tx: ReplicationTx,
    running: Arc<AtomicBool>,
) {
    let client_key = peer_addr.to_string();

    let view = election.current_view().await;
    let is_leader = view.as_ref().map(|v| v.is_self_leader).unwrap_or(false);

    if !is_leader {
        if let Some(view) = view {
            if let Some(leader) = cluster.peer(&view.leader_id) {
                let frame = ServerFrame::Redirect {
                    leader_id: leader.server_id.clone(),
                    leader_host: leader.host.clone(),
                    leader_port: leader.tcp_port,
                };
                if let Err(e) = safe_tcp_write(&mut stream, &frame).await {
                    pf_warn!("failed to send redirect to {}: {}", client_key, e);
                }
            } else {
                pf_warn!(
                    "current leader {} is not in cluster config, closing without redirect",
                    view.leader_id
                );
            }
        }
        // `current_leader` empty, or not found: close without a frame,
        // the client will retry another peer (spec §4.5).
        return;
    }

    pf_info!("{} connected to leader {}, registering session", client_key, server_id);
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    {
        let mut shared = shared.lock().await;
        shared.sessions.insert(client_key.clone(), tx);
    }

    let mut phase = SessionPhase::PendingIdentity;
    let mut username: Option<String> = None;
    let recv_timeout = timing.session_recv_timeout();

    'session: loop {
        tokio::select! {
            biased;

            pushed = rx.recv() => {
                match pushed {
                    Some(frame) => {
                        if safe_tcp_write(&mut stream, &frame).await.is_err() {
                            break 'session;
                        }
                    }
                    None => break 'session,
                }
            }

            read_result = time::timeout(recv_timeout, safe_tcp_read::<ClientCommand>(&mut stream)) => {
                if !running.load(Ordering::Relaxed) {
                    break 'session;
                }
                let cmd = match read_result {
                    Err(_elapsed) => continue, // recheck running flag and drain pushes
                    Ok(Err(_decode_or_io_err)) => break 'session,
                    Ok(Ok(None)) => break 'session, // EOF
                    Ok(Ok(Some(cmd))) => cmd,
                };

                match phase {
                    SessionPhase::PendingIdentity => {
                        if let ClientCommand::SetUsername { username: name } = cmd {
                            let (reply, replicate) = {
                                let mut shared = shared.lock().await;
                                let applied = shared.chat.apply_command(
                                    &client_key,
                                    username.as_deref(),
                                    ClientCommand::SetUsername { username: name.clone() },
                                );
                                (applied.reply, applied.replicate)
                            };
                            username = Some(name);
                            phase = SessionPhase::Ready;
                            if let Some(action) = replicate {
                                let _ = replicate_tx.send(action);
                            }
                            if safe_tcp_write(&mut stream, &reply).await.is_err() {
                                break 'session;
                            }
                        } else {
                            pf_warn!(
                                "{} sent {:?} before set_username, ignoring",
                                client_key,
                                cmd
                            );
                        }
                    }

                    SessionPhase::Ready => {
                        if !dispatch_ready_command(
                            &client_key,
                            &mut stream,
                            &shared,
                            &replicate_tx,
                            cmd,
                        )
                        .await
                        {
                            break 'session;
                        }
                    }
                }
            }
        }
    }

    teardown(&client_key, &shared, &replicate_tx).await;
}

/// Handles one command once the session is `READY`. Returns `false` if
/// the connection should be torn down (write failure).
async fn dispatch_ready_command(
    client_key: &str,
    stream: &mut TcpStream,
    shared: &Arc<Mutex<SharedState>>,
    replicate_tx: &ReplicationTx,
    cmd: ClientCommand,
) -> bool {
    if let ClientCommand::Chat { message } = cmd {
        let targets = {
            let shared = shared.lock().await;
            match shared.chat.room_of(client_key) {
                None => None,
                Some(room_name) => {
                    let room_name = room_name.to_string();
                    let sender_name = shared
                        .chat
                        .identity_of(client_key)
                        .map(|i| i.username.clone())
                        .unwrap_or_else(|| client_key.to_string());
                    let members = shared.chat.members_of(&room_name);
                    Some((sender_name, members))
                }
            }
        };
        return match targets {
            None => {
                safe_tcp_write(stream, &ServerFrame::error("You are not in a room.")).await.is_ok()
            }
            Some((sender_name, members)) => {
                let frame = ServerFrame::Chat {
                    sender_name,
                    message,
                };
                let shared = shared.lock().await;
                for member in members {
                    if member == client_key {
                        continue;
                    }
                    if let Some(tx) = shared.sessions.get(&member) {
                        let _ = tx.send(frame.clone());
                    }
                }
                drop(shared);
                true
            }
        };
    }

    let (reply, replicate) = {
        let mut shared = shared.lock().await;
        let username = shared.chat.identity_of(client_key).map(|i| i.username.clone());
        let applied = shared.chat.apply_command(client_key, username.as_deref(), cmd);
        (applied.reply, applied.replicate)
    };
    if let Some(action) = replicate {
        let _ = replicate_tx.send(action);
    }
    safe_tcp_write(stream, &reply).await.is_ok()
}

async fn teardown(client_key: &str, shared: &Arc<Mutex<SharedState>>, replicate_tx: &ReplicationTx) {
    let left_room = {
        let mut shared = shared.lock().await;
        shared.sessions.remove(client_key);
        shared.chat.teardown_session(client_key)
    };
    if let Some(room_name) = left_room {
        pf_debug!("{} disconnected from room {}", client_key, room_name);
        let _ = replicate_tx.send(ReplicatedAction::LeaveRoom {
            room_name,
            client_key: client_key.to_string(),
        });
    } else {
        pf_debug!("{} disconnected", client_key);
    }
}
