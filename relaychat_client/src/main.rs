//! Relaychat terminal client (spec §4.7, expanded in SPEC_FULL.md §4.8).
//!
//! Non-blocking terminal input is out of scope; this reads lines from
//! stdin on its own task instead of raw-mode key-by-key input, which is
//! enough to satisfy the protocol contract at the boundary.

mod endpoint;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use relaychat::{ClientCommand, ClusterConfig, ServerFrame, Timer, TimingConfig};

use endpoint::{ClientEndpoint, PeerTarget, TcpClientEndpoint};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the relaychat service")]
struct Cli {
    /// Pin a single server to connect to, bypassing the cluster config.
    #[arg(long)]
    host: Option<String>,

    /// Port to use with --host.
    #[arg(long)]
    port: Option<u16>,

    /// Cluster config TOML, used to build the initial peer list when
    /// --host/--port are not given.
    #[arg(long, default_value = "cluster.toml")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level: log::LevelFilter = cli.log_level.parse().unwrap_or(log::LevelFilter::Info);
    relaychat::logger_init("client", level);

    let (peers, timing) = match (&cli.host, cli.port) {
        (Some(host), Some(port)) => (
            vec![PeerTarget {
                server_id: "custom".to_string(),
                host: host.clone(),
                port,
            }],
            TimingConfig::default(),
        ),
        _ => match ClusterConfig::from_toml_file(&cli.config) {
            Ok(cluster) => {
                let peers = cluster
                    .peers
                    .iter()
                    .map(|p| PeerTarget {
                        server_id: p.server_id.clone(),
                        host: p.host.clone(),
                        port: p.tcp_port,
                    })
                    .collect();
                (peers, cluster.timing)
            }
            Err(e) => {
                eprintln!("cannot build peer list: {}", e);
                std::process::exit(1);
            }
        },
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("Please enter your name:");
    let username = match line_rx.recv().await {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => "Anonymous".to_string(),
    };

    let mut endpoint = TcpClientEndpoint::new(peers);
    let mut in_room = false;
    let mut current_room: Option<String> = None;

    'outer: loop {
        if !establish_session(&mut endpoint, &username).await {
            println!("[System] Could not reach any server. Retrying...");
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }
        println!("[System] Welcome! You are connected as '{}'.", username);
        print_help(in_room);

        let mut pong_timer = Timer::new(timing.client_pong_timeout());
        let mut ping_ticker = tokio::time::interval(timing.client_ping_interval());
        ping_ticker.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else { break 'outer; };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if handle_user_line(trimmed, in_room, &mut endpoint).await.is_err() {
                        break;
                    }
                    if trimmed.eq_ignore_ascii_case("exit") {
                        break 'outer;
                    }
                }

                _ = ping_ticker.tick() => {
                    let _ = endpoint.send_command(&ClientCommand::Ping).await;
                }

                _ = pong_timer.fired() => {
                    println!("\n[System] Heartbeat timeout. Connection lost.");
                    break;
                }

                frame = endpoint.recv_frame() => {
                    pong_timer.reset();
                    match frame {
                        Ok(Some(frame)) => {
                            handle_server_frame(frame, &mut in_room, &mut current_room);
                        }
                        Ok(None) | Err(_) => {
                            println!("\n[System] Connection lost. Searching for leader...");
                            break;
                        }
                    }
                }
            }
        }

        endpoint.disconnect();
    }

    println!("Exiting...");
}

/// Connects, sends `set_username`, and follows at most one `redirect`
/// hop before giving up for this attempt (spec §4.7(a)/(b)).
async fn establish_session(endpoint: &mut TcpClientEndpoint, username: &str) -> bool {
    for _attempt in 0..endpoint.peers.len().max(1) {
        if endpoint.connect().await.is_err() {
            continue;
        }
        let cmd = ClientCommand::SetUsername {
            username: username.to_string(),
        };
        if endpoint.send_command(&cmd).await.is_err() {
            endpoint.disconnect();
            continue;
        }
        match endpoint.recv_frame().await {
            Ok(Some(ServerFrame::Ack { .. })) => return true,
            Ok(Some(ServerFrame::Redirect {
                leader_id,
                leader_host,
                leader_port,
            })) => {
                println!(
                    "[System] Redirected to leader {} ({}:{})",
                    leader_id, leader_host, leader_port
                );
                endpoint.redirect_to(leader_id, leader_host, leader_port);
                endpoint.disconnect();
                return Box::pin(establish_session(endpoint, username)).await;
            }
            _ => {
                endpoint.disconnect();
                continue;
            }
        }
    }
    false
}

fn print_help(in_room: bool) {
    if in_room {
        println!("\n--- Room Menu ---");
        println!("Commands: <message>, leave, whereami, help, exit");
    } else {
        println!("\n--- Main Menu ---");
        println!("Commands: create <room>, join <room>, list, help, exit");
    }
}

async fn handle_user_line(
    line: &str,
    in_room: bool,
    endpoint: &mut TcpClientEndpoint,
) -> Result<(), relaychat::RelayError> {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next();

    if in_room {
        match command.as_str() {
            "leave" => endpoint.send_command(&ClientCommand::LeaveRoom).await,
            "whereami" => endpoint.send_command(&ClientCommand::WhereAmI).await,
            "help" => {
                print_help(true);
                Ok(())
            }
            "exit" => Ok(()),
            _ => {
                endpoint
                    .send_command(&ClientCommand::Chat {
                        message: line.to_string(),
                    })
                    .await
            }
        }
    } else {
        match command.as_str() {
            "create" => match arg {
                Some(room) => {
                    endpoint
                        .send_command(&ClientCommand::CreateRoom {
                            room_name: room.to_string(),
                        })
                        .await
                }
                None => {
                    println!("Usage: create <room_name>");
                    Ok(())
                }
            },
            "join" => match arg {
                Some(room) => {
                    endpoint
                        .send_command(&ClientCommand::JoinRoom {
                            room_name: room.to_string(),
                        })
                        .await
                }
                None => {
                    println!("Usage: join <room_name>");
                    Ok(())
                }
            },
            "list" => endpoint.send_command(&ClientCommand::ListRooms).await,
            "help" => {
                print_help(false);
                Ok(())
            }
            "exit" => Ok(()),
            _ => {
                println!("Unknown command: '{}'. Type 'help' for a list of commands.", command);
                Ok(())
            }
        }
    }
}

/// Prints an incoming frame and updates room state on join/leave.
fn handle_server_frame(
    frame: ServerFrame,
    in_room: &mut bool,
    current_room: &mut Option<String>,
) {
    match frame {
        ServerFrame::RoomJoined { room_name, message } => {
            *in_room = true;
            *current_room = Some(room_name);
            println!("[System]: {}", message);
            print_help(true);
        }
        ServerFrame::RoomLeft { message } => {
            *in_room = false;
            *current_room = None;
            println!("[System]: {}", message);
            print_help(false);
        }
        ServerFrame::Chat { sender_name, message } => {
            let room = current_room.as_deref().unwrap_or("?");
            println!("[{}] {}: {}", room, sender_name, message);
        }
        ServerFrame::RoomList(rooms) => {
            if rooms.is_empty() {
                println!("Available rooms: None");
            } else {
                println!("Available rooms: {}", rooms.join(", "));
            }
        }
        ServerFrame::Error(msg) => println!("[Error]: {}", msg),
        ServerFrame::Info(msg) => println!("[Info]: {}", msg),
        ServerFrame::Pong {} => {}
        ServerFrame::Ack { .. } | ServerFrame::Redirect { .. } => {}
    }
}
