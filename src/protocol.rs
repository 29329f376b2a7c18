//! Wire formats: JSON datagrams between peers over UDP (spec §6), and
//! JSON objects between a client and a server over TCP (spec §4.5/§6).

use serde::{Deserialize, Serialize};

/// Identity recorded for a session once `set_username` is accepted
/// (spec §3 `ClientIdentity`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
}

/// A committed leader-side mutation, broadcast best-effort to every
/// other peer (spec §4.4's "Replicated action" column). Followers apply
/// these idempotently and tolerate arbitrary reordering (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ReplicatedAction {
    CreateRoom {
        room_name: String,
        client_key: String,
    },
    JoinRoom {
        room_name: String,
        client_key: String,
    },
    LeaveRoom {
        room_name: String,
        client_key: String,
    },
    SetIdentity {
        client_key: String,
        identity: Identity,
    },
}

/// Peer-to-peer UDP datagram (spec §4.3, §6). `Heartbeat` and
/// `LeaderAnnouncement` carry their fields inline alongside `type`;
/// `StateReplication` nests its action under a `payload` key, matching
/// spec §6's wire examples exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerWireMsg {
    Heartbeat {
        server_id: String,
    },
    LeaderAnnouncement {
        leader_id: String,
    },
    StateReplication {
        payload: ReplicatedAction,
    },
}

/// A command a connected client sends to the server, one JSON object
/// per `send()` (spec §4.5, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    SetUsername { username: String },
    CreateRoom { room_name: String },
    JoinRoom { room_name: String },
    ListRooms,
    LeaveRoom,
    Chat { message: String },
    #[serde(rename = "whereami")]
    WhereAmI,
    Ping,
}

/// A frame the server sends back to a client (spec §4.5, §6). Unlike
/// `ClientCommand`, the payload shape varies from variant to variant
/// (object, array, bare string, or empty) to match spec §6's examples
/// exactly — `room_list`'s payload is a bare array, `error`/`info`'s
/// payload is a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        command: String,
    },
    Redirect {
        leader_id: String,
        leader_host: String,
        leader_port: u16,
    },
    RoomJoined {
        room_name: String,
        message: String,
    },
    RoomLeft {
        message: String,
    },
    RoomList(Vec<String>),
    Chat {
        sender_name: String,
        message: String,
    },
    Error(String),
    Info(String),
    /// Empty-braces struct variant (not a unit variant) so the
    /// `payload` key always serializes as `{}` rather than being
    /// omitted or emitted as `null`.
    Pong {},
}

impl ServerFrame {
    pub fn error(msg: impl Into<String>) -> Self {
        ServerFrame::Error(msg.into())
    }

    pub fn info(msg: impl Into<String>) -> Self {
        ServerFrame::Info(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips_flat() {
        let msg = PeerWireMsg::Heartbeat {
            server_id: "A".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["server_id"], "A");
        let back: PeerWireMsg = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn state_replication_nests_under_payload() {
        let msg = PeerWireMsg::StateReplication {
            payload: ReplicatedAction::CreateRoom {
                room_name: "lobby".into(),
                client_key: "1.2.3.4:5".into(),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "state_replication");
        assert_eq!(json["payload"]["action"], "create_room");
        assert_eq!(json["payload"]["data"]["room_name"], "lobby");
    }

    #[test]
    fn client_command_parses_from_raw_json() {
        let raw = r#"{"command":"create_room","payload":{"room_name":"lobby"}}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::CreateRoom {
                room_name: "lobby".into()
            }
        );
    }

    #[test]
    fn command_without_payload_parses() {
        let raw = r#"{"command":"ping"}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd, ClientCommand::Ping);
    }

    #[test]
    fn room_list_payload_is_bare_array() {
        let frame = ServerFrame::RoomList(vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn error_payload_is_bare_string() {
        let frame = ServerFrame::error("Room name is required.");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"], "Room name is required.");
    }
}
