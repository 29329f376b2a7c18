//! Room & Identity State Machine (spec §4.4): on the leader, validates
//! and applies each client command; on followers, applies replicated
//! actions idempotently.

use std::collections::{HashMap, HashSet};

use crate::protocol::{ClientCommand, Identity, ReplicatedAction, ServerFrame};
use crate::pf_debug;

#[derive(Debug, Clone, Default)]
pub struct Room {
    pub members: HashSet<String>,
}

/// All mutable chat state, leader- and follower-side alike. Lives
/// behind the same lock as the liveness table and session registry
/// (spec §5: one process-wide coarse lock).
#[derive(Debug, Default)]
pub struct ChatState {
    rooms: HashMap<String, Room>,
    /// client_key -> room_name, kept in sync with `rooms` membership.
    client_to_room: HashMap<String, String>,
    identities: HashMap<String, Identity>,
}

/// Outcome of applying a leader-side command: the reply owed to the
/// caller, and the replicated action to broadcast, if any (spec §4.4's
/// table last two columns).
pub struct Applied {
    pub reply: ServerFrame,
    pub replicate: Option<ReplicatedAction>,
}

impl Applied {
    fn reply_only(reply: ServerFrame) -> Self {
        Applied {
            reply,
            replicate: None,
        }
    }
    fn with_replication(reply: ServerFrame, action: ReplicatedAction) -> Self {
        Applied {
            reply,
            replicate: Some(action),
        }
    }
}

impl ChatState {
    pub fn new() -> Self {
        ChatState::default()
    }

    pub fn identity_of(&self, client_key: &str) -> Option<&Identity> {
        self.identities.get(client_key)
    }

    pub fn room_of(&self, client_key: &str) -> Option<&str> {
        self.client_to_room.get(client_key).map(|s| s.as_str())
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn members_of(&self, room_name: &str) -> Vec<String> {
        self.rooms
            .get(room_name)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes `client_key` from whatever room it currently occupies,
    /// if any. Used both by explicit `leave_room` and by the implicit
    /// leave-then-join rule (spec §4.4 edge case 4) and by session
    /// teardown (spec §4.5).
    fn leave_current_room(&mut self, client_key: &str) -> Option<String> {
        let room_name = self.client_to_room.remove(client_key)?;
        if let Some(room) = self.rooms.get_mut(&room_name) {
            room.members.remove(client_key);
        }
        Some(room_name)
    }

    /// Dispatches one client command on the leader. `client_key`
    /// identifies the calling session; `has_identity` reflects whether
    /// `set_username` has already been accepted for this session (the
    /// dispatcher only reaches here once the session is READY, so this
    /// only matters for re-issued `set_username`).
    pub fn apply_command(
        &mut self,
        client_key: &str,
        username: Option<&str>,
        cmd: ClientCommand,
    ) -> Applied {
        match cmd {
            ClientCommand::SetUsername { username: new_name } => {
                if username.is_some() {
                    return Applied::reply_only(ServerFrame::error(
                        "Identity is already set for this session.",
                    ));
                }
                let identity = Identity {
                    username: new_name,
                };
                self.identities
                    .insert(client_key.to_string(), identity.clone());
                Applied::with_replication(
                    ServerFrame::Ack {
                        command: "set_username".to_string(),
                    },
                    ReplicatedAction::SetIdentity {
                        client_key: client_key.to_string(),
                        identity,
                    },
                )
            }

            ClientCommand::CreateRoom { room_name } => {
                if room_name.trim().is_empty() {
                    return Applied::reply_only(ServerFrame::error("Room name is required."));
                }
                if self.rooms.contains_key(&room_name) {
                    return Applied::reply_only(ServerFrame::error(format!(
                        "Room {} already exists.",
                        room_name
                    )));
                }
                self.leave_current_room(client_key);
                let mut room = Room::default();
                room.members.insert(client_key.to_string());
                self.rooms.insert(room_name.clone(), room);
                self.client_to_room
                    .insert(client_key.to_string(), room_name.clone());
                Applied::with_replication(
                    ServerFrame::RoomJoined {
                        room_name: room_name.clone(),
                        message: format!("Created and joined room {}.", room_name),
                    },
                    ReplicatedAction::CreateRoom {
                        room_name,
                        client_key: client_key.to_string(),
                    },
                )
            }

            ClientCommand::JoinRoom { room_name } => {
                if room_name.trim().is_empty() {
                    return Applied::reply_only(ServerFrame::error("Room name is required."));
                }
                if !self.rooms.contains_key(&room_name) {
                    return Applied::reply_only(ServerFrame::error(format!(
                        "Room {} does not exist.",
                        room_name
                    )));
                }
                self.leave_current_room(client_key);
                self.rooms
                    .get_mut(&room_name)
                    .unwrap()
                    .members
                    .insert(client_key.to_string());
                self.client_to_room
                    .insert(client_key.to_string(), room_name.clone());
                Applied::with_replication(
                    ServerFrame::RoomJoined {
                        room_name: room_name.clone(),
                        message: format!("Joined room {}.", room_name),
                    },
                    ReplicatedAction::JoinRoom {
                        room_name,
                        client_key: client_key.to_string(),
                    },
                )
            }

            ClientCommand::ListRooms => Applied::reply_only(ServerFrame::RoomList(self.room_names())),

            ClientCommand::LeaveRoom => {
                let left = self.leave_current_room(client_key);
                match left {
                    Some(room_name) => Applied::with_replication(
                        ServerFrame::RoomLeft {
                            message: format!("Left room {}.", room_name),
                        },
                        ReplicatedAction::LeaveRoom {
                            room_name,
                            client_key: client_key.to_string(),
                        },
                    ),
                    None => Applied::reply_only(ServerFrame::RoomLeft {
                        message: "You were not in a room.".to_string(),
                    }),
                }
            }

            ClientCommand::Chat { message: _ } => {
                // The caller (session handler) is responsible for the
                // fan-out to room members; here we only validate the
                // precondition. This arm is unreachable from the normal
                // dispatch path, which intercepts `Chat` before calling
                // `apply_command` so it can read `members_of` under the
                // same lock; kept for completeness of the match.
                if self.room_of(client_key).is_none() {
                    Applied::reply_only(ServerFrame::error("You are not in a room."))
                } else {
                    Applied::reply_only(ServerFrame::info("chat handled by caller"))
                }
            }

            ClientCommand::WhereAmI => {
                let where_text = self
                    .room_of(client_key)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "not in a room".to_string());
                Applied::reply_only(ServerFrame::info(where_text))
            }

            ClientCommand::Ping => Applied::reply_only(ServerFrame::Pong {}),
        }
    }

    /// Removes all trace of a disconnected session (spec §4.5 teardown).
    /// Returns the room the client was in, if any, so the caller can
    /// broadcast the `leave_room` replication event.
    pub fn teardown_session(&mut self, client_key: &str) -> Option<String> {
        self.identities.remove(client_key);
        self.leave_current_room(client_key)
    }

    /// Applies a replicated action received over UDP on a follower.
    /// Idempotent and tolerant of out-of-order delivery (spec §4.4).
    pub fn apply_replicated(&mut self, action: ReplicatedAction) {
        match action {
            ReplicatedAction::CreateRoom {
                room_name,
                client_key,
            } => {
                self.leave_current_room(&client_key);
                let room = self.rooms.entry(room_name.clone()).or_default();
                room.members.insert(client_key.clone());
                self.client_to_room.insert(client_key, room_name);
            }
            ReplicatedAction::JoinRoom {
                room_name,
                client_key,
            } => {
                // "add to existing, else create" per spec §4.4: the
                // corresponding create_room event may not have arrived yet.
                self.leave_current_room(&client_key);
                let room = self.rooms.entry(room_name.clone()).or_default();
                room.members.insert(client_key.clone());
                self.client_to_room.insert(client_key, room_name);
            }
            ReplicatedAction::LeaveRoom {
                room_name,
                client_key,
            } => {
                if let Some(room) = self.rooms.get_mut(&room_name) {
                    room.members.remove(&client_key);
                }
                if self.client_to_room.get(&client_key) == Some(&room_name) {
                    self.client_to_room.remove(&client_key);
                } else {
                    pf_debug!(
                        "leave_room replication for {} names stale room {}",
                        client_key,
                        room_name
                    );
                }
            }
            ReplicatedAction::SetIdentity {
                client_key,
                identity,
            } => {
                self.identities.insert(client_key, identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_room_requires_nonempty_name() {
        let mut state = ChatState::new();
        let applied = state.apply_command("k1", None, ClientCommand::CreateRoom { room_name: "  ".into() });
        assert!(matches!(applied.reply, ServerFrame::Error(_)));
        assert!(applied.replicate.is_none());
    }

    #[test]
    fn create_existing_room_errors() {
        let mut state = ChatState::new();
        state.apply_command("k1", None, ClientCommand::CreateRoom { room_name: "lobby".into() });
        let applied = state.apply_command("k2", None, ClientCommand::CreateRoom { room_name: "lobby".into() });
        match applied.reply {
            ServerFrame::Error(msg) => assert!(msg.contains("already exists")),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn join_nonexistent_room_errors() {
        let mut state = ChatState::new();
        let applied = state.apply_command("k1", None, ClientCommand::JoinRoom { room_name: "ghost".into() });
        match applied.reply {
            ServerFrame::Error(msg) => assert!(msg.contains("does not exist")),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn join_room_while_in_another_is_implicit_leave_then_join() {
        let mut state = ChatState::new();
        state.apply_command("k1", None, ClientCommand::CreateRoom { room_name: "a".into() });
        state.apply_command("k1", None, ClientCommand::CreateRoom { room_name: "b".into() });
        assert_eq!(state.room_of("k1"), Some("b"));
        assert!(state.members_of("a").is_empty());
        assert_eq!(state.members_of("b"), vec!["k1".to_string()]);
    }

    #[test]
    fn chat_from_client_not_in_room_errors() {
        let mut state = ChatState::new();
        let applied = state.apply_command("k1", None, ClientCommand::Chat { message: "hi".into() });
        assert!(matches!(applied.reply, ServerFrame::Error(_)));
    }

    #[test]
    fn whereami_reports_not_in_a_room_by_default() {
        let mut state = ChatState::new();
        let applied = state.apply_command("k1", None, ClientCommand::WhereAmI);
        match applied.reply {
            ServerFrame::Info(msg) => assert_eq!(msg, "not in a room"),
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn leave_room_without_membership_still_replies() {
        let mut state = ChatState::new();
        let applied = state.apply_command("k1", None, ClientCommand::LeaveRoom);
        assert!(applied.replicate.is_none());
        match applied.reply {
            ServerFrame::RoomLeft { message } => assert!(message.contains("not")),
            _ => panic!("expected room_left"),
        }
    }

    #[test]
    fn follower_join_room_tolerates_missing_create() {
        let mut state = ChatState::new();
        state.apply_replicated(ReplicatedAction::JoinRoom {
            room_name: "lobby".into(),
            client_key: "k1".into(),
        });
        assert_eq!(state.members_of("lobby"), vec!["k1".to_string()]);
    }

    #[test]
    fn follower_apply_is_idempotent_under_duplicate_delivery() {
        let mut state = ChatState::new();
        let action = ReplicatedAction::CreateRoom {
            room_name: "lobby".into(),
            client_key: "k1".into(),
        };
        state.apply_replicated(action.clone());
        state.apply_replicated(action);
        assert_eq!(state.members_of("lobby"), vec!["k1".to_string()]);
        assert_eq!(state.room_names(), vec!["lobby".to_string()]);
    }

    #[test]
    fn teardown_clears_identity_and_room_and_returns_room() {
        let mut state = ChatState::new();
        state.apply_command(
            "k1",
            None,
            ClientCommand::SetUsername {
                username: "alice".into(),
            },
        );
        state.apply_command("k1", None, ClientCommand::CreateRoom { room_name: "lobby".into() });
        let left = state.teardown_session("k1");
        assert_eq!(left, Some("lobby".to_string()));
        assert!(state.identity_of("k1").is_none());
        assert!(state.members_of("lobby").is_empty());
    }

    #[test]
    fn set_username_twice_errors() {
        let mut state = ChatState::new();
        state.apply_command(
            "k1",
            None,
            ClientCommand::SetUsername {
                username: "alice".into(),
            },
        );
        let applied = state.apply_command(
            "k1",
            Some("alice"),
            ClientCommand::SetUsername {
                username: "bob".into(),
            },
        );
        assert!(matches!(applied.reply, ServerFrame::Error(_)));
    }
}
