//! In-memory conversation relay
//!
//! Reproduces the chat backend's room fan-out so conversations can run
//! in-process:
//!
//! - `webrtc_offer`, `webrtc_answer` and `webrtc_ice_candidate` frames go to
//!   every other member of the room, never back to the sender
//! - every other frame (chat updates, `incoming_call`, `call_end`) goes to
//!   all members, sender included
//! - a frame that is not a JSON object earns the sender an
//!   `{"error": "..."}` frame and goes nowhere else

use crate::signaling::{is_peer_signal, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Room has no members
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Sender is not (or no longer) in the room
    #[error("Member {member} is not in room {room}")]
    NotAMember {
        /// Room name
        room: String,
        /// Member id
        member: u64,
    },
}

/// Group name of a chat room
#[must_use]
pub fn chat_room(room: &str) -> String {
    format!("chat_{room}")
}

/// Group name of a direct-message group
#[must_use]
pub fn dm_room(group_id: &str) -> String {
    format!("dm_{group_id}")
}

/// Group name of a workspace channel
#[must_use]
pub fn channel_room(channel_id: &str) -> String {
    format!("channel_{channel_id}")
}

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Room fan-out shared by every [`RelayChannel`]
#[derive(Default)]
pub struct SignalingRelay {
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    next_member: AtomicU64,
}

impl SignalingRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join a room; the returned channel leaves it when dropped
    pub fn join(self: &Arc<Self>, room: impl Into<String>) -> RelayChannel {
        let room = room.into();
        let id = self.next_member.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .lock()
            .entry(room.clone())
            .or_default()
            .push(Member { id, tx });
        tracing::debug!(room = %room, member = id, "Joined room");

        RelayChannel {
            relay: Arc::clone(self),
            room,
            id,
            rx: tokio::sync::Mutex::new(rx),
            open: AtomicBool::new(true),
        }
    }

    /// Number of members in a room
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.lock().get(room).map_or(0, Vec::len)
    }

    /// Disconnect every member of a room; returns how many were removed
    pub fn close_room(&self, room: &str) -> usize {
        let removed = self.rooms.lock().remove(room).map_or(0, |members| members.len());
        if removed > 0 {
            tracing::info!(room = %room, removed, "Room closed");
        }
        removed
    }

    /// Fan out one frame from `sender`; returns how many members received it
    ///
    /// # Errors
    ///
    /// Returns error if the room does not exist or `sender` is not in it
    pub fn publish(&self, room: &str, sender: u64, text: &str) -> Result<usize, RelayError> {
        let rooms = self.rooms.lock();
        let members = rooms
            .get(room)
            .ok_or_else(|| RelayError::RoomNotFound(room.to_string()))?;
        let origin = members
            .iter()
            .find(|m| m.id == sender)
            .ok_or_else(|| RelayError::NotAMember {
                room: room.to_string(),
                member: sender,
            })?;

        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => value,
            Ok(_) => return Ok(Self::reject(origin, "frame is not a JSON object")),
            Err(e) => return Ok(Self::reject(origin, &e.to_string())),
        };
        let frame_type = value.get("type").and_then(serde_json::Value::as_str);
        let skip_sender = frame_type.is_some_and(is_peer_signal);
        let frame = value.to_string();

        let mut delivered = 0;
        for member in members {
            if skip_sender && member.id == sender {
                continue;
            }
            if member.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(room = %room, frame_type = ?frame_type, delivered, "Frame relayed");
        Ok(delivered)
    }

    fn reject(origin: &Member, error: &str) -> usize {
        tracing::warn!(member = origin.id, error = %error, "Rejected malformed frame");
        let frame = serde_json::json!({ "error": error }).to_string();
        let _ = origin.tx.send(frame);
        0
    }

    fn leave(&self, room: &str, id: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|m| m.id != id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        tracing::debug!(room = %room, member = id, "Left room");
    }
}

/// One member's connection to a relay room
pub struct RelayChannel {
    relay: Arc<SignalingRelay>,
    room: String,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    open: AtomicBool,
}

impl RelayChannel {
    /// Room name
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Member id within the relay
    #[must_use]
    pub fn member_id(&self) -> u64 {
        self.id
    }

    /// Leave the room; pending inbound frames can still be read
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.relay.leave(&self.room, self.id);
        }
    }
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelClosed);
        }
        self.relay
            .publish(&self.room, self.id, &frame)
            .map(|_| ())
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    async fn receive_text(&self) -> Option<String> {
        let text = self.rx.lock().await.recv().await;
        if text.is_none() {
            self.open.store(false, Ordering::SeqCst);
        }
        text
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close();
    }
}
