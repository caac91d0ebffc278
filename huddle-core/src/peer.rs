//! Peer connection abstraction layer
//!
//! The call session drives the media transport only through the
//! [`PeerConnection`] and [`PeerConnectionFactory`] traits. The default
//! implementation (feature `webrtc-backend`) wraps the `webrtc` crate; tests
//! substitute scripted connections.

use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Public STUN server used when no ICE servers are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Offer/answer negotiation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Session description rejected
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Remote ICE candidate rejected
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Peer connection state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, nothing gathered
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:` / `turn:` URLs
    pub urls: Vec<String>,
    /// TURN user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

/// Callback event from a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate, to be trickled to the remote peer
    LocalCandidate(IceCandidate),
    /// Track received from the remote peer
    RemoteTrack(RemoteTrack),
    /// Connection state change
    StateChanged(ConnectionState),
}

/// Peer event tagged with the session epoch of the connection that raised it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedPeerEvent {
    /// Session epoch the connection was created in
    pub epoch: u64,
    /// The event
    pub event: PeerEvent,
}

/// Sender handed to a connection for its callbacks
///
/// Events are tagged so that callbacks from a connection that has since been
/// torn down can be told apart from the live one.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl PeerEventSink {
    /// Create a sink for connections of one session epoch
    #[must_use]
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedPeerEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Epoch this sink tags events with
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event; returns `false` once the session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(TaggedPeerEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Media transport session between two call participants
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Register a local track for sending
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection; callbacks are delivered through `events`
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
