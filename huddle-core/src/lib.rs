//! Huddle - call signaling and peer-connection lifecycle for a team-chat client
//!
//! Calls are set up over the same realtime channel a conversation (channel or
//! direct message) uses for chat updates. This library provides:
//!
//! - **Signaling codec**: the JSON frames exchanged on the conversation channel
//! - **Call session**: one state machine per conversation owning local media,
//!   the peer connection and the remote stream
//! - **Incoming call notifier**: a single pending offer awaiting accept/decline
//! - **Call service**: dispatch of inbound frames, peer callbacks and deadlines
//! - **Transports**: an in-memory room relay and a WebSocket client
//! - **Peer connections**: a `webrtc`-crate backend behind a small trait seam
//!
//! # Examples
//!
//! ```rust,no_run
//! use huddle_core::{CallConfig, CallMode, CallService, SignalingHandler, SignalingRelay, dm_room};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = SignalingRelay::new();
//! let signaling = Arc::new(SignalingHandler::new(Arc::new(relay.join(dm_room("42")))));
//!
//! let service = Arc::new(
//!     CallService::builder(signaling)
//!         .with_config(CallConfig::new("alice"))
//!         .build()?,
//! );
//!
//! let runner = Arc::clone(&service);
//! tokio::spawn(async move { runner.run().await });
//!
//! let call_id = service.start_call(CallMode::Video).await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// Signaling protocol and handlers
pub mod signaling;

/// Local capture and remote streams
pub mod media;

/// Peer connection abstraction layer
pub mod peer;

/// Peer connections backed by the webrtc crate
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

/// Call session state machine
pub mod call;

/// Incoming call notification
pub mod notifier;

/// Per-conversation call service
pub mod service;

/// In-memory conversation relay
pub mod relay;

/// WebSocket signaling channel
#[cfg(feature = "websocket")]
pub mod ws;

// Re-export main types at crate root
pub use call::{CallConfig, CallError, CallSession, CallSnapshot, CandidateDisposition};
pub use media::{
    LocalMedia, LocalTrack, MediaDevices, MediaError, MediaRequest, RemoteStream, RemoteTrack,
    TrackKind, VirtualMediaDevices,
};
pub use notifier::{IncomingCallNotifier, IncomingCallOffer, NoticeOutcome};
pub use peer::{
    ConnectionState, IceServer, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent, PeerEventSink, TaggedPeerEvent,
};
pub use relay::{channel_room, chat_room, dm_room, RelayChannel, RelayError, SignalingRelay};
pub use service::{
    CallService, CallServiceBuilder, ClearReason, ConversationEvent, ServiceError,
};
pub use signaling::{
    decode_frame, IceCandidate, InboundFrame, SdpKind, SessionDescription, SignalingChannel,
    SignalingError, SignalingHandler, SignalingMessage,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcPeer, WebRtcPeerFactory};
#[cfg(feature = "websocket")]
pub use ws::WsSignalingChannel;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError, CallSession};
    pub use crate::media::{MediaDevices, VirtualMediaDevices};
    pub use crate::peer::{PeerConnection, PeerConnectionFactory};
    pub use crate::relay::SignalingRelay;
    pub use crate::service::{CallService, ConversationEvent};
    pub use crate::signaling::{SignalingChannel, SignalingHandler, SignalingMessage};
    pub use crate::types::{CallEvent, CallId, CallMode, CallStatus, EndReason};
}
