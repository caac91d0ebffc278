//! Call signaling protocol
//!
//! Call setup shares the conversation's realtime channel with chat traffic.
//! Every frame is one JSON object whose `type` field discriminates it:
//!
//! | `type`                 | fields               |
//! |------------------------|----------------------|
//! | `webrtc_offer`         | `offer`, `callType`  |
//! | `webrtc_answer`        | `answer`             |
//! | `webrtc_ice_candidate` | `candidate`          |
//! | `call_end`             |                      |
//! | `incoming_call`        | `from`, `callType`   |
//!
//! Anything else on the channel belongs to the chat layer.

use crate::types::CallMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Frame types the backend relays to other room members only
pub const PEER_SIGNAL_TYPES: [&str; 3] = ["webrtc_offer", "webrtc_answer", "webrtc_ice_candidate"];

/// Frame types handled by the call subsystem
pub const CALL_SIGNAL_TYPES: [&str; 5] = [
    "webrtc_offer",
    "webrtc_answer",
    "webrtc_ice_candidate",
    "call_end",
    "incoming_call",
];

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel is closed
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Message could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Answer
    Answer,
    /// Rollback
    Rollback,
}

/// Session description in the browser's `{type, sdp}` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute (`candidate:...`); empty marks end of candidates
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate for the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Check if this is the end-of-candidates marker
    #[must_use]
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }

    /// Syntactic check of the candidate attribute
    ///
    /// Accepts `candidate:<foundation> <component> <transport> <priority>
    /// <address> <port> typ <type> ...` with or without the `a=` prefix.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found
    pub fn validate(&self) -> Result<(), String> {
        if self.is_end_of_candidates() {
            return Ok(());
        }
        let body = self
            .candidate
            .strip_prefix("a=")
            .unwrap_or(&self.candidate)
            .strip_prefix("candidate:")
            .ok_or_else(|| "missing `candidate:` prefix".to_string())?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(format!("expected at least 8 fields, got {}", fields.len()));
        }
        fields[1]
            .parse::<u16>()
            .map_err(|_| format!("invalid component: {}", fields[1]))?;
        fields[3]
            .parse::<u32>()
            .map_err(|_| format!("invalid priority: {}", fields[3]))?;
        fields[5]
            .parse::<u16>()
            .map_err(|_| format!("invalid port: {}", fields[5]))?;
        if fields[6] != "typ" {
            return Err(format!("expected `typ`, got {}", fields[6]));
        }
        Ok(())
    }
}

/// Call signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// SDP offer starting a call
    #[serde(rename = "webrtc_offer")]
    Offer {
        /// Caller's offer
        offer: SessionDescription,
        /// Requested media
        #[serde(rename = "callType")]
        call_type: CallMode,
        /// Caller's user name, when the sender includes it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// SDP answer accepting a call
    #[serde(rename = "webrtc_answer")]
    Answer {
        /// Callee's answer
        answer: SessionDescription,
    },

    /// Trickled ICE candidate
    #[serde(rename = "webrtc_ice_candidate")]
    IceCandidate {
        /// Candidate
        candidate: IceCandidate,
    },

    /// Hang up
    #[serde(rename = "call_end")]
    CallEnd,

    /// Ringing notice for the other members of the conversation
    ///
    /// `type` is taken by the frame tag, so the mode travels as `callType`.
    /// A notice without one rings as audio until the offer says otherwise.
    #[serde(rename = "incoming_call")]
    IncomingCall {
        /// Caller's user name
        from: String,
        /// Requested media
        #[serde(rename = "callType", default)]
        mode: CallMode,
    },
}

impl SignalingMessage {
    /// Wire `type` of this message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "webrtc_offer",
            Self::Answer { .. } => "webrtc_answer",
            Self::IceCandidate { .. } => "webrtc_ice_candidate",
            Self::CallEnd => "call_end",
            Self::IncomingCall { .. } => "incoming_call",
        }
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_frame(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }
}

/// Check whether a frame type is relayed to other room members only
#[must_use]
pub fn is_peer_signal(frame_type: &str) -> bool {
    PEER_SIGNAL_TYPES.contains(&frame_type)
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Call signaling
    Signaling(SignalingMessage),
    /// Call signaling type with a payload that did not decode
    MalformedSignaling {
        /// Wire `type`
        message_type: String,
        /// Decode error
        error: String,
    },
    /// `{"error": ...}` reported by the relay
    RelayError(String),
    /// Chat-layer traffic
    Chat(serde_json::Value),
}

/// Decode one text frame
///
/// # Errors
///
/// Returns error if the frame is not a JSON object
pub fn decode_frame(text: &str) -> Result<InboundFrame, SignalingError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SignalingError::InvalidFrame(e.to_string()))?;
    if !value.is_object() {
        return Err(SignalingError::InvalidFrame(
            "frame is not a JSON object".to_string(),
        ));
    }

    let frame_type = value.get("type").and_then(|t| t.as_str()).map(str::to_owned);
    match frame_type {
        Some(frame_type) if CALL_SIGNAL_TYPES.contains(&frame_type.as_str()) => {
            match serde_json::from_value::<SignalingMessage>(value) {
                Ok(message) => Ok(InboundFrame::Signaling(message)),
                Err(e) => Ok(InboundFrame::MalformedSignaling {
                    message_type: frame_type,
                    error: e.to_string(),
                }),
            }
        }
        None => match value.get("error") {
            Some(error) => Ok(InboundFrame::RelayError(
                error
                    .as_str()
                    .map_or_else(|| error.to_string(), str::to_owned),
            )),
            None => Ok(InboundFrame::Chat(value)),
        },
        Some(_) => Ok(InboundFrame::Chat(value)),
    }
}

/// Realtime channel of one conversation (channel or DM)
///
/// Owned by the chat layer. The call subsystem only sends text frames,
/// reads inbound frames, and checks whether the channel is still open;
/// reconnection is the owner's business.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, frame: String) -> Result<(), SignalingError>;

    /// Receive the next inbound text frame; `None` once the channel is closed
    async fn receive_text(&self) -> Option<String>;

    /// Check if frames can currently be sent
    fn is_open(&self) -> bool;
}

/// Typed signaling on top of a [`SignalingChannel`]
pub struct SignalingHandler<C: SignalingChannel> {
    channel: Arc<C>,
}

impl<C: SignalingChannel> SignalingHandler<C> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` if the channel is not open, or the channel's
    /// send error
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if !self.channel.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        let frame = message.to_frame()?;
        tracing::debug!("Sending signaling message");
        self.channel.send_text(frame).await
    }

    /// Send a message whose loss is tolerated
    ///
    /// Returns whether the message was handed to the channel.
    pub async fn send_best_effort(&self, message: &SignalingMessage) -> bool {
        match self.send_message(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    message_type = message.message_type(),
                    error = %e,
                    "Dropped best-effort signaling message"
                );
                false
            }
        }
    }

    /// Receive the next decodable frame; `None` once the channel is closed
    ///
    /// Frames that are not JSON objects are logged and skipped.
    pub async fn receive_frame(&self) -> Option<InboundFrame> {
        loop {
            let text = self.channel.receive_text().await?;
            match decode_frame(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable frame");
                }
            }
        }
    }

    /// Check if the channel is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    // Mock channel for testing
    struct MockChannel {
        sent: Mutex<Vec<String>>,
        inbound: Mutex<VecDeque<String>>,
        open: AtomicBool,
    }

    impl MockChannel {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
                open: AtomicBool::new(true),
            }
        }

        fn push_inbound(&self, frame: &str) {
            self.inbound.lock().unwrap().push_back(frame.to_string());
        }
    }

    #[async_trait]
    impl SignalingChannel for MockChannel {
        async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn receive_text(&self) -> Option<String> {
            self.inbound.lock().unwrap().pop_front()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    const HOST_CANDIDATE: &str = "candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host";

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            offer: SessionDescription::offer("v=0\r\n"),
            call_type: CallMode::Video,
            from: None,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "webrtc_offer",
                "offer": {"type": "offer", "sdp": "v=0\r\n"},
                "callType": "video",
            })
        );
    }

    #[test]
    fn test_call_end_wire_shape() {
        assert_eq!(
            SignalingMessage::CallEnd.to_frame().unwrap(),
            r#"{"type":"call_end"}"#
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let text = r#"{"type":"webrtc_ice_candidate","candidate":{"candidate":"candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#;
        let candidate = match decode_frame(text).unwrap() {
            InboundFrame::Signaling(SignalingMessage::IceCandidate { candidate }) => candidate,
            other => unreachable!("Expected IceCandidate, got: {:?}", other),
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
        assert!(candidate.validate().is_ok());
    }

    #[test]
    fn test_incoming_call_decodes() {
        let frame = decode_frame(r#"{"type":"incoming_call","from":"alice","callType":"audio"}"#)
            .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Signaling(SignalingMessage::IncomingCall {
                from: "alice".to_string(),
                mode: CallMode::Audio,
            })
        );
    }

    #[test]
    fn test_chat_frames_pass_through() {
        let frame = decode_frame(r#"{"message":"hello","sender":"bob"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Chat(_)));

        let frame = decode_frame(r#"{"type":"chat_message","message":"hi"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Chat(_)));
    }

    #[test]
    fn test_relay_error_frame() {
        let frame = decode_frame(r#"{"error":"Expecting value"}"#).unwrap();
        assert_eq!(frame, InboundFrame::RelayError("Expecting value".to_string()));
    }

    #[test]
    fn test_malformed_signaling_payload() {
        let frame = decode_frame(r#"{"type":"webrtc_ice_candidate","candidate":42}"#).unwrap();
        assert!(matches!(
            frame,
            InboundFrame::MalformedSignaling { ref message_type, .. } if message_type == "webrtc_ice_candidate"
        ));
    }

    #[test]
    fn test_non_object_frames_rejected() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame("[1,2,3]").is_err());
    }

    #[test]
    fn test_candidate_validation() {
        assert!(IceCandidate::new(HOST_CANDIDATE).validate().is_ok());
        assert!(IceCandidate::new(format!("a={HOST_CANDIDATE}"))
            .validate()
            .is_ok());
        assert!(IceCandidate::new("").validate().is_ok());
        assert!(IceCandidate::new("garbage-candidate-data").validate().is_err());
        assert!(IceCandidate::new("candidate:1 1 UDP")
            .validate()
            .is_err());
        assert!(
            IceCandidate::new("candidate:1 1 UDP 2122260223 192.168.1.1 notaport typ host")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_peer_signal_classification() {
        assert!(is_peer_signal("webrtc_offer"));
        assert!(is_peer_signal("webrtc_ice_candidate"));
        assert!(!is_peer_signal("call_end"));
        assert!(!is_peer_signal("incoming_call"));
    }

    #[tokio::test]
    async fn test_signaling_handler_send_message() {
        let channel = Arc::new(MockChannel::new());
        let handler = SignalingHandler::new(channel.clone());

        handler
            .send_message(&SignalingMessage::CallEnd)
            .await
            .unwrap();

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![r#"{"type":"call_end"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_signaling_handler_closed_channel() {
        let channel = Arc::new(MockChannel::new());
        channel.open.store(false, Ordering::SeqCst);
        let handler = SignalingHandler::new(channel.clone());

        let result = handler.send_message(&SignalingMessage::CallEnd).await;
        assert!(matches!(result, Err(SignalingError::ChannelClosed)));
        assert!(!handler.send_best_effort(&SignalingMessage::CallEnd).await);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signaling_handler_skips_garbage() {
        let channel = Arc::new(MockChannel::new());
        channel.push_inbound("{{{");
        channel.push_inbound(r#"{"type":"call_end"}"#);
        let handler = SignalingHandler::new(channel);

        let frame = handler.receive_frame().await;
        assert_eq!(
            frame,
            Some(InboundFrame::Signaling(SignalingMessage::CallEnd))
        );
        assert_eq!(handler.receive_frame().await, None);
    }
}
