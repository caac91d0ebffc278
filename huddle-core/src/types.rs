//! Call types and data structures

use crate::media::{MediaRequest, TrackKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the call this client is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Sent the offer
    Caller,
    /// Answered an offer
    Callee,
}

/// Requested media for a call
///
/// Audio is always captured; `Video` adds a camera track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Microphone only
    #[default]
    Audio,
    /// Microphone and camera
    Video,
}

impl CallMode {
    /// Whether this mode captures a camera track
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Device request matching this mode
    #[must_use]
    pub fn media_request(self) -> MediaRequest {
        MediaRequest {
            audio: true,
            video: self.has_video(),
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

impl std::str::FromStr for CallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call mode: {other}")),
        }
    }
}

/// Call status
///
/// ```text
///   caller:  Idle ─▶ Calling ───────▶ Active ─▶ Ended ─▶ Idle
///   callee:  Idle ─▶ RingingRemote ─▶ Active ─▶ Ended ─▶ Idle
///                                     │    ▲
///                      disconnected   ▼    │ connected
///                                   Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// No call in progress
    Idle,
    /// Outgoing call: acquiring media, offering, or waiting for the answer
    Calling,
    /// Incoming call accepted: acquiring media and answering
    RingingRemote,
    /// Media path lost; waiting for the peer connection to recover
    Connecting,
    /// Call is active
    Active,
    /// Teardown in progress
    Ended,
}

impl CallStatus {
    /// Check if no call is in progress
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if a call is live, as opposed to idle or winding down
    #[must_use]
    pub fn has_live_call(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }

    /// Check if media is flowing (or recovering)
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::Active | Self::Connecting)
    }

    /// Check if the session is still negotiating
    #[must_use]
    pub fn is_setting_up(self) -> bool {
        matches!(self, Self::Calling | Self::RingingRemote)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::RingingRemote => "ringing-remote",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote peer sent `call_end`
    RemoteHangup,
    /// Signaling channel dropped
    ChannelClosed,
    /// Peer connection reported failure or stayed disconnected
    ConnectionFailed,
    /// Outgoing call was not answered in time
    RingTimeout,
    /// Setup could not complete
    SetupFailed(String),
}

impl EndReason {
    /// Whether the remote side should be told with a `call_end`
    #[must_use]
    pub fn notifies_remote(&self) -> bool {
        matches!(
            self,
            Self::LocalHangup | Self::ConnectionFailed | Self::RingTimeout
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::RemoteHangup => f.write_str("remote hangup"),
            Self::ChannelClosed => f.write_str("signaling channel closed"),
            Self::ConnectionFailed => f.write_str("connection failed"),
            Self::RingTimeout => f.write_str("ring timeout"),
            Self::SetupFailed(reason) => write!(f, "setup failed: {reason}"),
        }
    }
}

/// Call event for observers (UI layer, logs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Status transition
    StatusChanged {
        /// Call the transition belongs to
        call_id: Option<CallId>,
        /// Previous status
        old: CallStatus,
        /// New status
        new: CallStatus,
    },
    /// Device permission or capability error while starting/accepting
    MediaAccessFailed {
        /// Requested mode
        mode: CallMode,
        /// Error description
        error: String,
    },
    /// A locally gathered ICE candidate was sent to the remote peer
    LocalCandidateSent {
        /// Call identifier
        call_id: CallId,
    },
    /// Remote track added to the composite remote stream
    RemoteTrackAdded {
        /// Call identifier
        call_id: CallId,
        /// Track identifier
        track_id: String,
        /// Track kind
        kind: TrackKind,
    },
    /// Local mute/camera state changed
    MediaToggled {
        /// Call identifier
        call_id: CallId,
        /// Microphone enabled
        audio_enabled: bool,
        /// Camera enabled
        video_enabled: bool,
    },
    /// Call torn down
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
        /// Connected duration in milliseconds, if the call became active
        duration_ms: Option<i64>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_mode_media_request() {
        let audio = CallMode::Audio.media_request();
        assert!(audio.audio);
        assert!(!audio.video);

        let video = CallMode::Video.media_request();
        assert!(video.audio);
        assert!(video.video);
    }

    #[test]
    fn test_call_mode_parse() {
        assert_eq!("Video".parse::<CallMode>().unwrap(), CallMode::Video);
        assert_eq!("audio".parse::<CallMode>().unwrap(), CallMode::Audio);
        assert!("screen".parse::<CallMode>().is_err());
    }

    #[test]
    fn test_call_status_display() {
        assert_eq!(CallStatus::RingingRemote.to_string(), "ringing-remote");
        let json = serde_json::to_string(&CallStatus::RingingRemote).unwrap();
        assert_eq!(json, "\"ringing-remote\"");
    }

    #[test]
    fn test_status_groups() {
        assert!(CallStatus::Idle.is_idle());
        assert!(CallStatus::Calling.is_setting_up());
        assert!(CallStatus::RingingRemote.is_setting_up());
        assert!(CallStatus::Connecting.is_established());
        assert!(!CallStatus::Ended.is_established());
        assert!(CallStatus::Connecting.has_live_call());
        assert!(!CallStatus::Ended.has_live_call());
        assert!(!CallStatus::Ended.is_idle());
    }

    #[test]
    fn test_end_reason_notifies_remote() {
        assert!(EndReason::LocalHangup.notifies_remote());
        assert!(EndReason::RingTimeout.notifies_remote());
        assert!(!EndReason::RemoteHangup.notifies_remote());
        assert!(!EndReason::ChannelClosed.notifies_remote());
        assert!(!EndReason::SetupFailed("x".into()).notifies_remote());
    }
}
