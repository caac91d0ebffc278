//! Local capture and remote stream management
//!
//! Local tracks are handed out by a [`MediaDevices`] implementation and owned
//! by the call session through [`LocalMedia`], which stops every track exactly
//! once: explicitly through [`LocalMedia::release`], or on drop.
//!
//! Remote tracks arrive one event at a time and are collected into a single
//! [`RemoteStream`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform denied device access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device present but unusable
    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Device request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRequest {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
}

struct TrackState {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to a captured local track
///
/// Clones share state: disabling or stopping through one handle is visible
/// through all of them.
#[derive(Clone)]
pub struct LocalTrack {
    state: Arc<TrackState>,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TrackState {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.state.kind
    }

    /// Device label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Whether samples are forwarded (false while muted / camera off)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable sample forwarding without renegotiation
    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the device is still captured
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Stop capture; returns `true` if this call stopped it
    pub fn stop(&self) -> bool {
        self.state.live.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.state.id)
            .field("kind", &self.state.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Captured local tracks owned by one call session
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Wrap acquired tracks
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Check if a camera track was captured
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    /// Enable or disable every track of one kind; returns how many changed
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks_of(kind) {
            if track.is_enabled() != enabled {
                track.set_enabled(enabled);
                changed += 1;
            }
        }
        changed
    }

    /// Stop and release every track; returns how many were stopped
    pub fn release(mut self) -> usize {
        Self::stop_all(std::mem::take(&mut self.tracks))
    }

    fn stop_all(tracks: Vec<LocalTrack>) -> usize {
        tracks.iter().filter(|t| t.stop()).count()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if self.tracks.is_empty() {
            return;
        }
        let stopped = Self::stop_all(std::mem::take(&mut self.tracks));
        if stopped > 0 {
            tracing::debug!(stopped, "Local media dropped without release; tracks stopped");
        }
    }
}

/// Source of local capture
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire tracks for the request
    ///
    /// Audio is requested for every call; video only for video calls.
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMedia, MediaError>;
}

/// In-process device set
///
/// Produces track handles without touching hardware; permission, camera
/// presence and acquisition latency are configurable. Capture pipelines that
/// feed samples attach to the handed-out [`LocalTrack`]s.
pub struct VirtualMediaDevices {
    permission_granted: AtomicBool,
    has_camera: bool,
    acquire_delay: Option<Duration>,
    issued: Mutex<Vec<LocalTrack>>,
}

impl VirtualMediaDevices {
    /// Microphone and camera, permission granted
    #[must_use]
    pub fn new() -> Self {
        Self {
            permission_granted: AtomicBool::new(true),
            has_camera: true,
            acquire_delay: None,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Device set with no camera
    #[must_use]
    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    /// Delay every acquisition (simulates a permission prompt)
    #[must_use]
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    /// Grant or revoke permission
    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    /// Handed-out tracks, minus those already stopped when the next
    /// acquisition came in
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.issued.lock().clone()
    }

    /// Number of handed-out tracks that are still capturing
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

impl Default for VirtualMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for VirtualMediaDevices {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMedia, MediaError> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "capture permission not granted".to_string(),
            ));
        }
        if request.video && !self.has_camera {
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }

        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, "Virtual Microphone"));
        }
        if request.video {
            tracks.push(LocalTrack::new(TrackKind::Video, "Virtual Camera"));
        }
        {
            let mut issued = self.issued.lock();
            issued.retain(LocalTrack::is_live);
            issued.extend(tracks.iter().cloned());
        }

        tracing::debug!(tracks = tracks.len(), "Local media acquired");
        Ok(LocalMedia::new(tracks))
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

impl RemoteTrack {
    /// Create a remote track descriptor
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Composite stream of every remote track of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Create an empty stream
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: Vec::new(),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track; returns `false` if a track with the same id is present
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Tracks in arrival order
    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// Check if the stream carries video
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

impl Default for RemoteStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let devices = VirtualMediaDevices::new();
        let media = devices
            .acquire(MediaRequest {
                audio: true,
                video: false,
            })
            .await
            .unwrap();

        assert_eq!(media.tracks().len(), 1);
        assert!(!media.has_video());
        assert_eq!(devices.live_track_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_denied() {
        let devices = VirtualMediaDevices::new();
        devices.set_permission(false);
        let result = devices
            .acquire(MediaRequest {
                audio: true,
                video: true,
            })
            .await;

        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert!(devices.issued_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_tracks_are_pruned_on_acquire() {
        let devices = VirtualMediaDevices::new();
        let audio_only = MediaRequest {
            audio: true,
            video: false,
        };
        for _ in 0..5 {
            let media = devices.acquire(audio_only).await.unwrap();
            assert_eq!(media.release(), 1);
        }
        let _live = devices.acquire(audio_only).await.unwrap();

        assert_eq!(devices.issued_tracks().len(), 1);
        assert_eq!(devices.live_track_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_video_without_camera() {
        let devices = VirtualMediaDevices::new().without_camera();
        let result = devices
            .acquire(MediaRequest {
                audio: true,
                video: true,
            })
            .await;
        assert!(matches!(result, Err(MediaError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_release_stops_every_track_once() {
        let devices = VirtualMediaDevices::new();
        let media = devices
            .acquire(MediaRequest {
                audio: true,
                video: true,
            })
            .await
            .unwrap();
        let handles = media.tracks().to_vec();

        assert_eq!(media.release(), 2);
        assert!(handles.iter().all(|t| !t.is_live()));
        assert_eq!(devices.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_stops_tracks() {
        let devices = VirtualMediaDevices::new();
        {
            let _media = devices
                .acquire(MediaRequest {
                    audio: true,
                    video: true,
                })
                .await
                .unwrap();
            assert_eq!(devices.live_track_count(), 2);
        }
        assert_eq!(devices.live_track_count(), 0);
    }

    #[test]
    fn test_set_enabled_by_kind() {
        let media = LocalMedia::new(vec![
            LocalTrack::new(TrackKind::Audio, "mic"),
            LocalTrack::new(TrackKind::Video, "cam"),
        ]);

        assert_eq!(media.set_enabled(TrackKind::Video, false), 1);
        assert_eq!(media.set_enabled(TrackKind::Video, false), 0);
        assert!(media.tracks_of(TrackKind::Audio).all(LocalTrack::is_enabled));
        assert!(!media.tracks_of(TrackKind::Video).any(LocalTrack::is_enabled));
    }

    #[test]
    fn test_remote_stream_accumulates() {
        let mut stream = RemoteStream::new();
        assert!(stream.add_track(RemoteTrack::new("a1", TrackKind::Audio)));
        assert!(stream.add_track(RemoteTrack::new("v1", TrackKind::Video)));
        assert!(!stream.add_track(RemoteTrack::new("v1", TrackKind::Video)));

        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.has_video());
    }
}
