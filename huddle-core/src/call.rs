//! Call session state machine
//!
//! One [`CallSession`] exists per conversation. It owns the local media, the
//! peer connection and the remote stream of the single call that may be in
//! progress, and turns user actions, signaling messages and peer-connection
//! callbacks into status transitions.
//!
//! Setup operations await device and negotiation steps without holding any
//! lock. Each call claims a new session epoch; after every await the
//! operation checks that its epoch is still current, so an `end_call` issued
//! mid-setup wins and whatever the setup acquired afterwards is released.

use crate::media::{
    LocalMedia, LocalTrack, MediaDevices, MediaError, RemoteStream, RemoteTrack, TrackKind,
};
use crate::notifier::IncomingCallOffer;
use crate::peer::{
    ConnectionState, IceServer, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent, PeerEventSink, TaggedPeerEvent,
};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalingChannel, SignalingError, SignalingHandler,
    SignalingMessage,
};
use crate::types::{CallEvent, CallId, CallMode, CallRole, CallStatus, EndReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Call errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Device permission denied or device unavailable
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    /// Operation not valid in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(String),

    /// Signaling message could not be delivered
    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(#[from] SignalingError),

    /// Remote ICE candidate rejected
    #[error("Malformed ICE candidate: {0}")]
    MalformedCandidate(String),

    /// Peer connection backend failure
    #[error("Peer connection error: {0}")]
    PeerConnection(#[from] PeerError),

    /// Setup superseded by `end_call`
    #[error("Call setup cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Call session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Local user name, sent as `from` in call announcements
    pub local_user: String,
    /// ICE servers for new peer connections
    pub ice_servers: Vec<IceServer>,
    /// Give up on unanswered outgoing calls and stale incoming offers
    pub ring_timeout_secs: Option<u64>,
    /// How long a disconnected call may try to recover
    pub disconnect_grace_secs: u64,
    /// Remote candidates kept while no connection can take them
    pub max_buffered_candidates: usize,
    /// Send an `incoming_call` notice before each offer
    pub announce_calls: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_user: "anonymous".to_string(),
            ice_servers: PeerConfig::default().ice_servers,
            ring_timeout_secs: None,
            disconnect_grace_secs: 10,
            max_buffered_candidates: 64,
            announce_calls: true,
        }
    }
}

impl CallConfig {
    /// Default configuration for `local_user`
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Ring timeout, if enabled
    #[must_use]
    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    /// Disconnect grace period
    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    /// Peer connection configuration
    #[must_use]
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// What happened to a remote ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the peer connection
    Applied,
    /// Held until the remote description is applied
    Buffered,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    /// Current status
    pub status: CallStatus,
    /// Call in progress
    pub call_id: Option<CallId>,
    /// Local role
    pub role: Option<CallRole>,
    /// Requested media
    pub mode: Option<CallMode>,
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Camera enabled
    pub video_enabled: bool,
    /// Local tracks still capturing
    pub live_local_tracks: usize,
    /// Tracks of the composite remote stream
    pub remote_track_ids: Vec<String>,
    /// Remote candidates waiting for the connection
    pub buffered_candidates: usize,
    /// When the call was started or accepted
    pub started_at: Option<DateTime<Utc>>,
    /// When the call became active
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescription {
    Pending,
    Applying,
    Applied,
}

struct ActiveCall {
    id: CallId,
    role: CallRole,
    mode: CallMode,
    peer: Option<Arc<dyn PeerConnection>>,
    media: Option<LocalMedia>,
    remote: Option<RemoteStream>,
    early_tracks: Vec<RemoteTrack>,
    remote_description: RemoteDescription,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<Instant>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl ActiveCall {
    fn new(role: CallRole, mode: CallMode) -> Self {
        Self {
            id: CallId::new(),
            role,
            mode,
            peer: None,
            media: None,
            remote: None,
            early_tracks: Vec::new(),
            remote_description: RemoteDescription::Pending,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            connected_at: None,
            disconnected_at: None,
            audio_enabled: true,
            video_enabled: mode.has_video(),
        }
    }
}

struct SessionInner {
    status: CallStatus,
    epoch: u64,
    call: Option<ActiveCall>,
    pending_candidates: VecDeque<IceCandidate>,
}

/// Call session for one conversation
pub struct CallSession<C: SignalingChannel> {
    config: CallConfig,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<SignalingHandler<C>>,
    inner: Mutex<SessionInner>,
    event_sender: broadcast::Sender<CallEvent>,
    peer_event_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    peer_event_rx: Mutex<Option<mpsc::UnboundedReceiver<TaggedPeerEvent>>>,
}

impl<C: SignalingChannel> CallSession<C> {
    /// Create an idle session
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<SignalingHandler<C>>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        let (peer_event_tx, peer_event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            devices,
            factory,
            signaling,
            inner: Mutex::new(SessionInner {
                status: CallStatus::Idle,
                epoch: 0,
                call: None,
                pending_candidates: VecDeque::new(),
            }),
            event_sender,
            peer_event_tx,
            peer_event_rx: Mutex::new(Some(peer_event_rx)),
        }
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Signaling handler shared with the conversation
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingHandler<C>> {
        &self.signaling
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.inner.lock().status
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Take the receiver of peer-connection callbacks
    ///
    /// Whoever drives the session feeds these back through
    /// [`CallSession::handle_peer_event`]. Returns `None` after the first call.
    pub fn take_peer_events(&self) -> Option<mpsc::UnboundedReceiver<TaggedPeerEvent>> {
        self.peer_event_rx.lock().take()
    }

    /// Point-in-time view of the session
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        let inner = self.inner.lock();
        let buffered_candidates = inner.pending_candidates.len();
        match inner.call.as_ref() {
            Some(call) => CallSnapshot {
                status: inner.status,
                call_id: Some(call.id),
                role: Some(call.role),
                mode: Some(call.mode),
                audio_enabled: call.audio_enabled,
                video_enabled: call.video_enabled,
                live_local_tracks: call.media.as_ref().map_or(0, |m| {
                    m.tracks().iter().filter(|t| t.is_live()).count()
                }),
                remote_track_ids: call.remote.as_ref().map_or_else(Vec::new, |stream| {
                    stream.tracks().iter().map(|t| t.id.clone()).collect()
                }),
                buffered_candidates,
                started_at: Some(call.started_at),
                connected_at: call.connected_at,
            },
            None => CallSnapshot {
                status: inner.status,
                call_id: None,
                role: None,
                mode: None,
                audio_enabled: false,
                video_enabled: false,
                live_local_tracks: 0,
                remote_track_ids: Vec::new(),
                buffered_candidates,
                started_at: None,
                connected_at: None,
            },
        }
    }

    /// Composite remote stream of the current call
    #[must_use]
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner
            .lock()
            .call
            .as_ref()
            .and_then(|call| call.remote.clone())
    }

    /// Local tracks of the current call
    #[must_use]
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.inner
            .lock()
            .call
            .as_ref()
            .and_then(|call| call.media.as_ref())
            .map_or_else(Vec::new, |media| media.tracks().to_vec())
    }

    /// Drop remote candidates buffered for a call that will not happen
    pub fn discard_buffered_candidates(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.pending_candidates.len();
        inner.pending_candidates.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded buffered ICE candidates");
        }
        dropped
    }

    /// Start an outgoing call
    ///
    /// Acquires local media, creates the peer connection, and sends the
    /// offer (preceded by an `incoming_call` notice when announcements are
    /// enabled). The session stays `Calling` until the answer arrives.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if a call is already in progress
    /// - `MediaAccess` if capture is denied; nothing is sent
    /// - `PeerConnection` / `SignalingDelivery` if setup fails
    /// - `Cancelled` if the call was ended while setting up
    ///
    /// Every error except `InvalidState` leaves the session idle.
    #[tracing::instrument(skip(self), fields(mode = %mode))]
    pub async fn start_call(&self, mode: CallMode) -> Result<CallId, CallError> {
        let (call_id, epoch) = self.claim(CallRole::Caller, mode)?;
        tracing::info!(call_id = %call_id, "Starting outgoing call");

        let tracks = self.acquire_media(epoch, mode).await?;
        let peer = self.create_peer(epoch).await?;
        self.add_tracks(epoch, &peer, &tracks).await?;

        let offer = match Self::negotiate_offer(peer.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        if self.config.announce_calls {
            self.ensure_current(epoch)?;
            let notice = SignalingMessage::IncomingCall {
                from: self.config.local_user.clone(),
                mode,
            };
            if let Err(e) = self.signaling.send_message(&notice).await {
                return Err(self.abort(epoch, e.into()).await);
            }
        }

        self.ensure_current(epoch)?;
        let message = SignalingMessage::Offer {
            offer,
            call_type: mode,
            from: Some(self.config.local_user.clone()),
        };
        if let Err(e) = self.signaling.send_message(&message).await {
            return Err(self.abort(epoch, e.into()).await);
        }

        tracing::info!(call_id = %call_id, "Offer sent, waiting for answer");
        Ok(call_id)
    }

    /// Accept a pending incoming call
    ///
    /// Acquires media matching the offer's mode, applies the offer, replays
    /// buffered candidates, and sends the answer. The session is
    /// `RingingRemote` until the answer is sent, then `Active`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if a call is in progress or the offer has no payload
    /// - `MediaAccess` if capture is denied; nothing is sent
    /// - `PeerConnection` / `SignalingDelivery` if setup fails
    /// - `Cancelled` if the call was ended while setting up
    #[tracing::instrument(skip(self, incoming), fields(from = ?incoming.from, mode = %incoming.mode))]
    pub async fn accept_incoming(&self, incoming: IncomingCallOffer) -> Result<CallId, CallError> {
        let mode = incoming.mode;
        let Some(offer) = incoming.offer else {
            tracing::warn!("Cannot accept a call notice without an offer");
            return Err(CallError::InvalidState(
                "incoming call has no offer yet".to_string(),
            ));
        };
        let (call_id, epoch) = self.claim(CallRole::Callee, mode)?;
        tracing::info!(call_id = %call_id, "Accepting incoming call");

        let tracks = self.acquire_media(epoch, mode).await?;
        let peer = self.create_peer(epoch).await?;
        self.add_tracks(epoch, &peer, &tracks).await?;

        self.with_current(epoch, |call| {
            call.remote_description = RemoteDescription::Applying;
        })
        .ok_or(CallError::Cancelled)?;
        if let Err(e) = peer.set_remote_description(offer).await {
            return Err(self.abort(epoch, e.into()).await);
        }
        self.flush_candidates(epoch, peer.as_ref()).await?;

        let answer = match Self::negotiate_answer(peer.as_ref()).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        self.ensure_current(epoch)?;
        if let Err(e) = self
            .signaling
            .send_message(&SignalingMessage::Answer { answer })
            .await
        {
            return Err(self.abort(epoch, e.into()).await);
        }

        self.mark_active(epoch)?;
        Ok(call_id)
    }

    /// Apply the callee's answer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless an outgoing call is waiting for its
    /// answer; `PeerConnection` if the answer is rejected, in which case the
    /// call is ended
    #[tracing::instrument(skip(self, answer))]
    pub async fn on_remote_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        let (call_id, epoch, peer) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let status = inner.status;
            let waiting = inner.call.as_mut().filter(|call| {
                status == CallStatus::Calling
                    && call.remote_description == RemoteDescription::Pending
                    && call.peer.is_some()
            });
            let Some(call) = waiting else {
                tracing::warn!(status = %status, "Ignoring answer: no outgoing call is waiting for one");
                return Err(CallError::InvalidState(format!(
                    "no outgoing call awaiting an answer ({status})"
                )));
            };
            let Some(peer) = call.peer.clone() else {
                return Err(CallError::InvalidState(
                    "outgoing call has no peer connection".to_string(),
                ));
            };
            call.remote_description = RemoteDescription::Applying;
            (call.id, inner.epoch, peer)
        };

        if let Err(e) = peer.set_remote_description(answer).await {
            tracing::warn!(call_id = %call_id, error = %e, "Remote answer rejected");
            let _ = self.teardown(Some(epoch), EndReason::ConnectionFailed).await;
            return Err(e.into());
        }

        self.mark_active(epoch)?;
        self.flush_candidates(epoch, peer.as_ref()).await?;
        Ok(())
    }

    /// Handle a trickled remote ICE candidate
    ///
    /// Candidates that arrive before the remote description is applied
    /// (including before any connection exists) are buffered and replayed in
    /// receipt order. The status never changes here.
    ///
    /// # Errors
    ///
    /// Returns `MalformedCandidate` if the candidate is unparseable or the
    /// connection rejects it; the call continues either way
    pub async fn on_remote_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CallError> {
        if let Err(reason) = candidate.validate() {
            tracing::warn!(reason = %reason, "Ignoring malformed ICE candidate");
            return Err(CallError::MalformedCandidate(reason));
        }

        let peer = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let ready = inner
                .call
                .as_ref()
                .filter(|call| call.remote_description == RemoteDescription::Applied)
                .and_then(|call| call.peer.clone());
            match ready {
                Some(peer) => peer,
                None => {
                    let cap = self.config.max_buffered_candidates.max(1);
                    if inner.pending_candidates.len() >= cap {
                        inner.pending_candidates.pop_front();
                        tracing::warn!(cap, "Candidate buffer full, dropped oldest candidate");
                    }
                    inner.pending_candidates.push_back(candidate);
                    tracing::trace!(
                        buffered = inner.pending_candidates.len(),
                        "ICE candidate buffered"
                    );
                    return Ok(CandidateDisposition::Buffered);
                }
            }
        };

        peer.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!(error = %e, "ICE candidate rejected by peer connection");
            CallError::MalformedCandidate(e.to_string())
        })?;
        tracing::trace!("ICE candidate applied");
        Ok(CandidateDisposition::Applied)
    }

    /// Add a remote track to the composite remote stream
    ///
    /// Returns `false` if the track was already present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the call is active or reconnecting
    pub fn on_remote_track(&self, track: RemoteTrack) -> Result<bool, CallError> {
        let (call_id, added) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let status = inner.status;
            let Some(call) = inner.call.as_mut().filter(|_| status.is_established()) else {
                tracing::debug!(status = %status, "Ignoring remote track outside of an active call");
                return Err(CallError::InvalidState(format!(
                    "remote track while {status}"
                )));
            };
            let added = call
                .remote
                .get_or_insert_with(RemoteStream::new)
                .add_track(track.clone());
            (call.id, added)
        };

        if added {
            tracing::info!(call_id = %call_id, track_id = %track.id, kind = %track.kind, "Remote track added");
            let _ = self.event_sender.send(CallEvent::RemoteTrackAdded {
                call_id,
                track_id: track.id,
                kind: track.kind,
            });
        }
        Ok(added)
    }

    /// End the call in progress
    ///
    /// Closes the peer connection, stops every local track, clears the
    /// remote stream and returns to `Idle`. A locally initiated end sends
    /// `call_end` if the channel is open; delivery is not retried.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no call is in progress
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self, initiated_locally: bool) -> Result<(), CallError> {
        let reason = if initiated_locally {
            EndReason::LocalHangup
        } else {
            EndReason::RemoteHangup
        };
        self.end_with(reason).await
    }

    /// End the call in progress with an explicit reason
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no call is in progress
    pub async fn end_with(&self, reason: EndReason) -> Result<(), CallError> {
        self.teardown(None, reason).await
    }

    /// Flip the microphone; returns whether it is now enabled
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the call is active
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Audio)
    }

    /// Flip the camera; returns whether it is now enabled
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the call is active with a camera track
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        let (enabled, event) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.status != CallStatus::Active {
                return Err(CallError::InvalidState(format!(
                    "cannot toggle {kind} while {}",
                    inner.status
                )));
            }
            let Some(call) = inner.call.as_mut() else {
                return Err(CallError::InvalidState("no call in progress".to_string()));
            };
            let Some(media) = call.media.as_ref() else {
                return Err(CallError::InvalidState("call has no local media".to_string()));
            };
            if media.tracks_of(kind).next().is_none() {
                return Err(CallError::InvalidState(format!("call has no {kind} track")));
            }

            let flag = match kind {
                TrackKind::Audio => &mut call.audio_enabled,
                TrackKind::Video => &mut call.video_enabled,
            };
            *flag = !*flag;
            let enabled = *flag;
            media.set_enabled(kind, enabled);

            tracing::info!(call_id = %call.id, kind = %kind, enabled, "Local media toggled");
            let event = CallEvent::MediaToggled {
                call_id: call.id,
                audio_enabled: call.audio_enabled,
                video_enabled: call.video_enabled,
            };
            (enabled, event)
        };
        let _ = self.event_sender.send(event);
        Ok(enabled)
    }

    /// Apply a peer-connection callback
    ///
    /// Callbacks from a connection that has since been torn down are ignored.
    pub async fn handle_peer_event(&self, tagged: TaggedPeerEvent) {
        let epoch = tagged.epoch;
        if !self.is_current(epoch) {
            tracing::trace!(epoch, "Dropping callback from a closed peer connection");
            return;
        }
        match tagged.event {
            PeerEvent::LocalCandidate(candidate) => self.send_local_candidate(epoch, candidate).await,
            PeerEvent::RemoteTrack(track) => self.accept_remote_track(epoch, track),
            PeerEvent::StateChanged(state) => self.on_connection_state(epoch, state).await,
        }
    }

    /// Next ring-timeout or disconnect-grace deadline, if one is running
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        let call = inner.call.as_ref()?;
        match inner.status {
            CallStatus::Calling => self
                .config
                .ring_timeout()
                .map(|timeout| call.started_instant + timeout),
            CallStatus::Connecting => call
                .disconnected_at
                .map(|at| at + self.config.disconnect_grace()),
            _ => None,
        }
    }

    /// End the call if its deadline has passed; returns the reason used
    pub async fn on_deadline(&self, now: Instant) -> Option<EndReason> {
        let (epoch, reason) = {
            let inner = self.inner.lock();
            let call = inner.call.as_ref()?;
            let reason = match inner.status {
                CallStatus::Calling => {
                    let timeout = self.config.ring_timeout()?;
                    if now.saturating_duration_since(call.started_instant) < timeout {
                        return None;
                    }
                    EndReason::RingTimeout
                }
                CallStatus::Connecting => {
                    let since = call.disconnected_at?;
                    if now.saturating_duration_since(since) < self.config.disconnect_grace() {
                        return None;
                    }
                    EndReason::ConnectionFailed
                }
                _ => return None,
            };
            (inner.epoch, reason)
        };

        tracing::info!(reason = %reason, "Call deadline reached");
        self.teardown(Some(epoch), reason.clone()).await.ok()?;
        Some(reason)
    }

    fn transition(&self, inner: &mut SessionInner, call_id: Option<CallId>, new: CallStatus) {
        let old = inner.status;
        if old == new {
            return;
        }
        inner.status = new;
        tracing::info!(
            call_id = ?call_id,
            old_status = %old,
            new_status = %new,
            "Call state transition"
        );
        let _ = self
            .event_sender
            .send(CallEvent::StatusChanged { call_id, old, new });
    }

    fn claim(&self, role: CallRole, mode: CallMode) -> Result<(CallId, u64), CallError> {
        let mut inner = self.inner.lock();
        if !inner.status.is_idle() {
            tracing::warn!(status = %inner.status, "Rejected call setup: a call is already in progress");
            return Err(CallError::InvalidState(format!(
                "a call is already in progress ({})",
                inner.status
            )));
        }

        inner.epoch += 1;
        if role == CallRole::Caller {
            inner.pending_candidates.clear();
        }
        let call = ActiveCall::new(role, mode);
        let call_id = call.id;
        inner.call = Some(call);
        let status = match role {
            CallRole::Caller => CallStatus::Calling,
            CallRole::Callee => CallStatus::RingingRemote,
        };
        self.transition(&mut inner, Some(call_id), status);
        Ok((call_id, inner.epoch))
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && inner.call.is_some()
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), CallError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    fn with_current<R>(&self, epoch: u64, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return None;
        }
        inner.call.as_mut().map(f)
    }

    async fn acquire_media(&self, epoch: u64, mode: CallMode) -> Result<Vec<LocalTrack>, CallError> {
        let media = match self.devices.acquire(mode.media_request()).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "Media access failed");
                let _ = self.event_sender.send(CallEvent::MediaAccessFailed {
                    mode,
                    error: e.to_string(),
                });
                return Err(self.abort(epoch, e.into()).await);
            }
        };

        let tracks = media.tracks().to_vec();
        let mut media = Some(media);
        let installed = self.with_current(epoch, |call| call.media = media.take());
        if installed.is_none() {
            let released = media.map_or(0, LocalMedia::release);
            tracing::debug!(released, "Call ended during media acquisition; tracks released");
            return Err(CallError::Cancelled);
        }
        Ok(tracks)
    }

    async fn create_peer(&self, epoch: u64) -> Result<Arc<dyn PeerConnection>, CallError> {
        let sink = PeerEventSink::new(epoch, self.peer_event_tx.clone());
        let peer = match self.factory.create(&self.config.peer_config(), sink).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        let installed = self.with_current(epoch, |call| call.peer = Some(Arc::clone(&peer)));
        if installed.is_none() {
            tracing::debug!("Call ended during peer connection setup; closing it");
            if let Err(e) = peer.close().await {
                tracing::debug!(error = %e, "Closing superseded peer connection failed");
            }
            return Err(CallError::Cancelled);
        }
        Ok(peer)
    }

    async fn add_tracks(
        &self,
        epoch: u64,
        peer: &Arc<dyn PeerConnection>,
        tracks: &[LocalTrack],
    ) -> Result<(), CallError> {
        for track in tracks {
            if let Err(e) = peer.add_local_track(track).await {
                return Err(self.abort(epoch, e.into()).await);
            }
        }
        self.ensure_current(epoch)
    }

    async fn negotiate_offer(peer: &dyn PeerConnection) -> Result<SessionDescription, PeerError> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn negotiate_answer(peer: &dyn PeerConnection) -> Result<SessionDescription, PeerError> {
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn flush_candidates(
        &self,
        epoch: u64,
        peer: &dyn PeerConnection,
    ) -> Result<usize, CallError> {
        let mut applied = 0;
        loop {
            let batch: Vec<IceCandidate> = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.epoch != epoch {
                    return Err(CallError::Cancelled);
                }
                if inner.pending_candidates.is_empty() {
                    if let Some(call) = inner.call.as_mut() {
                        call.remote_description = RemoteDescription::Applied;
                    }
                    break;
                }
                inner.pending_candidates.drain(..).collect()
            };
            for candidate in batch {
                match peer.add_ice_candidate(candidate).await {
                    Ok(()) => applied += 1,
                    Err(e) => tracing::warn!(error = %e, "Buffered ICE candidate rejected"),
                }
            }
        }
        if applied > 0 {
            tracing::debug!(applied, "Replayed buffered ICE candidates");
        }
        Ok(applied)
    }

    fn mark_active(&self, epoch: u64) -> Result<(), CallError> {
        let (call_id, added) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.epoch != epoch {
                return Err(CallError::Cancelled);
            }
            let Some(call) = inner.call.as_mut() else {
                return Err(CallError::Cancelled);
            };
            call.connected_at = Some(Utc::now());
            let mut added = Vec::new();
            for track in std::mem::take(&mut call.early_tracks) {
                let stream = call.remote.get_or_insert_with(RemoteStream::new);
                if stream.add_track(track.clone()) {
                    added.push(track);
                }
            }
            let call_id = call.id;
            self.transition(inner, Some(call_id), CallStatus::Active);
            (call_id, added)
        };

        for track in added {
            let _ = self.event_sender.send(CallEvent::RemoteTrackAdded {
                call_id,
                track_id: track.id,
                kind: track.kind,
            });
        }
        Ok(())
    }

    /// Tear down a call whose setup failed; returns the error to report
    async fn abort(&self, epoch: u64, error: CallError) -> CallError {
        tracing::warn!(error = %error, "Call setup failed");
        match self
            .teardown(Some(epoch), EndReason::SetupFailed(error.to_string()))
            .await
        {
            Ok(()) => error,
            Err(_) => CallError::Cancelled,
        }
    }

    /// The status stays `Ended` until the connection is closed, so a new
    /// call cannot be claimed while the old one is still winding down.
    async fn teardown(&self, expected_epoch: Option<u64>, reason: EndReason) -> Result<(), CallError> {
        let mut call = {
            let mut inner = self.inner.lock();
            if expected_epoch.is_some_and(|epoch| epoch != inner.epoch) {
                return Err(CallError::Cancelled);
            }
            let Some(call) = inner.call.take() else {
                tracing::debug!("end requested with no call in progress");
                return Err(CallError::InvalidState("no call in progress".to_string()));
            };
            inner.epoch += 1;
            inner.pending_candidates.clear();
            self.transition(&mut inner, Some(call.id), CallStatus::Ended);
            call
        };

        let released = call.media.take().map_or(0, LocalMedia::release);
        call.remote = None;
        if reason.notifies_remote() {
            self.signaling
                .send_best_effort(&SignalingMessage::CallEnd)
                .await;
        }
        if let Some(peer) = call.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::debug!(call_id = %call.id, error = %e, "Peer connection close failed");
            }
        }

        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, Some(call.id), CallStatus::Idle);
        }

        let duration_ms = call
            .connected_at
            .map(|at| (Utc::now() - at).num_milliseconds());
        tracing::info!(
            call_id = %call.id,
            reason = %reason,
            released_tracks = released,
            duration_ms = ?duration_ms,
            "Call ended"
        );
        let _ = self.event_sender.send(CallEvent::CallEnded {
            call_id: call.id,
            reason,
            duration_ms,
        });
        Ok(())
    }

    async fn send_local_candidate(&self, epoch: u64, candidate: IceCandidate) {
        let Some(call_id) = self.with_current(epoch, |call| call.id) else {
            return;
        };
        let sent = self
            .signaling
            .send_best_effort(&SignalingMessage::IceCandidate { candidate })
            .await;
        if sent && self.is_current(epoch) {
            let _ = self
                .event_sender
                .send(CallEvent::LocalCandidateSent { call_id });
        }
    }

    fn accept_remote_track(&self, epoch: u64, track: RemoteTrack) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.epoch != epoch {
                return;
            }
            if inner.status.is_setting_up() {
                if let Some(call) = inner.call.as_mut() {
                    tracing::debug!(track_id = %track.id, "Remote track arrived during setup; deferred");
                    call.early_tracks.push(track);
                }
                return;
            }
        }
        let _ = self.on_remote_track(track);
    }

    async fn on_connection_state(&self, epoch: u64, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.epoch != epoch || inner.status != CallStatus::Connecting {
                    return;
                }
                if let Some(call) = inner.call.as_mut() {
                    call.disconnected_at = None;
                    let call_id = call.id;
                    tracing::info!(call_id = %call_id, "Peer connection recovered");
                    self.transition(inner, Some(call_id), CallStatus::Active);
                }
            }
            ConnectionState::Disconnected => {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.epoch != epoch || inner.status != CallStatus::Active {
                    return;
                }
                if let Some(call) = inner.call.as_mut() {
                    call.disconnected_at = Some(Instant::now());
                    let call_id = call.id;
                    tracing::warn!(call_id = %call_id, "Peer connection disconnected");
                    self.transition(inner, Some(call_id), CallStatus::Connecting);
                }
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                tracing::warn!(state = %state, "Peer connection lost");
                let _ = self
                    .teardown(Some(epoch), EndReason::ConnectionFailed)
                    .await;
            }
            ConnectionState::New | ConnectionState::Connecting => {
                tracing::debug!(state = %state, "Peer connection state");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::VirtualMediaDevices;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SignalingChannel for RecordingChannel {
        async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn receive_text(&self) -> Option<String> {
            None
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    impl RecordingChannel {
        fn types(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|frame| {
                    let value: serde_json::Value = serde_json::from_str(frame).unwrap();
                    value["type"].as_str().unwrap().to_string()
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct NullPeer {
        candidates: Mutex<Vec<IceCandidate>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for NullPeer {
        async fn add_local_track(&self, _track: &LocalTrack) -> Result<(), PeerError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn set_local_description(&self, _d: SessionDescription) -> Result<(), PeerError> {
            Ok(())
        }
        async fn set_remote_description(&self, _d: SessionDescription) -> Result<(), PeerError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            self.candidates.lock().push(candidate);
            Ok(())
        }
        async fn close(&self) -> Result<(), PeerError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullFactory {
        created: Mutex<Vec<Arc<NullPeer>>>,
    }

    #[async_trait]
    impl PeerConnectionFactory for NullFactory {
        async fn create(
            &self,
            _config: &PeerConfig,
            _events: PeerEventSink,
        ) -> Result<Arc<dyn PeerConnection>, PeerError> {
            let peer = Arc::new(NullPeer::default());
            self.created.lock().push(Arc::clone(&peer));
            Ok(peer)
        }
    }

    struct Fixture {
        session: CallSession<RecordingChannel>,
        channel: Arc<RecordingChannel>,
        devices: Arc<VirtualMediaDevices>,
        factory: Arc<NullFactory>,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(RecordingChannel::default());
        let devices = Arc::new(VirtualMediaDevices::new());
        let factory = Arc::new(NullFactory::default());
        let session = CallSession::new(
            CallConfig::new("alice"),
            devices.clone(),
            factory.clone(),
            Arc::new(SignalingHandler::new(channel.clone())),
        );
        Fixture {
            session,
            channel,
            devices,
            factory,
        }
    }

    fn candidate(port: u16) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:1 1 udp 2122260223 192.168.1.10 {port} typ host"
        ))
    }

    #[test]
    fn test_config_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), None);
        assert_eq!(config.disconnect_grace(), Duration::from_secs(10));
        assert_eq!(config.max_buffered_candidates, 64);
        assert!(config.announce_calls);
        assert_eq!(config.peer_config(), PeerConfig::default());
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.json");
        std::fs::write(
            &path,
            r#"{"local_user": "bob", "ring_timeout_secs": 30, "ice_servers": []}"#,
        )
        .unwrap();

        let config = CallConfig::from_json_file(&path).unwrap();
        assert_eq!(config.local_user, "bob");
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(30)));
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.disconnect_grace_secs, 10);
    }

    #[test]
    fn test_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CallConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_call_sends_notice_then_offer() {
        let f = fixture();
        f.session.start_call(CallMode::Video).await.unwrap();

        assert_eq!(f.session.status(), CallStatus::Calling);
        assert_eq!(f.channel.types(), vec!["incoming_call", "webrtc_offer"]);
        assert_eq!(f.session.local_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let f = fixture();
        let first = f.session.start_call(CallMode::Audio).await.unwrap();

        let second = f.session.start_call(CallMode::Video).await;
        assert!(matches!(second, Err(CallError::InvalidState(_))));
        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.call_id, Some(first));
        assert_eq!(snapshot.mode, Some(CallMode::Audio));
        assert_eq!(snapshot.status, CallStatus::Calling);
    }

    #[tokio::test]
    async fn test_media_denied_sends_nothing() {
        let f = fixture();
        f.devices.set_permission(false);
        let mut events = f.session.subscribe_events();

        let result = f.session.start_call(CallMode::Video).await;
        assert!(matches!(result, Err(CallError::MediaAccess(_))));
        assert_eq!(f.session.status(), CallStatus::Idle);
        assert!(f.channel.sent.lock().is_empty());

        let mut saw_media_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::MediaAccessFailed { .. }) {
                saw_media_failure = true;
            }
        }
        assert!(saw_media_failure);
    }

    #[tokio::test]
    async fn test_answer_flushes_buffered_candidates() {
        let f = fixture();
        f.session.start_call(CallMode::Audio).await.unwrap();

        for port in [5000, 5001] {
            let disposition = f.session.on_remote_ice_candidate(candidate(port)).await.unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        f.session
            .on_remote_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(f.session.status(), CallStatus::Active);

        let peer = f.factory.created.lock()[0].clone();
        assert_eq!(*peer.candidates.lock(), vec![candidate(5000), candidate(5001)]);
        assert_eq!(
            f.session.on_remote_ice_candidate(candidate(5002)).await.unwrap(),
            CandidateDisposition::Applied
        );
    }

    #[tokio::test]
    async fn test_end_call_releases_everything() {
        let f = fixture();
        f.session.start_call(CallMode::Video).await.unwrap();
        f.session
            .on_remote_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();

        f.session.end_call(true).await.unwrap();
        assert_eq!(f.session.status(), CallStatus::Idle);
        assert_eq!(f.devices.live_track_count(), 0);
        assert!(f.factory.created.lock()[0].closed.load(Ordering::SeqCst));
        assert_eq!(f.channel.types().last().map(String::as_str), Some("call_end"));

        assert!(matches!(
            f.session.end_call(false).await,
            Err(CallError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_requires_active() {
        let f = fixture();
        assert!(f.session.toggle_mute().is_err());
        f.session.start_call(CallMode::Audio).await.unwrap();
        assert!(f.session.toggle_mute().is_err());

        f.session
            .on_remote_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(!f.session.toggle_mute().unwrap());
        assert!(f.session.local_tracks().iter().all(|t| !t.is_enabled()));
        assert!(f.session.toggle_mute().unwrap());
        assert!(matches!(
            f.session.toggle_video(),
            Err(CallError::InvalidState(_))
        ));
    }
}
