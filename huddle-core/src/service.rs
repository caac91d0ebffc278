//! Per-conversation call service
//!
//! [`CallService`] sits between a conversation's realtime channel and its
//! [`CallSession`]: inbound frames are dispatched to the session or the
//! incoming-call notifier, chat traffic is passed through to observers, and
//! peer-connection callbacks and call deadlines are pumped by [`CallService::run`].

use crate::call::{CallConfig, CallError, CallSession, CallSnapshot};
use crate::media::{MediaDevices, VirtualMediaDevices};
use crate::notifier::{IncomingCallNotifier, IncomingCallOffer, NoticeOutcome};
use crate::peer::PeerConnectionFactory;
use crate::signaling::{
    decode_frame, InboundFrame, SignalingChannel, SignalingHandler, SignalingMessage,
};
use crate::types::{CallEvent, CallId, CallMode, CallStatus, EndReason};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Why a pending incoming call went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    /// Local user accepted
    Accepted,
    /// Local user declined
    Declined,
    /// Caller hung up before a decision
    CallerHungUp,
    /// Not decided within the ring timeout
    Expired,
    /// Local user started a call of their own
    Superseded,
    /// Conversation channel closed
    ChannelClosed,
}

/// Events of one conversation for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Call session event
    Call(CallEvent),
    /// Incoming call is ringing (or was updated)
    IncomingCall {
        /// Caller's user name, if announced
        from: Option<String>,
        /// Requested media
        mode: CallMode,
        /// Whether the offer payload has arrived
        ready: bool,
    },
    /// Pending incoming call went away
    IncomingCallCleared {
        /// Caller's user name, if announced
        from: Option<String>,
        /// Why
        reason: ClearReason,
    },
    /// Chat-layer frame
    Chat(serde_json::Value),
    /// Error frame from the relay
    RelayError(String),
    /// Realtime channel closed
    ChannelClosed,
}

/// Call service for one conversation
pub struct CallService<C: SignalingChannel> {
    session: Arc<CallSession<C>>,
    notifier: Mutex<IncomingCallNotifier>,
    event_sender: broadcast::Sender<ConversationEvent>,
}

impl<C: SignalingChannel> CallService<C> {
    /// Wrap a session
    pub fn new(session: CallSession<C>) -> Self {
        let (event_sender, _) = broadcast::channel(1000);
        let notifier = IncomingCallNotifier::new(session.config().local_user.clone());
        Self {
            session: Arc::new(session),
            notifier: Mutex::new(notifier),
            event_sender,
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(signaling: Arc<SignalingHandler<C>>) -> CallServiceBuilder<C> {
        CallServiceBuilder::new(signaling)
    }

    /// Underlying call session
    #[must_use]
    pub fn session(&self) -> &Arc<CallSession<C>> {
        &self.session
    }

    /// Current call status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.session.status()
    }

    /// Point-in-time view of the call
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.session.snapshot()
    }

    /// Pending incoming call, if any
    #[must_use]
    pub fn pending_incoming(&self) -> Option<IncomingCallOffer> {
        self.notifier.lock().pending().cloned()
    }

    /// Subscribe to conversation events
    ///
    /// Call events are forwarded while [`CallService::run`] is running.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_sender.subscribe()
    }

    /// Start an outgoing call
    ///
    /// A pending incoming call is dropped first.
    ///
    /// # Errors
    ///
    /// See [`CallSession::start_call`]
    #[tracing::instrument(skip(self))]
    pub async fn start_call(&self, mode: CallMode) -> Result<CallId, CallError> {
        if self.session.status().is_idle() {
            self.clear_incoming(ClearReason::Superseded);
        }
        self.session.start_call(mode).await
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a call is in progress, nothing is pending,
    /// or only the ringing notice has arrived; otherwise see
    /// [`CallSession::accept_incoming`]
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self) -> Result<CallId, CallError> {
        let status = self.session.status();
        if !status.is_idle() {
            return Err(CallError::InvalidState(format!(
                "cannot accept while {status}"
            )));
        }
        let offer = self.notifier.lock().take_ready()?;
        self.emit(ConversationEvent::IncomingCallCleared {
            from: offer.from.clone(),
            reason: ClearReason::Accepted,
        });
        self.session.accept_incoming(offer).await
    }

    /// Decline the pending incoming call; nothing is sent to the caller
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if nothing is pending
    #[tracing::instrument(skip(self))]
    pub fn decline(&self) -> Result<(), CallError> {
        let declined = self.notifier.lock().decline();
        let Some(offer) = declined else {
            return Err(CallError::InvalidState(
                "no pending incoming call".to_string(),
            ));
        };
        self.session.discard_buffered_candidates();
        self.emit(ConversationEvent::IncomingCallCleared {
            from: offer.from,
            reason: ClearReason::Declined,
        });
        Ok(())
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no call is in progress
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.session.end_call(true).await
    }

    /// Flip the microphone
    ///
    /// # Errors
    ///
    /// See [`CallSession::toggle_mute`]
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.session.toggle_mute()
    }

    /// Flip the camera
    ///
    /// # Errors
    ///
    /// See [`CallSession::toggle_video`]
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.session.toggle_video()
    }

    /// Handle one inbound text frame
    pub async fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(frame) => self.handle_inbound(frame).await,
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
        }
    }

    /// Route a decoded frame
    pub async fn handle_inbound(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Signaling(message) => self.handle_message(message).await,
            InboundFrame::MalformedSignaling {
                message_type,
                error,
            } => {
                tracing::warn!(message_type = %message_type, error = %error, "Dropping malformed signaling frame");
            }
            InboundFrame::RelayError(error) => {
                tracing::warn!(error = %error, "Relay reported an error");
                self.emit(ConversationEvent::RelayError(error));
            }
            InboundFrame::Chat(value) => self.emit(ConversationEvent::Chat(value)),
        }
    }

    /// Dispatch a signaling message to the session or the notifier
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn handle_message(&self, message: SignalingMessage) {
        let status = self.session.status();
        match message {
            SignalingMessage::Offer {
                offer,
                call_type,
                from,
            } => {
                if status.has_live_call() {
                    tracing::debug!(status = %status, "Ignoring offer during a call");
                    return;
                }
                let outcome = self
                    .notifier
                    .lock()
                    .on_offer(from.as_deref(), call_type, offer);
                self.announce_incoming(outcome);
            }
            SignalingMessage::IncomingCall { from, mode } => {
                if status.has_live_call() {
                    tracing::debug!(status = %status, "Ignoring call notice during a call");
                    return;
                }
                let outcome = self.notifier.lock().on_incoming_call(&from, mode);
                self.announce_incoming(outcome);
            }
            SignalingMessage::Answer { answer } => {
                let _ = self.session.on_remote_answer(answer).await;
            }
            SignalingMessage::IceCandidate { candidate } => {
                let _ = self.session.on_remote_ice_candidate(candidate).await;
            }
            SignalingMessage::CallEnd => {
                if status.has_live_call() {
                    let _ = self.session.end_call(false).await;
                } else if !self.clear_incoming(ClearReason::CallerHungUp) {
                    tracing::debug!("call_end with no call in progress");
                }
            }
        }
    }

    /// Treat a closed channel as a remote hangup
    ///
    /// [`CallService::run`] reports [`ConversationEvent::ChannelClosed`]
    /// after the resulting call events.
    pub async fn on_channel_closed(&self) {
        tracing::info!("Signaling channel closed");
        if !self.session.status().is_idle() {
            let _ = self.session.end_with(EndReason::ChannelClosed).await;
        }
        self.clear_incoming(ClearReason::ChannelClosed);
    }

    /// Next call or ring deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let incoming = self
            .session
            .config()
            .ring_timeout()
            .and_then(|timeout| self.notifier.lock().deadline(timeout));
        match (self.session.next_deadline(), incoming) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply deadlines that have passed
    pub async fn on_deadline(&self, now: Instant) {
        self.session.on_deadline(now).await;

        let Some(timeout) = self.session.config().ring_timeout() else {
            return;
        };
        let expired = self.notifier.lock().expire(now, timeout);
        if let Some(offer) = expired {
            self.session.discard_buffered_candidates();
            self.emit(ConversationEvent::IncomingCallCleared {
                from: offer.from,
                reason: ClearReason::Expired,
            });
        }
    }

    /// Pump the conversation until its channel closes
    ///
    /// Reads inbound frames, applies peer-connection callbacks, forwards call
    /// events, and fires deadlines. Only one `run` may be active per service.
    pub async fn run(&self) {
        let Some(mut peer_events) = self.session.take_peer_events() else {
            tracing::warn!("Call service is already running");
            return;
        };
        let mut call_events = self.session.subscribe_events();
        tracing::info!("Call service started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                frame = self.session.signaling().receive_frame() => match frame {
                    Some(frame) => self.handle_inbound(frame).await,
                    None => {
                        self.on_channel_closed().await;
                        break;
                    }
                },
                Some(event) = peer_events.recv() => {
                    self.session.handle_peer_event(event).await;
                }
                event = call_events.recv() => match event {
                    Ok(event) => self.emit(ConversationEvent::Call(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Call event subscriber lagged");
                    }
                    Err(RecvError::Closed) => {}
                },
                () = sleep_until(deadline) => {
                    self.on_deadline(Instant::now()).await;
                }
            }
        }

        while let Ok(event) = call_events.try_recv() {
            self.emit(ConversationEvent::Call(event));
        }
        self.emit(ConversationEvent::ChannelClosed);
        tracing::info!("Call service stopped");
    }

    fn announce_incoming(&self, outcome: NoticeOutcome) {
        if outcome == NoticeOutcome::Ignored {
            return;
        }
        let pending = self.notifier.lock().pending().cloned();
        if let Some(offer) = pending {
            self.emit(ConversationEvent::IncomingCall {
                from: offer.from,
                mode: offer.mode,
                ready: offer.offer.is_some(),
            });
        }
    }

    fn clear_incoming(&self, reason: ClearReason) -> bool {
        let cleared = self.notifier.lock().clear();
        let Some(offer) = cleared else {
            return false;
        };
        tracing::info!(from = ?offer.from, reason = ?reason, "Pending incoming call cleared");
        self.session.discard_buffered_candidates();
        self.emit(ConversationEvent::IncomingCallCleared {
            from: offer.from,
            reason,
        });
        true
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.event_sender.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Call service builder
pub struct CallServiceBuilder<C: SignalingChannel> {
    signaling: Arc<SignalingHandler<C>>,
    config: CallConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    factory: Option<Arc<dyn PeerConnectionFactory>>,
}

impl<C: SignalingChannel> CallServiceBuilder<C> {
    /// Create new builder
    #[must_use]
    pub fn new(signaling: Arc<SignalingHandler<C>>) -> Self {
        Self {
            signaling,
            config: CallConfig::default(),
            devices: None,
            factory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capture device source (default: [`VirtualMediaDevices`])
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the peer connection backend
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if no peer connection backend is available
    pub fn build(self) -> Result<CallService<C>, ServiceError> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_peer_factory()?,
        };
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(VirtualMediaDevices::new()));
        let session = CallSession::new(self.config, devices, factory, self.signaling);
        Ok(CallService::new(session))
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    Ok(Arc::new(crate::webrtc_backend::WebRtcPeerFactory::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no peer connection backend; enable `webrtc-backend` or set a factory".to_string(),
    ))
}
