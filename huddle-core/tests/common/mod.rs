//! Shared fixtures: a scripted peer connection backend and an in-memory channel

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_core::{
    CallConfig, CallSession, IceCandidate, LocalTrack, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, SessionDescription,
    SignalingChannel, SignalingError, SignalingHandler, SignalingMessage, VirtualMediaDevices,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Peer connection that records what the session asks of it
pub struct ScriptedPeer {
    sink: PeerEventSink,
    pub local_tracks: Mutex<Vec<String>>,
    pub remote_description: Mutex<Option<SessionDescription>>,
    pub local_description: Mutex<Option<SessionDescription>>,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
    reject_remote_description: bool,
    close_delay: Option<Duration>,
}

impl ScriptedPeer {
    /// Raise a callback as the backend would
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn epoch(&self) -> u64 {
        self.sink.epoch()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.local_tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let tracks = self.local_tracks.lock().unwrap().len();
        Ok(SessionDescription::offer(format!("v=0 offer tracks={tracks}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote_description.lock().unwrap().is_none() {
            return Err(PeerError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        *self.local_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        if self.reject_remote_description {
            return Err(PeerError::InvalidDescription("scripted rejection".to_string()));
        }
        *self.remote_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote_description.lock().unwrap().is_none() {
            return Err(PeerError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`ScriptedPeer`]s
#[derive(Default)]
pub struct ScriptedFactory {
    pub peers: Mutex<Vec<Arc<ScriptedPeer>>>,
    pub create_delay: Option<Duration>,
    pub close_delay: Option<Duration>,
    pub reject_remote_description: bool,
    pub fail_create: AtomicBool,
}

impl ScriptedFactory {
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_close_delay(delay: Duration) -> Self {
        Self {
            close_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn rejecting_remote_description() -> Self {
        Self {
            reject_remote_description: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<ScriptedPeer> {
        match self.peers.lock().unwrap().last() {
            Some(peer) => Arc::clone(peer),
            None => unreachable!("no peer connection was created"),
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::Backend("scripted failure".to_string()));
        }
        let peer = Arc::new(ScriptedPeer {
            sink: events,
            local_tracks: Mutex::new(Vec::new()),
            remote_description: Mutex::new(None),
            local_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reject_remote_description: self.reject_remote_description,
            close_delay: self.close_delay,
        });
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Channel whose outbound frames are recorded and inbound frames injected
pub struct MemoryChannel {
    sent: Mutex<Vec<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    open: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            open: AtomicBool::new(true),
        }
    }

    pub fn push_inbound(&self, frame: impl Into<String>) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame.into());
        }
    }

    pub fn push_message(&self, message: &SignalingMessage) {
        self.push_inbound(message.to_frame().unwrap());
    }

    /// Stop sending and end the inbound stream
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<SignalingMessage> {
        self.sent()
            .iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }

    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent_messages()
            .iter()
            .map(SignalingMessage::message_type)
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn receive_text(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub session: Arc<CallSession<MemoryChannel>>,
    pub channel: Arc<MemoryChannel>,
    pub devices: Arc<VirtualMediaDevices>,
    pub factory: Arc<ScriptedFactory>,
}

pub fn harness_with(
    config: CallConfig,
    devices: VirtualMediaDevices,
    factory: ScriptedFactory,
) -> Harness {
    let channel = Arc::new(MemoryChannel::new());
    let devices = Arc::new(devices);
    let factory = Arc::new(factory);
    let session = Arc::new(CallSession::new(
        config,
        devices.clone(),
        factory.clone(),
        Arc::new(SignalingHandler::new(channel.clone())),
    ));
    Harness {
        session,
        channel,
        devices,
        factory,
    }
}

pub fn harness(local_user: &str) -> Harness {
    harness_with(
        CallConfig::new(local_user),
        VirtualMediaDevices::new(),
        ScriptedFactory::default(),
    )
}

pub fn candidate(port: u16) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:842163049 1 udp 1677729535 203.0.113.7 {port} typ srflx raddr 10.0.0.2 rport {port}"
    ))
}

pub fn remote_offer() -> SessionDescription {
    SessionDescription::offer("v=0 remote offer")
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
