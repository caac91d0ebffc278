//! Peer connections backed by the `webrtc` crate
//!
//! Local tracks are registered as `TrackLocalStaticSample`s (Opus for audio,
//! VP8 for video). Capture pipelines push encoded frames through
//! [`WebRtcPeer::write_sample`], which drops frames while the track is
//! disabled so mute and camera-off need no renegotiation.

use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{
    ConnectionState, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    PeerEventSink,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream id shared by every local track of a call
const LOCAL_STREAM_ID: &str = "huddle";

/// Factory for [`WebRtcPeer`] connections
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn build_api() -> anyhow::Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("registering default codecs")?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("registering default interceptors")?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip(self, config, events), fields(epoch = events.epoch()))]
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let api = Self::build_api().map_err(|e| PeerError::Backend(format!("{e:#}")))?;
        let pc = api
            .new_peer_connection(Self::rtc_configuration(config))
            .await
            .map_err(|e| {
                tracing::error!("Failed to create peer connection: {}", e);
                PeerError::Backend(e.to_string())
            })?;
        let pc = Arc::new(pc);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => {
                            tracing::debug!(track_id = %track.id(), "Ignoring track of unspecified kind");
                            return;
                        }
                    };
                    sink.emit(PeerEvent::RemoteTrack(RemoteTrack::new(track.id(), kind)));
                })
            },
        ));

        let sink = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                let state = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                sink.emit(PeerEvent::StateChanged(state));
            })
        }));

        tracing::debug!("Peer connection created");
        Ok(Arc::new(WebRtcPeer {
            pc,
            tracks: Mutex::new(HashMap::new()),
        }))
    }
}

struct SampleTrack {
    local: LocalTrack,
    rtc: Arc<TrackLocalStaticSample>,
}

/// `RTCPeerConnection` wrapper
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<HashMap<String, SampleTrack>>,
}

impl WebRtcPeer {
    /// Underlying connection
    #[must_use]
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Push one encoded frame for a local track
    ///
    /// Returns `Ok(false)` when the frame was dropped because the track is
    /// disabled or stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the track was never added or the write fails
    pub async fn write_sample(
        &self,
        track_id: &str,
        data: Vec<u8>,
        duration: Duration,
    ) -> Result<bool, PeerError> {
        let (local, rtc) = {
            let tracks = self.tracks.lock();
            let entry = tracks
                .get(track_id)
                .ok_or_else(|| PeerError::Backend(format!("unknown local track {track_id}")))?;
            (entry.local.clone(), Arc::clone(&entry.rtc))
        };
        if !local.is_enabled() || !local.is_live() {
            return Ok(false);
        }
        rtc.write_sample(&Sample {
            data: data.into(),
            duration,
            ..Default::default()
        })
        .await
        .map_err(|e| PeerError::Backend(e.to_string()))?;
        Ok(true)
    }

    fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                return Err(PeerError::InvalidDescription(
                    "rollback is not supported".to_string(),
                ))
            }
        };
        result.map_err(|e| PeerError::InvalidDescription(e.to_string()))
    }

    fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
        let kind = match description.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(PeerError::Negotiation(
                    "backend produced an untyped description".to_string(),
                ))
            }
        };
        Ok(SessionDescription {
            kind,
            sdp: description.sdp.clone(),
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            Self::codec_for(track.kind()),
            track.id().to_string(),
            LOCAL_STREAM_ID.to_string(),
        ));
        let as_local: Arc<dyn TrackLocal + Send + Sync> = rtc.clone();
        self.pc
            .add_track(as_local)
            .await
            .map_err(|e| PeerError::Backend(format!("Failed to add {} track: {}", track.kind(), e)))?;

        self.tracks.lock().insert(
            track.id().to_string(),
            SampleTrack {
                local: track.clone(),
                rtc,
            },
        );
        tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Local track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to create offer: {e}")))?;
        Self::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to create answer: {e}")))?;
        Self::from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to set local description: {e}")))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer::IceServer;
    use tokio::sync::mpsc;

    #[test]
    fn test_rtc_configuration_carries_turn_credentials() {
        let config = PeerConfig {
            ice_servers: vec![
                IceServer::stun("stun:stun.example.org:3478"),
                IceServer {
                    urls: vec!["turn:turn.example.org:3478".to_string()],
                    username: Some("huddle".to_string()),
                    credential: Some("secret".to_string()),
                },
            ],
        };
        let rtc = WebRtcPeerFactory::rtc_configuration(&config);
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[0].username, "");
        assert_eq!(rtc.ice_servers[1].username, "huddle");
        assert_eq!(rtc.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_rollback_is_rejected() {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            WebRtcPeer::to_rtc(rollback),
            Err(PeerError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_carries_local_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = PeerConfig { ice_servers: vec![] };
        let peer = WebRtcPeerFactory::new()
            .create(&config, PeerEventSink::new(1, tx))
            .await
            .unwrap();

        let audio = LocalTrack::new(TrackKind::Audio, "mic");
        let video = LocalTrack::new(TrackKind::Video, "cam");
        peer.add_local_track(&audio).await.unwrap();
        peer.add_local_track(&video).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        peer.close().await.unwrap();
    }
}
