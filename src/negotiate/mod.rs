//! Offer/answer execution over a peer connection.
//!
//! The [`MediaSession`] trait is the seam the call manager drives; the
//! [`MediaNegotiator`] is its production implementation over
//! `webrtc::RTCPeerConnection`. Everything the negotiator learns
//! asynchronously (local candidates, connection state, produced
//! descriptions) flows back through one event channel.

pub mod candidates;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

use crate::config::CallConfig;
use crate::media::{Facing, MediaError, MediaSource, MediaToggles, TrackController};
use crate::protocol::{CallId, CandidatePayload, SdpPayload};
use candidates::{Enqueue, IceCandidateQueue};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description failed: {0}")]
    Description(String),
}

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Asynchronous output of a media session, consumed by the call manager.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    OfferReady(SdpPayload),
    AnswerReady(SdpPayload),
    LocalCandidate(CandidatePayload),
    Connected,
    Failed(String),
    Closed,
}

/// One call's media leg. The manager drives it; results come back as
/// [`MediaEvent`]s on the channel handed to the factory.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Kick off negotiation. The offerer produces an `OfferReady` event;
    /// the answerer waits for `handle_offer`.
    async fn start(&self, role: NegotiationRole) -> Result<(), NegotiationError>;

    /// Apply the remote offer and produce an `AnswerReady` event.
    async fn handle_offer(&self, sdp: &SdpPayload) -> Result<(), NegotiationError>;

    /// Apply the remote answer.
    async fn handle_answer(&self, sdp: &SdpPayload) -> Result<(), NegotiationError>;

    /// Feed a remote candidate; buffered until the remote description
    /// applies, then applied in arrival order.
    async fn add_remote_candidate(&self, call_id: &CallId, candidate: CandidatePayload);

    async fn set_microphone(&self, enabled: bool) -> Result<(), MediaError>;
    async fn set_camera(&self, enabled: bool) -> Result<(), MediaError>;
    async fn switch_camera(&self) -> Result<Facing, MediaError>;
    fn toggles(&self) -> MediaToggles;

    /// Release devices and close the connection. Idempotent.
    async fn teardown(&self);
}

/// Builds a fresh media session per call.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn create(
        &self,
        call_id: CallId,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError>;
}

fn to_setup_error(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn payload_from_description(desc: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

fn session_description_from_payload(
    payload: &SdpPayload,
) -> Result<RTCSessionDescription, NegotiationError> {
    let description = match RTCSdpType::from(payload.kind.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone())
            .map_err(|err| NegotiationError::Description(err.to_string()))?,
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone())
            .map_err(|err| NegotiationError::Description(err.to_string()))?,
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(payload.sdp.clone())
            .map_err(|err| NegotiationError::Description(err.to_string()))?,
        RTCSdpType::Rollback | RTCSdpType::Unspecified => {
            return Err(NegotiationError::Description(format!(
                "unsupported sdp type {}",
                payload.kind
            )));
        }
    };
    Ok(description)
}

/// Production [`MediaSession`]: owns the peer connection and local tracks.
pub struct MediaNegotiator {
    call_id: CallId,
    pc: Arc<RTCPeerConnection>,
    tracks: TrackController,
    candidates: Mutex<IceCandidateQueue>,
    events: mpsc::UnboundedSender<MediaEvent>,
    closed: AtomicBool,
}

impl MediaNegotiator {
    pub async fn create(
        config: &CallConfig,
        source: Arc<dyn MediaSource>,
        call_id: CallId,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<Self>, NegotiationError> {
        // Devices first: if capture fails, no connection is ever opened.
        let media = source.acquire(config.media()).await?;

        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers()
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let audio_sender = pc
            .add_track(Arc::clone(&media.audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;
        let video_sender = pc
            .add_track(Arc::clone(&media.video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;

        let events_for_candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events_for_candidates.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(MediaEvent::LocalCandidate(CandidatePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "webrtc",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                        }
                    }
                }
            })
        }));

        let events_for_state = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events_for_state.clone();
            Box::pin(async move {
                tracing::debug!(target: "webrtc", ?state, "peer connection state");
                let event = match state {
                    RTCPeerConnectionState::Connected => Some(MediaEvent::Connected),
                    RTCPeerConnectionState::Failed => {
                        Some(MediaEvent::Failed("peer connection failed".to_string()))
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        Some(MediaEvent::Closed)
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = events.send(event);
                }
            })
        }));

        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::debug!(
                    target: "webrtc",
                    kind = %track.kind(),
                    "remote track arrived"
                );
            })
        }));

        let constraints = *config.media();
        Ok(Arc::new(Self {
            call_id: call_id.clone(),
            pc,
            tracks: TrackController::new(source, constraints, media, audio_sender, video_sender),
            candidates: Mutex::new(IceCandidateQueue::new(call_id)),
            events,
            closed: AtomicBool::new(false),
        }))
    }

    async fn apply_candidate(&self, candidate: CandidatePayload) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if let Err(err) = self.pc.add_ice_candidate(init).await {
            tracing::warn!(
                target: "webrtc",
                call_id = %self.call_id,
                error = %err,
                "skipping unusable remote candidate"
            );
        }
    }

    /// Apply the remote description, then flush everything that queued up
    /// while we waited for it.
    async fn apply_remote_description(
        &self,
        sdp: &SdpPayload,
    ) -> Result<(), NegotiationError> {
        let description = session_description_from_payload(sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;

        let pending = self.candidates.lock().await.drain();
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for MediaNegotiator {
    async fn start(&self, role: NegotiationRole) -> Result<(), NegotiationError> {
        match role {
            NegotiationRole::Offerer => {
                let offer = self
                    .pc
                    .create_offer(None)
                    .await
                    .map_err(|err| NegotiationError::Description(err.to_string()))?;
                let payload = payload_from_description(&offer);
                self.pc
                    .set_local_description(offer)
                    .await
                    .map_err(|err| NegotiationError::Description(err.to_string()))?;
                let _ = self.events.send(MediaEvent::OfferReady(payload));
            }
            NegotiationRole::Answerer => {}
        }
        Ok(())
    }

    async fn handle_offer(&self, sdp: &SdpPayload) -> Result<(), NegotiationError> {
        self.apply_remote_description(sdp).await?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        let payload = payload_from_description(&answer);
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        let _ = self.events.send(MediaEvent::AnswerReady(payload));
        Ok(())
    }

    async fn handle_answer(&self, sdp: &SdpPayload) -> Result<(), NegotiationError> {
        self.apply_remote_description(sdp).await
    }

    async fn add_remote_candidate(&self, call_id: &CallId, candidate: CandidatePayload) {
        let outcome = self.candidates.lock().await.push(call_id, candidate.clone());
        match outcome {
            Enqueue::Queued => {}
            Enqueue::PassThrough => self.apply_candidate(candidate).await,
            Enqueue::Discarded => {
                tracing::warn!(
                    target: "webrtc",
                    expected = %self.call_id,
                    got = %call_id,
                    "dropping candidate for another call"
                );
            }
        }
    }

    async fn set_microphone(&self, enabled: bool) -> Result<(), MediaError> {
        self.tracks.set_microphone(enabled).await
    }

    async fn set_camera(&self, enabled: bool) -> Result<(), MediaError> {
        self.tracks.set_camera(enabled).await
    }

    async fn switch_camera(&self) -> Result<Facing, MediaError> {
        self.tracks.switch_camera().await
    }

    fn toggles(&self) -> MediaToggles {
        self.tracks.toggles()
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target: "webrtc",
                call_id = %self.call_id,
                error = %err,
                "peer connection close"
            );
        }
    }
}

/// Factory producing [`MediaNegotiator`] sessions from shared config and a
/// capture source.
pub struct WebRtcSessionFactory {
    config: CallConfig,
    source: Arc<dyn MediaSource>,
}

impl WebRtcSessionFactory {
    pub fn new(config: CallConfig, source: Arc<dyn MediaSource>) -> Self {
        Self { config, source }
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcSessionFactory {
    async fn create(
        &self,
        call_id: CallId,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError> {
        let session =
            MediaNegotiator::create(&self.config, Arc::clone(&self.source), call_id, events)
                .await?;
        Ok(session)
    }
}
