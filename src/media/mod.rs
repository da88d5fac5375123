use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("capture device is busy")]
    DeviceBusy,
    #[error("no capture device available")]
    NoDevice,
    #[error("capture failure: {0}")]
    Capture(String),
}

/// Which camera feeds the video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
}

impl Facing {
    pub fn flipped(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

/// Capture constraints handed to the media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing: Facing,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
            facing: Facing::Front,
        }
    }
}

impl MediaConstraints {
    pub fn with_facing(mut self, facing: Facing) -> Self {
        self.facing = facing;
        self
    }
}

/// Locally captured tracks ready to publish on a peer connection.
pub struct LocalMedia {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
    pub facing: Facing,
}

/// Produces local tracks from whatever capture backend the host platform
/// provides. Device acquisition is injected at this seam so the rest of the
/// crate never touches platform APIs.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;

    /// Re-acquire only the video track, used when switching cameras.
    async fn acquire_video(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<TrackLocalStaticSample>, MediaError>;
}

/// Source that produces valid but sampleless tracks. Useful for loopback
/// setups and tests where no capture hardware exists.
#[derive(Default)]
pub struct SilentMediaSource;

impl SilentMediaSource {
    fn audio_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "parley-audio".to_owned(),
        ))
    }

    fn video_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "parley-video".to_owned(),
        ))
    }
}

#[async_trait]
impl MediaSource for SilentMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        Ok(LocalMedia {
            audio: Self::audio_track(),
            video: Self::video_track(),
            facing: constraints.facing,
        })
    }

    async fn acquire_video(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<TrackLocalStaticSample>, MediaError> {
        Ok(Self::video_track())
    }
}

/// Current enabled flags for the outbound tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaToggles {
    pub microphone: bool,
    pub camera: bool,
}

impl Default for MediaToggles {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

struct TrackSlots {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    facing: Facing,
}

/// Owns the published senders and flips tracks in and out of them.
///
/// Disabling a track replaces the sender's track with `None` so nothing is
/// transmitted at all. Flags only advance after the sender operation
/// succeeds, so a device failure leaves the previous state intact.
pub struct TrackController {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    audio_sender: Arc<RTCRtpSender>,
    video_sender: Arc<RTCRtpSender>,
    slots: Mutex<TrackSlots>,
    microphone: AtomicBool,
    camera: AtomicBool,
}

impl TrackController {
    pub fn new(
        source: Arc<dyn MediaSource>,
        constraints: MediaConstraints,
        media: LocalMedia,
        audio_sender: Arc<RTCRtpSender>,
        video_sender: Arc<RTCRtpSender>,
    ) -> Self {
        Self {
            source,
            constraints,
            audio_sender,
            video_sender,
            slots: Mutex::new(TrackSlots {
                audio: media.audio,
                video: media.video,
                facing: media.facing,
            }),
            microphone: AtomicBool::new(true),
            camera: AtomicBool::new(true),
        }
    }

    pub fn toggles(&self) -> MediaToggles {
        MediaToggles {
            microphone: self.microphone.load(Ordering::SeqCst),
            camera: self.camera.load(Ordering::SeqCst),
        }
    }

    pub async fn set_microphone(&self, enabled: bool) -> Result<(), MediaError> {
        if self.microphone.load(Ordering::SeqCst) == enabled {
            return Ok(());
        }
        let track: Option<Arc<dyn TrackLocal + Send + Sync>> = if enabled {
            let slots = self.slots.lock().await;
            Some(slots.audio.clone())
        } else {
            None
        };
        self.audio_sender
            .replace_track(track)
            .await
            .map_err(|err| MediaError::Capture(err.to_string()))?;
        self.microphone.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    pub async fn set_camera(&self, enabled: bool) -> Result<(), MediaError> {
        if self.camera.load(Ordering::SeqCst) == enabled {
            return Ok(());
        }
        let track: Option<Arc<dyn TrackLocal + Send + Sync>> = if enabled {
            let slots = self.slots.lock().await;
            Some(slots.video.clone())
        } else {
            None
        };
        self.video_sender
            .replace_track(track)
            .await
            .map_err(|err| MediaError::Capture(err.to_string()))?;
        self.camera.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Swap the outbound video to the opposite camera without renegotiating.
    /// On failure the current track keeps flowing.
    pub async fn switch_camera(&self) -> Result<Facing, MediaError> {
        let mut slots = self.slots.lock().await;
        let next = slots.facing.flipped();
        let video = self
            .source
            .acquire_video(&self.constraints.with_facing(next))
            .await?;
        if self.camera.load(Ordering::SeqCst) {
            self.video_sender
                .replace_track(Some(video.clone() as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(|err| MediaError::Capture(err.to_string()))?;
        }
        slots.video = video;
        slots.facing = next;
        Ok(next)
    }
}
