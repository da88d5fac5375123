//! Two-party audio/video call orchestration over a relayed signaling channel.
//!
//! The relay forwards JSON messages between registered identities; this
//! crate turns those messages plus local commands into a call: invite,
//! ring, accept or decline, negotiate media, talk, hang up. The
//! [`call::CallSessionManager`] owns the state machine; media negotiation
//! runs behind the [`negotiate::MediaSession`] seam so the webrtc engine
//! (or a test double) is swappable.

pub mod call;
pub mod chat;
pub mod config;
pub mod media;
pub mod negotiate;
pub mod protocol;
pub mod signaling;
pub mod token;

pub use call::state::{CallNotice, CallState, IncomingCall};
pub use call::{CallError, CallSessionManager};
pub use chat::ChatSubchannel;
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use media::{
    Facing, MediaConstraints, MediaError, MediaSource, MediaToggles, SilentMediaSource,
};
pub use negotiate::{
    MediaEvent, MediaNegotiator, MediaSession, MediaSessionFactory, NegotiationError,
    NegotiationRole, WebRtcSessionFactory,
};
pub use protocol::{CallId, CandidatePayload, ChatMessage, DeclineReason, PeerId, SdpPayload, SignalMessage};
pub use signaling::{FrameLink, SignalingChannel, SignalingError, SignalingEvent};
pub use token::{TokenClient, TokenConfig, TokenError};
