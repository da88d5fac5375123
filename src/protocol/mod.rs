use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a call participant, as registered with the relay.
///
/// Opaque and comparable: the lexicographic order of the two identities in a
/// call decides which side creates the SDP offer, so both peers resolve glare
/// to the same answer without exchanging anything extra.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique token correlating every message of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session description as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SdpPayload {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape the relay forwards verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    Busy,
    Rejected,
}

/// Every message the relay routes between registered identities.
///
/// `Register` is the only variant without a `callId`; messages whose `callId`
/// does not match the active session are dropped by the session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Register {
        from: PeerId,
    },
    InitiateCall {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    AcceptCall {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    DeclineCall {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<DeclineReason>,
    },
    CallAccepted {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    CallDeclined {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<DeclineReason>,
    },
    Offer {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: SdpPayload,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: SdpPayload,
    },
    Candidate {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: CandidatePayload,
    },
    Chat {
        from: PeerId,
        to: PeerId,
        #[serde(rename = "callId")]
        call_id: CallId,
        message: String,
        timestamp: i64,
    },
    Error {
        #[serde(default)]
        from: Option<PeerId>,
        #[serde(default)]
        to: Option<PeerId>,
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        message: String,
    },
}

impl SignalMessage {
    /// The call this message belongs to, if any.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SignalMessage::Register { .. } => None,
            SignalMessage::InitiateCall { call_id, .. }
            | SignalMessage::AcceptCall { call_id, .. }
            | SignalMessage::DeclineCall { call_id, .. }
            | SignalMessage::CallAccepted { call_id, .. }
            | SignalMessage::CallDeclined { call_id, .. }
            | SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::Candidate { call_id, .. }
            | SignalMessage::Chat { call_id, .. } => Some(call_id),
            SignalMessage::Error { call_id, .. } => call_id.as_ref(),
        }
    }

    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::Register { from }
            | SignalMessage::InitiateCall { from, .. }
            | SignalMessage::AcceptCall { from, .. }
            | SignalMessage::DeclineCall { from, .. }
            | SignalMessage::CallAccepted { from, .. }
            | SignalMessage::CallDeclined { from, .. }
            | SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Candidate { from, .. }
            | SignalMessage::Chat { from, .. } => Some(from),
            SignalMessage::Error { from, .. } => from.as_ref(),
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Register { .. } => "register",
            SignalMessage::InitiateCall { .. } => "initiate_call",
            SignalMessage::AcceptCall { .. } => "accept_call",
            SignalMessage::DeclineCall { .. } => "decline_call",
            SignalMessage::CallAccepted { .. } => "call_accepted",
            SignalMessage::CallDeclined { .. } => "call_declined",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Chat { .. } => "chat",
            SignalMessage::Error { .. } => "error",
        }
    }
}

/// One entry in a call's chat log. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub from: PeerId,
    pub text: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(from: PeerId, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: format!("{timestamp}-{from}"),
            from,
            text: text.into(),
            timestamp,
        }
    }
}
