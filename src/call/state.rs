//! Pure call state machine.
//!
//! [`CallMachine::apply`] consumes one event and returns the effects the
//! driver must execute. No I/O happens here; every async completion
//! re-enters as a callId-tagged event and is silently dropped when it no
//! longer matches the live session.

use crate::negotiate::NegotiationRole;
use crate::protocol::{CallId, CandidatePayload, DeclineReason, PeerId, SdpPayload, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    AwaitingAnswer,
    Ringing,
    Negotiating,
    Active,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Surfaced when a peer invites us while we can take the call.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub from: PeerId,
}

/// User-visible happenings that are not state transitions by themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    Declined { peer: PeerId, busy: bool },
    Cancelled { peer: PeerId },
    PeerEnded,
    RemoteError { message: String },
    MediaFailed { message: String },
    SignalingLost,
    DeviceFailure { message: String },
}

/// Everything that can drive the machine forward.
#[derive(Debug, Clone)]
pub enum CallEvent {
    // Local commands.
    Start { peer: PeerId, call_id: CallId },
    Accept,
    Decline,
    HangUp,
    // Completions of effects, tagged with the call they belong to.
    InviteSent { call_id: CallId },
    OfferReady { call_id: CallId, sdp: SdpPayload },
    AnswerReady { call_id: CallId, sdp: SdpPayload },
    LocalCandidate { call_id: CallId, candidate: CandidatePayload },
    MediaConnected { call_id: CallId },
    MediaFailed { call_id: CallId, message: String },
    MediaClosed { call_id: CallId },
    // Inbound.
    Signal(SignalMessage),
    ChannelClosed,
}

/// Work the driver performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(SignalMessage),
    StartMedia { call_id: CallId, role: NegotiationRole },
    ForwardOffer { call_id: CallId, sdp: SdpPayload },
    ForwardAnswer { call_id: CallId, sdp: SdpPayload },
    ForwardCandidate { call_id: CallId, candidate: CandidatePayload },
    Teardown,
    Incoming(IncomingCall),
    Notice(CallNotice),
}

#[derive(Debug, Clone)]
struct SessionCtx {
    call_id: CallId,
    peer: PeerId,
    role: CallRole,
}

pub struct CallMachine {
    local: PeerId,
    state: CallState,
    session: Option<SessionCtx>,
}

impl CallMachine {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            state: CallState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.session.as_ref().map(|s| &s.call_id)
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.session.as_ref().map(|s| &s.peer)
    }

    fn vacant(&self) -> bool {
        self.state == CallState::Idle || self.state.is_terminal()
    }

    /// The smaller identity creates the offer; both sides agree without
    /// exchanging anything extra.
    fn offer_role(&self, peer: &PeerId) -> NegotiationRole {
        if self.local < *peer {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        }
    }

    /// Enter a terminal state. Teardown is emitted exactly once per
    /// terminal entry; the driver makes it idempotent on its side too.
    fn end(&mut self, next: CallState, effects: &mut Vec<Effect>) {
        self.state = next;
        self.session = None;
        effects.push(Effect::Teardown);
    }

    fn matches(&self, call_id: &CallId) -> bool {
        !self.state.is_terminal()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.call_id == *call_id)
    }

    pub fn apply(&mut self, event: CallEvent) -> Result<Vec<Effect>, &'static str> {
        match event {
            CallEvent::Start { peer, call_id } => self.on_start(peer, call_id),
            CallEvent::Accept => self.on_accept(),
            CallEvent::Decline => self.on_decline(),
            CallEvent::HangUp => self.on_hang_up(),
            CallEvent::InviteSent { call_id } => {
                if self.matches(&call_id) && self.state == CallState::Dialing {
                    self.state = CallState::AwaitingAnswer;
                }
                Ok(Vec::new())
            }
            CallEvent::OfferReady { call_id, sdp } => Ok(self.on_description_ready(
                call_id, sdp, /* offer */ true,
            )),
            CallEvent::AnswerReady { call_id, sdp } => {
                Ok(self.on_description_ready(call_id, sdp, false))
            }
            CallEvent::LocalCandidate { call_id, candidate } => {
                let mut effects = Vec::new();
                if self.matches(&call_id)
                    && matches!(self.state, CallState::Negotiating | CallState::Active)
                {
                    let session = self.session.as_ref().ok_or("no session")?;
                    effects.push(Effect::Send(SignalMessage::Candidate {
                        from: self.local.clone(),
                        to: session.peer.clone(),
                        call_id,
                        candidate,
                    }));
                }
                Ok(effects)
            }
            CallEvent::MediaConnected { call_id } => {
                if self.matches(&call_id) && self.state == CallState::Negotiating {
                    self.state = CallState::Active;
                }
                Ok(Vec::new())
            }
            CallEvent::MediaFailed { call_id, message } => {
                let mut effects = Vec::new();
                if self.matches(&call_id) {
                    self.end(CallState::Failed, &mut effects);
                    effects.push(Effect::Notice(CallNotice::MediaFailed { message }));
                }
                Ok(effects)
            }
            CallEvent::MediaClosed { call_id } => {
                let mut effects = Vec::new();
                if self.matches(&call_id)
                    && matches!(self.state, CallState::Negotiating | CallState::Active)
                {
                    self.end(CallState::Ended, &mut effects);
                    effects.push(Effect::Notice(CallNotice::PeerEnded));
                }
                Ok(effects)
            }
            CallEvent::Signal(message) => Ok(self.on_signal(message)),
            CallEvent::ChannelClosed => {
                let mut effects = Vec::new();
                if !self.state.is_terminal() {
                    self.end(CallState::Ended, &mut effects);
                    effects.push(Effect::Notice(CallNotice::SignalingLost));
                }
                Ok(effects)
            }
        }
    }

    fn on_start(&mut self, peer: PeerId, call_id: CallId) -> Result<Vec<Effect>, &'static str> {
        if peer.is_empty() {
            return Err("peer identity is empty");
        }
        if !self.vacant() {
            return Err("another call is in progress");
        }
        self.session = Some(SessionCtx {
            call_id: call_id.clone(),
            peer: peer.clone(),
            role: CallRole::Caller,
        });
        self.state = CallState::Dialing;
        Ok(vec![Effect::Send(SignalMessage::InitiateCall {
            from: self.local.clone(),
            to: peer,
            call_id,
        })])
    }

    fn on_accept(&mut self) -> Result<Vec<Effect>, &'static str> {
        if self.state != CallState::Ringing {
            return Err("no incoming call to accept");
        }
        let session = self.session.as_ref().ok_or("no session")?;
        let call_id = session.call_id.clone();
        let peer = session.peer.clone();
        self.state = CallState::Negotiating;
        Ok(vec![
            Effect::Send(SignalMessage::AcceptCall {
                from: self.local.clone(),
                to: peer.clone(),
                call_id: call_id.clone(),
            }),
            Effect::StartMedia {
                call_id,
                role: self.offer_role(&peer),
            },
        ])
    }

    fn on_decline(&mut self) -> Result<Vec<Effect>, &'static str> {
        if self.state != CallState::Ringing {
            return Err("no incoming call to decline");
        }
        let session = self.session.as_ref().ok_or("no session")?;
        let decline = SignalMessage::DeclineCall {
            from: self.local.clone(),
            to: session.peer.clone(),
            call_id: session.call_id.clone(),
            reason: Some(DeclineReason::Rejected),
        };
        let mut effects = vec![Effect::Send(decline)];
        self.end(CallState::Ended, &mut effects);
        Ok(effects)
    }

    fn on_hang_up(&mut self) -> Result<Vec<Effect>, &'static str> {
        if !matches!(
            self.state,
            CallState::Dialing
                | CallState::AwaitingAnswer
                | CallState::Negotiating
                | CallState::Active
        ) {
            return Err("no call in progress");
        }
        let session = self.session.as_ref().ok_or("no session")?;
        // The wire has no dedicated hang-up tag; DeclineCall doubles as
        // cancel and end, interpreted by the receiver's phase.
        let notify_peer = SignalMessage::DeclineCall {
            from: self.local.clone(),
            to: session.peer.clone(),
            call_id: session.call_id.clone(),
            reason: None,
        };
        let mut effects = vec![Effect::Send(notify_peer)];
        self.end(CallState::Ended, &mut effects);
        Ok(effects)
    }

    fn on_description_ready(&mut self, call_id: CallId, sdp: SdpPayload, offer: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.matches(&call_id) && self.state == CallState::Negotiating {
            if let Some(session) = self.session.as_ref() {
                let message = if offer {
                    SignalMessage::Offer {
                        from: self.local.clone(),
                        to: session.peer.clone(),
                        call_id,
                        sdp,
                    }
                } else {
                    SignalMessage::Answer {
                        from: self.local.clone(),
                        to: session.peer.clone(),
                        call_id,
                        sdp,
                    }
                };
                effects.push(Effect::Send(message));
            }
        }
        effects
    }

    fn on_signal(&mut self, message: SignalMessage) -> Vec<Effect> {
        match message {
            SignalMessage::InitiateCall { from, call_id, .. } => self.on_invite(from, call_id),
            SignalMessage::AcceptCall { from, call_id, .. }
            | SignalMessage::CallAccepted { from, call_id, .. } => {
                self.on_accepted(from, call_id)
            }
            SignalMessage::DeclineCall {
                from,
                call_id,
                reason,
                ..
            }
            | SignalMessage::CallDeclined {
                from,
                call_id,
                reason,
                ..
            } => self.on_declined(from, call_id, reason),
            SignalMessage::Offer { call_id, sdp, .. } => {
                if self.matches(&call_id) && self.state == CallState::Negotiating {
                    vec![Effect::ForwardOffer { call_id, sdp }]
                } else {
                    Vec::new()
                }
            }
            SignalMessage::Answer { call_id, sdp, .. } => {
                if self.matches(&call_id) && self.state == CallState::Negotiating {
                    vec![Effect::ForwardAnswer { call_id, sdp }]
                } else {
                    Vec::new()
                }
            }
            SignalMessage::Candidate {
                call_id, candidate, ..
            } => {
                // Candidates may outrun the accept over the relay; the
                // driver buffers them until the media session exists.
                if self.matches(&call_id)
                    && matches!(
                        self.state,
                        CallState::Dialing
                            | CallState::AwaitingAnswer
                            | CallState::Negotiating
                            | CallState::Active
                    )
                {
                    vec![Effect::ForwardCandidate { call_id, candidate }]
                } else {
                    Vec::new()
                }
            }
            SignalMessage::Error {
                call_id, message, ..
            } => {
                let relevant = match call_id {
                    Some(id) => self.matches(&id),
                    None => !self.state.is_terminal() && self.session.is_some(),
                };
                let mut effects = Vec::new();
                if relevant {
                    self.end(CallState::Failed, &mut effects);
                    effects.push(Effect::Notice(CallNotice::RemoteError { message }));
                }
                effects
            }
            // Chat rides the same channel but belongs to the chat overlay.
            SignalMessage::Chat { .. } | SignalMessage::Register { .. } => Vec::new(),
        }
    }

    fn on_invite(&mut self, from: PeerId, call_id: CallId) -> Vec<Effect> {
        if self.vacant() {
            self.session = Some(SessionCtx {
                call_id: call_id.clone(),
                peer: from.clone(),
                role: CallRole::Callee,
            });
            self.state = CallState::Ringing;
            return vec![Effect::Incoming(IncomingCall { call_id, from })];
        }

        let session = match self.session.as_ref() {
            Some(session) => session,
            None => return Vec::new(),
        };

        if self.state == CallState::Ringing && session.peer == from {
            // Duplicate invite while the user is still deciding.
            return Vec::new();
        }

        if matches!(self.state, CallState::Dialing | CallState::AwaitingAnswer)
            && session.peer == from
        {
            // Both sides dialed each other. The smaller identity keeps its
            // own attempt; the larger side adopts the peer's invite.
            if self.local < from {
                return Vec::new();
            }
            self.session = Some(SessionCtx {
                call_id: call_id.clone(),
                peer: from.clone(),
                role: CallRole::Callee,
            });
            self.state = CallState::Ringing;
            return vec![Effect::Incoming(IncomingCall { call_id, from })];
        }

        // Engaged elsewhere: decline without disturbing the current call.
        vec![Effect::Send(SignalMessage::DeclineCall {
            from: self.local.clone(),
            to: from,
            call_id,
            reason: Some(DeclineReason::Busy),
        })]
    }

    fn on_accepted(&mut self, from: PeerId, call_id: CallId) -> Vec<Effect> {
        if !self.matches(&call_id)
            || !matches!(self.state, CallState::Dialing | CallState::AwaitingAnswer)
        {
            return Vec::new();
        }
        let session = match self.session.as_ref() {
            Some(session) if session.peer == from && session.role == CallRole::Caller => session,
            _ => return Vec::new(),
        };
        let peer = session.peer.clone();
        self.state = CallState::Negotiating;
        vec![Effect::StartMedia {
            call_id,
            role: self.offer_role(&peer),
        }]
    }

    fn on_declined(
        &mut self,
        from: PeerId,
        call_id: CallId,
        reason: Option<DeclineReason>,
    ) -> Vec<Effect> {
        if !self.matches(&call_id) {
            return Vec::new();
        }
        let peer_matches = self.session.as_ref().is_some_and(|s| s.peer == from);
        if !peer_matches {
            return Vec::new();
        }
        let notice = match self.state {
            CallState::Dialing | CallState::AwaitingAnswer => CallNotice::Declined {
                peer: from,
                busy: reason == Some(DeclineReason::Busy),
            },
            CallState::Ringing => CallNotice::Cancelled { peer: from },
            _ => CallNotice::PeerEnded,
        };
        let mut effects = Vec::new();
        self.end(CallState::Ended, &mut effects);
        effects.push(Effect::Notice(notice));
        effects
    }
}
