//! Call session manager: one control task owning the state machine.
//!
//! Local commands, relay messages, and media-session events all funnel into
//! the task, which applies them to the [`CallMachine`] and executes the
//! resulting effects. Nothing outside the task mutates call state.

pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};

use crate::media::{Facing, MediaError, MediaToggles};
use crate::negotiate::{MediaEvent, MediaSession, MediaSessionFactory, NegotiationRole};
use crate::protocol::{CallId, CandidatePayload, PeerId, SignalMessage};
use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent};
use state::{CallEvent, CallMachine, CallNotice, CallState, Effect, IncomingCall};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("operation not valid in state {state:?}: {reason}")]
    InvalidState { state: CallState, reason: &'static str },
    #[error("call manager stopped")]
    ManagerStopped,
    #[error("no media session is running")]
    NoMedia,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

enum Command {
    Start {
        peer: PeerId,
        ack: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        ack: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        ack: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        ack: oneshot::Sender<Result<(), CallError>>,
    },
    SetMicrophone {
        enabled: bool,
        ack: oneshot::Sender<Result<(), CallError>>,
    },
    SetCamera {
        enabled: bool,
        ack: oneshot::Sender<Result<(), CallError>>,
    },
    SwitchCamera {
        ack: oneshot::Sender<Result<Facing, CallError>>,
    },
    Toggles {
        ack: oneshot::Sender<Result<MediaToggles, CallError>>,
    },
}

/// Handle on a running call orchestrator. Cheap to share behind an `Arc`.
pub struct CallSessionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<CallState>,
    incoming: AsyncMutex<Option<mpsc::UnboundedReceiver<IncomingCall>>>,
    notices: AsyncMutex<Option<mpsc::UnboundedReceiver<CallNotice>>>,
}

impl CallSessionManager {
    pub fn spawn(
        signaling: Arc<SignalingChannel>,
        factory: Arc<dyn MediaSessionFactory>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let task = ControlTask {
            machine: CallMachine::new(signaling.identity().clone()),
            signal_rx: Some(signaling.subscribe()),
            signaling,
            factory,
            session: None,
            media_tx: None,
            media_rx: None,
            media_call_id: None,
            early_candidates: Vec::new(),
            backlog: VecDeque::new(),
            state_tx,
            incoming_tx,
            notice_tx,
        };
        tokio::spawn(task.run(command_rx));

        Self {
            commands: command_tx,
            state_rx,
            incoming: AsyncMutex::new(Some(incoming_rx)),
            notices: AsyncMutex::new(Some(notice_rx)),
        }
    }

    pub async fn start_call(&self, peer: PeerId) -> Result<CallId, CallError> {
        self.command(|ack| Command::Start { peer, ack }).await
    }

    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.command(|ack| Command::Accept { ack }).await
    }

    pub async fn decline_incoming(&self) -> Result<(), CallError> {
        self.command(|ack| Command::Decline { ack }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.command(|ack| Command::HangUp { ack }).await
    }

    pub async fn set_microphone(&self, enabled: bool) -> Result<(), CallError> {
        self.command(|ack| Command::SetMicrophone { enabled, ack })
            .await
    }

    pub async fn set_camera(&self, enabled: bool) -> Result<(), CallError> {
        self.command(|ack| Command::SetCamera { enabled, ack }).await
    }

    pub async fn switch_camera(&self) -> Result<Facing, CallError> {
        self.command(|ack| Command::SwitchCamera { ack }).await
    }

    pub async fn media_toggles(&self) -> Result<MediaToggles, CallError> {
        self.command(|ack| Command::Toggles { ack }).await
    }

    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    /// Take the incoming-call stream. Yields `None` after the first call.
    pub async fn incoming_calls(&self) -> Option<mpsc::UnboundedReceiver<IncomingCall>> {
        self.incoming.lock().await.take()
    }

    /// Take the notice stream. Yields `None` after the first call.
    pub async fn notices(&self) -> Option<mpsc::UnboundedReceiver<CallNotice>> {
        self.notices.lock().await.take()
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)?
    }
}

struct ControlTask {
    machine: CallMachine,
    signaling: Arc<SignalingChannel>,
    signal_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    factory: Arc<dyn MediaSessionFactory>,
    session: Option<Arc<dyn MediaSession>>,
    media_tx: Option<mpsc::UnboundedSender<MediaEvent>>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    media_call_id: Option<CallId>,
    /// Remote candidates that outran the media session over the relay.
    early_candidates: Vec<(CallId, CandidatePayload)>,
    /// Events generated while executing effects, applied before selecting
    /// new input so ordering stays deterministic.
    backlog: VecDeque<CallEvent>,
    state_tx: watch::Sender<CallState>,
    incoming_tx: mpsc::UnboundedSender<IncomingCall>,
    notice_tx: mpsc::UnboundedSender<CallNotice>,
}

impl ControlTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            while let Some(event) = self.backlog.pop_front() {
                self.dispatch(event).await;
            }

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                signal = next_signal(&mut self.signal_rx) => match signal {
                    Some(SignalingEvent::Message(message)) => {
                        self.dispatch(CallEvent::Signal(message)).await;
                    }
                    Some(SignalingEvent::Closed) | None => {
                        self.signal_rx = None;
                        self.dispatch(CallEvent::ChannelClosed).await;
                    }
                },
                media = next_media(&mut self.media_rx) => match media {
                    Some(event) => self.dispatch_media(event).await,
                    None => self.media_rx = None,
                },
            }
        }
        tracing::debug!(target: "call", "control task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { peer, ack } => {
                let call_id = CallId::random();
                let result = self.machine.apply(CallEvent::Start {
                    peer,
                    call_id: call_id.clone(),
                });
                match result {
                    Ok(effects) => {
                        self.run_effects(effects).await;
                        let _ = ack.send(Ok(call_id));
                    }
                    Err(reason) => {
                        let _ = ack.send(Err(self.invalid_state(reason)));
                    }
                }
                self.publish_state();
            }
            Command::Accept { ack } => {
                let _ = ack.send(self.apply_command(CallEvent::Accept).await);
            }
            Command::Decline { ack } => {
                let _ = ack.send(self.apply_command(CallEvent::Decline).await);
            }
            Command::HangUp { ack } => {
                let _ = ack.send(self.apply_command(CallEvent::HangUp).await);
            }
            Command::SetMicrophone { enabled, ack } => {
                let result = match &self.session {
                    Some(session) => session.set_microphone(enabled).await,
                    None => {
                        let _ = ack.send(Err(CallError::NoMedia));
                        return;
                    }
                };
                let _ = ack.send(self.report_device_result(result));
            }
            Command::SetCamera { enabled, ack } => {
                let result = match &self.session {
                    Some(session) => session.set_camera(enabled).await,
                    None => {
                        let _ = ack.send(Err(CallError::NoMedia));
                        return;
                    }
                };
                let _ = ack.send(self.report_device_result(result));
            }
            Command::SwitchCamera { ack } => {
                let result = match &self.session {
                    Some(session) => session.switch_camera().await,
                    None => {
                        let _ = ack.send(Err(CallError::NoMedia));
                        return;
                    }
                };
                let _ = ack.send(self.report_device_result(result));
            }
            Command::Toggles { ack } => {
                let result = match &self.session {
                    Some(session) => Ok(session.toggles()),
                    None => Err(CallError::NoMedia),
                };
                let _ = ack.send(result);
            }
        }
    }

    /// Device failures never touch call state; they surface as notices and
    /// the previous toggle flags stay in force.
    fn report_device_result<T>(&self, result: Result<T, MediaError>) -> Result<T, CallError> {
        result.map_err(|err| {
            let _ = self.notice_tx.send(CallNotice::DeviceFailure {
                message: err.to_string(),
            });
            CallError::Media(err)
        })
    }

    async fn apply_command(&mut self, event: CallEvent) -> Result<(), CallError> {
        let result = match self.machine.apply(event) {
            Ok(effects) => {
                self.run_effects(effects).await;
                Ok(())
            }
            Err(reason) => Err(self.invalid_state(reason)),
        };
        self.publish_state();
        result
    }

    fn invalid_state(&self, reason: &'static str) -> CallError {
        CallError::InvalidState {
            state: self.machine.state(),
            reason,
        }
    }

    async fn dispatch(&mut self, event: CallEvent) {
        match self.machine.apply(event) {
            Ok(effects) => self.run_effects(effects).await,
            Err(reason) => tracing::debug!(target: "call", reason, "event rejected"),
        }
        self.publish_state();
    }

    async fn dispatch_media(&mut self, event: MediaEvent) {
        let call_id = match &self.media_call_id {
            Some(id) => id.clone(),
            None => return,
        };
        let event = match event {
            MediaEvent::OfferReady(sdp) => CallEvent::OfferReady { call_id, sdp },
            MediaEvent::AnswerReady(sdp) => CallEvent::AnswerReady { call_id, sdp },
            MediaEvent::LocalCandidate(candidate) => {
                CallEvent::LocalCandidate { call_id, candidate }
            }
            MediaEvent::Connected => CallEvent::MediaConnected { call_id },
            MediaEvent::Failed(message) => CallEvent::MediaFailed { call_id, message },
            MediaEvent::Closed => CallEvent::MediaClosed { call_id },
        };
        self.dispatch(event).await;
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.machine.state());
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.send_signal(message),
                Effect::StartMedia { call_id, role } => self.start_media(call_id, role).await,
                Effect::ForwardOffer { sdp, .. } => {
                    self.with_session("offer", |session, tx| async move {
                        if let Err(err) = session.handle_offer(&sdp).await {
                            let _ = tx.send(MediaEvent::Failed(err.to_string()));
                        }
                    });
                }
                Effect::ForwardAnswer { sdp, .. } => {
                    self.with_session("answer", |session, tx| async move {
                        if let Err(err) = session.handle_answer(&sdp).await {
                            let _ = tx.send(MediaEvent::Failed(err.to_string()));
                        }
                    });
                }
                Effect::ForwardCandidate { call_id, candidate } => {
                    // Applied inline so arrival order is preserved.
                    match &self.session {
                        Some(session) => {
                            session.add_remote_candidate(&call_id, candidate).await;
                        }
                        None => self.early_candidates.push((call_id, candidate)),
                    }
                }
                Effect::Teardown => self.teardown(),
                Effect::Incoming(incoming) => {
                    let _ = self.incoming_tx.send(incoming);
                }
                Effect::Notice(notice) => {
                    let _ = self.notice_tx.send(notice);
                }
            }
        }
    }

    fn send_signal(&mut self, message: SignalMessage) {
        let invite_id = match &message {
            SignalMessage::InitiateCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        };
        match self.signaling.send(&message) {
            Ok(()) => {
                if let Some(call_id) = invite_id {
                    self.backlog.push_back(CallEvent::InviteSent { call_id });
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "call",
                    kind = message.kind(),
                    error = %err,
                    "signal send failed"
                );
                self.backlog.push_back(CallEvent::ChannelClosed);
            }
        }
    }

    async fn start_media(&mut self, call_id: CallId, role: NegotiationRole) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = match self.factory.create(call_id.clone(), tx.clone()).await {
            Ok(session) => session,
            Err(err) => {
                self.backlog.push_back(CallEvent::MediaFailed {
                    call_id,
                    message: err.to_string(),
                });
                return;
            }
        };
        self.session = Some(Arc::clone(&session));
        self.media_tx = Some(tx.clone());
        self.media_rx = Some(rx);
        self.media_call_id = Some(call_id.clone());

        let early: Vec<_> = self.early_candidates.drain(..).collect();
        for (id, candidate) in early {
            if id == call_id {
                session.add_remote_candidate(&id, candidate).await;
            }
        }

        tokio::spawn(async move {
            if let Err(err) = session.start(role).await {
                let _ = tx.send(MediaEvent::Failed(err.to_string()));
            }
        });
    }

    fn with_session<F, Fut>(&self, what: &'static str, work: F)
    where
        F: FnOnce(Arc<dyn MediaSession>, mpsc::UnboundedSender<MediaEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        match (&self.session, &self.media_tx) {
            (Some(session), Some(tx)) => {
                tokio::spawn(work(Arc::clone(session), tx.clone()));
            }
            _ => {
                tracing::debug!(target: "call", what, "no media session to forward to");
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                session.teardown().await;
            });
        }
        self.media_tx = None;
        self.media_rx = None;
        self.media_call_id = None;
        self.early_candidates.clear();
    }
}

async fn next_signal(
    rx: &mut Option<mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_media(rx: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
