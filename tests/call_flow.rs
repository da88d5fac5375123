//! End-to-end call scenarios over an in-memory relay.
//!
//! The relay routes frames by the `to` field, guaranteeing order per sender
//! only, like the real one. Media sessions are scripted doubles so the
//! scenarios run without capture hardware or network sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley::call::state::CallNotice;
use parley::{
    CallSessionManager, CallState, ChatSubchannel, FrameLink, MediaError, MediaEvent,
    MediaSession, MediaSessionFactory, MediaToggles, NegotiationError, NegotiationRole,
    SdpPayload, SignalingChannel,
};
use parley::{CallId, CandidatePayload, Facing, PeerId};

type PeerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

/// Minimal relay: `register` claims an identity, everything else forwards
/// to the identity named in `to`.
#[derive(Default, Clone)]
struct Relay {
    peers: PeerMap,
}

impl Relay {
    fn connect(&self) -> FrameLink {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let mut in_tx = Some(in_tx);
            let mut me: Option<String> = None;
            while let Some(frame) = out_rx.recv().await {
                let value: serde_json::Value = match serde_json::from_str(&frame) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if value["type"] == "register" {
                    if let (Some(from), Some(tx)) = (value["from"].as_str(), in_tx.take()) {
                        me = Some(from.to_string());
                        if let Ok(mut peers) = peers.lock() {
                            peers.insert(from.to_string(), tx);
                        }
                    }
                } else if let Some(to) = value["to"].as_str() {
                    let target = peers.lock().ok().and_then(|p| p.get(to).cloned());
                    if let Some(target) = target {
                        let _ = target.send(frame);
                    }
                }
            }
            if let (Some(me), Ok(mut peers)) = (me, peers.lock()) {
                peers.remove(&me);
            }
        });
        FrameLink {
            outbound: out_tx,
            inbound: in_rx,
        }
    }
}

/// Scripted media session: the offerer immediately produces an offer and a
/// candidate; applying a description completes the connection.
struct FakeMediaSession {
    events: mpsc::UnboundedSender<MediaEvent>,
    fail_camera: bool,
    microphone: AtomicBool,
    camera: AtomicBool,
    roles: Arc<Mutex<Vec<NegotiationRole>>>,
    teardowns: Arc<AtomicUsize>,
    remote_candidates: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn start(&self, role: NegotiationRole) -> Result<(), NegotiationError> {
        if let Ok(mut roles) = self.roles.lock() {
            roles.push(role);
        }
        if role == NegotiationRole::Offerer {
            let _ = self
                .events
                .send(MediaEvent::OfferReady(SdpPayload::offer("v=0 fake offer")));
            let _ = self
                .events
                .send(MediaEvent::LocalCandidate(CandidatePayload {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                }));
        }
        Ok(())
    }

    async fn handle_offer(&self, _sdp: &SdpPayload) -> Result<(), NegotiationError> {
        let _ = self
            .events
            .send(MediaEvent::AnswerReady(SdpPayload::answer("v=0 fake answer")));
        let _ = self.events.send(MediaEvent::Connected);
        Ok(())
    }

    async fn handle_answer(&self, _sdp: &SdpPayload) -> Result<(), NegotiationError> {
        let _ = self.events.send(MediaEvent::Connected);
        Ok(())
    }

    async fn add_remote_candidate(&self, _call_id: &CallId, _candidate: CandidatePayload) {
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_microphone(&self, enabled: bool) -> Result<(), MediaError> {
        self.microphone.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn set_camera(&self, enabled: bool) -> Result<(), MediaError> {
        if self.fail_camera {
            return Err(MediaError::DeviceBusy);
        }
        self.camera.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn switch_camera(&self) -> Result<Facing, MediaError> {
        if self.fail_camera {
            return Err(MediaError::DeviceBusy);
        }
        Ok(Facing::Back)
    }

    fn toggles(&self) -> MediaToggles {
        MediaToggles {
            microphone: self.microphone.load(Ordering::SeqCst),
            camera: self.camera.load(Ordering::SeqCst),
        }
    }

    async fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeFactory {
    fail_camera: bool,
    creates: AtomicUsize,
    roles: Arc<Mutex<Vec<NegotiationRole>>>,
    teardowns: Arc<AtomicUsize>,
    remote_candidates: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn failing_camera() -> Self {
        Self {
            fail_camera: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaSessionFactory for FakeFactory {
    async fn create(
        &self,
        _call_id: CallId,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeMediaSession {
            events,
            fail_camera: self.fail_camera,
            microphone: AtomicBool::new(true),
            camera: AtomicBool::new(true),
            roles: Arc::clone(&self.roles),
            teardowns: Arc::clone(&self.teardowns),
            remote_candidates: Arc::clone(&self.remote_candidates),
        }))
    }
}

struct Endpoint {
    manager: CallSessionManager,
    signaling: Arc<SignalingChannel>,
    factory: Arc<FakeFactory>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn endpoint(relay: &Relay, identity: &str) -> Endpoint {
    endpoint_with(relay, identity, FakeFactory::default())
}

fn endpoint_with(relay: &Relay, identity: &str, factory: FakeFactory) -> Endpoint {
    init_tracing();
    let signaling = SignalingChannel::over_link(relay.connect(), identity.into()).unwrap();
    let factory = Arc::new(factory);
    let manager = CallSessionManager::spawn(
        Arc::clone(&signaling),
        Arc::clone(&factory) as Arc<dyn MediaSessionFactory>,
    );
    Endpoint {
        manager,
        signaling,
        factory,
    }
}

async fn wait_for_state(manager: &CallSessionManager, want: CallState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .expect("manager stopped");
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn accepted_call_reaches_active_and_carries_chat() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint(&relay, "bob@example.com");

    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();
    let call_id = alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();

    let incoming = bob_incoming.recv().await.unwrap();
    assert_eq!(incoming.call_id, call_id);
    assert_eq!(incoming.from, PeerId::from("alice@example.com"));
    assert_eq!(bob.manager.state(), CallState::Ringing);

    bob.manager.accept_incoming().await.unwrap();
    wait_for_state(&alice.manager, CallState::Active).await;
    wait_for_state(&bob.manager, CallState::Active).await;

    // alice < bob: alice made the offer, bob answered.
    assert_eq!(alice.factory.roles.lock().unwrap().as_slice(), &[
        NegotiationRole::Offerer
    ]);
    assert_eq!(bob.factory.roles.lock().unwrap().as_slice(), &[
        NegotiationRole::Answerer
    ]);
    // alice's trickled candidate reached bob's session.
    wait_until(|| bob.factory.remote_candidates.load(Ordering::SeqCst) >= 1).await;

    let alice_chat = ChatSubchannel::open(
        Arc::clone(&alice.signaling),
        call_id.clone(),
        "bob@example.com".into(),
    );
    let bob_chat = ChatSubchannel::open(
        Arc::clone(&bob.signaling),
        call_id,
        "alice@example.com".into(),
    );
    let mut bob_updates = bob_chat.updates().await.unwrap();

    alice_chat.send("hi").unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), bob_updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.text, "hi");
    assert_eq!(received.from, PeerId::from("alice@example.com"));
}

#[tokio::test]
async fn declined_call_notifies_caller_and_never_acquires_media() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint(&relay, "bob@example.com");

    let mut alice_notices = alice.manager.notices().await.unwrap();
    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();

    alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();
    bob_incoming.recv().await.unwrap();
    bob.manager.decline_incoming().await.unwrap();

    wait_for_state(&alice.manager, CallState::Ended).await;
    assert_eq!(bob.manager.state(), CallState::Ended);

    match alice_notices.recv().await.unwrap() {
        CallNotice::Declined { peer, busy } => {
            assert_eq!(peer, PeerId::from("bob@example.com"));
            assert!(!busy);
        }
        other => panic!("unexpected notice: {other:?}"),
    }

    assert_eq!(alice.factory.creates.load(Ordering::SeqCst), 0);
    assert_eq!(bob.factory.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn engaged_callee_declines_third_party_as_busy() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint(&relay, "bob@example.com");
    let carol = endpoint(&relay, "carol@example.com");

    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();
    alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();
    bob_incoming.recv().await.unwrap();
    bob.manager.accept_incoming().await.unwrap();
    wait_for_state(&bob.manager, CallState::Active).await;

    let mut carol_notices = carol.manager.notices().await.unwrap();
    carol
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();

    wait_for_state(&carol.manager, CallState::Ended).await;
    match carol_notices.recv().await.unwrap() {
        CallNotice::Declined { peer, busy } => {
            assert_eq!(peer, PeerId::from("bob@example.com"));
            assert!(busy);
        }
        other => panic!("unexpected notice: {other:?}"),
    }
    // Bob's call is untouched and carol never touched media.
    assert_eq!(bob.manager.state(), CallState::Active);
    assert_eq!(carol.factory.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn glare_resolves_to_exactly_one_offerer() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint(&relay, "bob@example.com");

    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();

    // Both dial each other before either invite lands.
    alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();
    // Bob's dial may lose the race against alice's arriving invite, in
    // which case his manager is already ringing and rejects the command.
    let _ = bob.manager.start_call("alice@example.com".into()).await;

    // The larger identity abandons its own attempt and rings instead.
    let incoming = bob_incoming.recv().await.unwrap();
    assert_eq!(incoming.from, PeerId::from("alice@example.com"));
    bob.manager.accept_incoming().await.unwrap();

    wait_for_state(&alice.manager, CallState::Active).await;
    wait_for_state(&bob.manager, CallState::Active).await;

    assert_eq!(alice.factory.roles.lock().unwrap().as_slice(), &[
        NegotiationRole::Offerer
    ]);
    assert_eq!(bob.factory.roles.lock().unwrap().as_slice(), &[
        NegotiationRole::Answerer
    ]);
}

#[tokio::test]
async fn hang_up_tears_down_both_sides_exactly_once() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint(&relay, "bob@example.com");

    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();
    let mut bob_notices = bob.manager.notices().await.unwrap();

    alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();
    bob_incoming.recv().await.unwrap();
    bob.manager.accept_incoming().await.unwrap();
    wait_for_state(&alice.manager, CallState::Active).await;
    wait_for_state(&bob.manager, CallState::Active).await;

    alice.manager.hang_up().await.unwrap();
    wait_for_state(&alice.manager, CallState::Ended).await;
    wait_for_state(&bob.manager, CallState::Ended).await;

    assert!(matches!(
        bob_notices.recv().await.unwrap(),
        CallNotice::PeerEnded
    ));

    wait_until(|| alice.factory.teardowns.load(Ordering::SeqCst) == 1).await;
    wait_until(|| bob.factory.teardowns.load(Ordering::SeqCst) == 1).await;

    // Hanging up again is an invalid-state error, not a second teardown.
    assert!(alice.manager.hang_up().await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.factory.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn camera_failure_keeps_flags_and_call_state() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    let bob = endpoint_with(&relay, "bob@example.com", FakeFactory::failing_camera());

    let mut bob_incoming = bob.manager.incoming_calls().await.unwrap();
    let mut bob_notices = bob.manager.notices().await.unwrap();

    alice
        .manager
        .start_call("bob@example.com".into())
        .await
        .unwrap();
    bob_incoming.recv().await.unwrap();
    bob.manager.accept_incoming().await.unwrap();
    wait_for_state(&bob.manager, CallState::Active).await;

    let err = bob.manager.set_camera(false).await.unwrap_err();
    assert!(matches!(err, parley::CallError::Media(_)));
    assert!(matches!(
        bob_notices.recv().await.unwrap(),
        CallNotice::DeviceFailure { .. }
    ));

    let toggles = bob.manager.media_toggles().await.unwrap();
    assert!(toggles.camera);
    assert!(toggles.microphone);
    assert_eq!(bob.manager.state(), CallState::Active);

    // Microphone toggling still works on the same session.
    bob.manager.set_microphone(false).await.unwrap();
    let toggles = bob.manager.media_toggles().await.unwrap();
    assert!(!toggles.microphone);
}

#[tokio::test]
async fn relay_loss_ends_the_call_with_a_notice() {
    let (local, remote) = parley::signaling::memory_pair();
    let signaling = SignalingChannel::over_link(local, "alice@example.com".into()).unwrap();
    let factory = Arc::new(FakeFactory::default());
    let manager = CallSessionManager::spawn(
        Arc::clone(&signaling),
        Arc::clone(&factory) as Arc<dyn MediaSessionFactory>,
    );
    let mut notices = manager.notices().await.unwrap();

    manager.start_call("bob@example.com".into()).await.unwrap();
    wait_for_state(&manager, CallState::AwaitingAnswer).await;

    drop(remote);
    wait_for_state(&manager, CallState::Ended).await;
    assert!(matches!(
        notices.recv().await.unwrap(),
        CallNotice::SignalingLost
    ));
}

#[tokio::test]
async fn toggles_require_a_running_media_session() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    assert!(matches!(
        alice.manager.set_camera(false).await,
        Err(parley::CallError::NoMedia)
    ));
}

#[tokio::test]
async fn start_call_validates_the_peer() {
    let relay = Relay::default();
    let alice = endpoint(&relay, "alice@example.com");
    assert!(matches!(
        alice.manager.start_call("  ".into()).await,
        Err(parley::CallError::InvalidState { .. })
    ));
    assert_eq!(alice.manager.state(), CallState::Idle);
}
