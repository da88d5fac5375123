//! Relay connection: one persistent full-duplex link carrying JSON frames.
//!
//! The transport is a pair of string-frame channels (`FrameLink`), produced
//! either by [`ws_connect`] in production or [`memory_pair`] in tests. The
//! [`SignalingChannel`] registers the local identity as its first frame and
//! fans parsed messages out to subscribers in arrival order. There is no
//! reconnect: transport closure surfaces as a single `Closed` event and the
//! channel is done.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::CallConfig;
use crate::protocol::{PeerId, SignalMessage};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("signaling channel is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Raw frame transport: text frames out, text frames in. Dropping the
/// outbound sender closes the link.
pub struct FrameLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Two directly wired links, for in-process tests.
pub fn memory_pair() -> (FrameLink, FrameLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        FrameLink {
            outbound: a_tx,
            inbound: a_rx,
        },
        FrameLink {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

/// Open a websocket to the relay and bridge it onto a [`FrameLink`].
pub async fn ws_connect(url: &Url) -> Result<FrameLink, SignalingError> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| SignalingError::Connect(err.to_string()))?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(err) = ws_tx.send(Message::Text(frame)).await {
                tracing::debug!(target: "signaling", error = %err, "websocket send failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        // in_tx drops here; the receiver observes closure.
    });

    Ok(FrameLink {
        outbound: out_tx,
        inbound: in_rx,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(SignalMessage),
    Closed,
}

/// Shared handle on the relay connection. Cloneable via `Arc`; every
/// subscriber sees every parsed message in arrival order.
pub struct SignalingChannel {
    identity: PeerId,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalingEvent>>>,
}

impl SignalingChannel {
    /// Connect to the relay named by `config` and register `identity`.
    pub async fn connect(
        config: &CallConfig,
        identity: PeerId,
    ) -> Result<Arc<Self>, SignalingError> {
        let link = tokio::time::timeout(config.connect_timeout(), ws_connect(config.signaling_url()))
            .await
            .map_err(|_| SignalingError::Connect("connection timed out".to_string()))??;
        Self::over_link(link, identity)
    }

    /// Run the channel over an already established link. Sends the
    /// `register` frame before returning.
    pub fn over_link(link: FrameLink, identity: PeerId) -> Result<Arc<Self>, SignalingError> {
        let FrameLink {
            outbound,
            mut inbound,
        } = link;

        let register = serde_json::to_string(&SignalMessage::Register {
            from: identity.clone(),
        })?;
        outbound.send(register).map_err(|_| SignalingError::Closed)?;

        let channel = Arc::new(Self {
            identity,
            outbound: Mutex::new(Some(outbound)),
            subscribers: Mutex::new(Vec::new()),
        });

        let pump = Arc::clone(&channel);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match serde_json::from_str::<SignalMessage>(&frame) {
                    Ok(message) => {
                        tracing::trace!(
                            target: "signaling",
                            kind = message.kind(),
                            "relay message"
                        );
                        pump.fan_out(SignalingEvent::Message(message));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "signaling",
                            error = %err,
                            "dropping malformed frame"
                        );
                    }
                }
            }
            tracing::debug!(target: "signaling", "relay link closed");
            pump.fan_out(SignalingEvent::Closed);
            pump.outbound.lock().map(|mut guard| guard.take()).ok();
        });

        Ok(channel)
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Register a subscriber. Events arrive in the order frames arrived.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn send(&self, message: &SignalMessage) -> Result<(), SignalingError> {
        let frame = serde_json::to_string(message)?;
        let guard = self.outbound.lock().map_err(|_| SignalingError::Closed)?;
        match guard.as_ref() {
            Some(sender) => sender.send(frame).map_err(|_| SignalingError::Closed),
            None => Err(SignalingError::Closed),
        }
    }

    /// Drop the outbound half, which closes the underlying transport.
    pub fn close(&self) {
        if let Ok(mut guard) = self.outbound.lock() {
            guard.take();
        }
    }

    fn fan_out(&self, event: SignalingEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
