//! Text overlay for an active call.
//!
//! Chat rides the same relay connection as signaling, scoped to one callId.
//! The log lives only as long as the subchannel; dropping it with the call
//! discards the history.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use crate::protocol::{CallId, ChatMessage, PeerId, SignalMessage};
use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Insert keeping the log sorted by timestamp, ties by insertion order.
fn insert_ordered(log: &mut Vec<ChatMessage>, message: ChatMessage) {
    let at = log
        .iter()
        .rposition(|m| m.timestamp <= message.timestamp)
        .map(|i| i + 1)
        .unwrap_or(0);
    log.insert(at, message);
}

pub struct ChatSubchannel {
    signaling: Arc<SignalingChannel>,
    call_id: CallId,
    peer: PeerId,
    log: Arc<Mutex<Vec<ChatMessage>>>,
    updates: AsyncMutex<Option<mpsc::UnboundedReceiver<ChatMessage>>>,
    filter: JoinHandle<()>,
}

impl ChatSubchannel {
    /// Open the overlay for one call. Messages for other calls, and frames
    /// with an empty sender, never reach the log.
    pub fn open(signaling: Arc<SignalingChannel>, call_id: CallId, peer: PeerId) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let mut events = signaling.subscribe();
        let filter_log = Arc::clone(&log);
        let filter_call = call_id.clone();
        let filter = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let (from, text, timestamp) = match event {
                    SignalingEvent::Message(SignalMessage::Chat {
                        from,
                        call_id,
                        message,
                        timestamp,
                        ..
                    }) if call_id == filter_call => (from, message, timestamp),
                    SignalingEvent::Closed => break,
                    _ => continue,
                };
                if from.is_empty() {
                    tracing::warn!(target: "chat", "dropping chat frame without sender");
                    continue;
                }
                let message = ChatMessage::new(from, text, timestamp);
                if let Ok(mut log) = filter_log.lock() {
                    insert_ordered(&mut log, message.clone());
                }
                let _ = update_tx.send(message);
            }
        });

        Self {
            signaling,
            call_id,
            peer,
            log,
            updates: AsyncMutex::new(Some(update_rx)),
            filter,
        }
    }

    /// Send a message to the peer and append it to the local log.
    pub fn send(&self, text: impl Into<String>) -> Result<ChatMessage, SignalingError> {
        let text = text.into();
        let timestamp = now_millis();
        self.signaling.send(&SignalMessage::Chat {
            from: self.signaling.identity().clone(),
            to: self.peer.clone(),
            call_id: self.call_id.clone(),
            message: text.clone(),
            timestamp,
        })?;
        let message = ChatMessage::new(self.signaling.identity().clone(), text, timestamp);
        if let Ok(mut log) = self.log.lock() {
            insert_ordered(&mut log, message.clone());
        }
        Ok(message)
    }

    /// Snapshot of the log, timestamp ascending.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Take the stream of messages received from the peer. Yields `None`
    /// after the first call.
    pub async fn updates(&self) -> Option<mpsc::UnboundedReceiver<ChatMessage>> {
        self.updates.lock().await.take()
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }
}

impl Drop for ChatSubchannel {
    fn drop(&mut self) {
        self.filter.abort();
    }
}
