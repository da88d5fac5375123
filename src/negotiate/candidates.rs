use crate::protocol::{CallId, CandidatePayload};

/// What became of a pushed candidate.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// Buffered; the remote description has not applied yet.
    Queued,
    /// The queue already flushed; apply the candidate directly.
    PassThrough,
    /// Tagged with a different call; dropped.
    Discarded,
}

/// Buffers remote ICE candidates that arrive before the remote description.
///
/// Bound to exactly one call. Candidates come back out of [`drain`] in
/// arrival order; once drained, later candidates pass straight through.
///
/// [`drain`]: IceCandidateQueue::drain
pub struct IceCandidateQueue {
    call_id: CallId,
    pending: Vec<CandidatePayload>,
    flushed: bool,
}

impl IceCandidateQueue {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            pending: Vec::new(),
            flushed: false,
        }
    }

    pub fn push(&mut self, call_id: &CallId, candidate: CandidatePayload) -> Enqueue {
        if *call_id != self.call_id {
            return Enqueue::Discarded;
        }
        if self.flushed {
            return Enqueue::PassThrough;
        }
        self.pending.push(candidate);
        Enqueue::Queued
    }

    /// Hand back everything buffered, in arrival order, and switch the queue
    /// to pass-through mode.
    pub fn drain(&mut self) -> Vec<CandidatePayload> {
        self.flushed = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> CandidatePayload {
        CandidatePayload {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn drains_in_arrival_order() {
        let id = CallId::new("c-1");
        let mut queue = IceCandidateQueue::new(id.clone());
        for n in 0..3 {
            assert_eq!(queue.push(&id, candidate(n)), Enqueue::Queued);
        }
        let drained = queue.drain();
        assert_eq!(drained, vec![candidate(0), candidate(1), candidate(2)]);
    }

    #[test]
    fn discards_mismatched_call_id() {
        let mut queue = IceCandidateQueue::new(CallId::new("c-1"));
        assert_eq!(
            queue.push(&CallId::new("c-2"), candidate(1)),
            Enqueue::Discarded
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn passes_through_after_drain() {
        let id = CallId::new("c-1");
        let mut queue = IceCandidateQueue::new(id.clone());
        queue.push(&id, candidate(1));
        queue.drain();
        assert_eq!(queue.push(&id, candidate(2)), Enqueue::PassThrough);
        assert!(queue.is_flushed());
    }
}
