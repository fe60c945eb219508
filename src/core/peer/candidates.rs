//! Buffer for remote ICE candidates that race the remote description.
//!
//! Candidates may arrive over signaling before `setRemoteDescription`
//! has completed; applying them early fails. They queue here and drain
//! FIFO once the description lands. Candidates arriving after the drain
//! bypass the queue entirely.

use serde_json::Value;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    queued: VecDeque<Value>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Value) {
        self.queued.push_back(candidate);
    }

    /// Take everything in arrival order.
    pub fn drain(&mut self) -> Vec<Value> {
        self.queued.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_drain() {
        let mut q = CandidateQueue::new();
        q.push(json!({"candidate": "a"}));
        q.push(json!({"candidate": "b"}));
        q.push(json!({"candidate": "c"}));
        assert_eq!(q.len(), 3);

        let drained = q.drain();
        assert_eq!(
            drained,
            vec![
                json!({"candidate": "a"}),
                json!({"candidate": "b"}),
                json!({"candidate": "c"})
            ]
        );
        assert!(q.is_empty());
    }
}
