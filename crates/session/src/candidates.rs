use std::collections::VecDeque;

use crate::protocol::IceCandidate;

/// Remote candidates that arrived before the remote description
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Take every queued candidate in receipt order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    /// Drop everything without applying it
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_receipt_order() {
        let mut queue = CandidateQueue::new();
        for i in 0..5 {
            queue.enqueue(IceCandidate::new(format!("candidate:{}", i)));
        }
        assert_eq!(queue.len(), 5);

        let drained: Vec<String> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(
            drained,
            vec![
                "candidate:0",
                "candidate:1",
                "candidate:2",
                "candidate:3",
                "candidate:4"
            ]
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_discard() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(IceCandidate::new("candidate:a"));
        queue.enqueue(IceCandidate::new("candidate:b"));
        assert_eq!(queue.discard(), 2);
        assert!(queue.is_empty());
    }
}
