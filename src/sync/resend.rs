//! Sent-but-unacknowledged messages.

use std::collections::VecDeque;

use super::seq::seq_less;

/// A sent message awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendEntry<T> {
    /// Sequence the message was stamped with.
    pub seq: u32,
    /// The message.
    pub item: T,
}

/// Messages kept for retransmission until the peer acknowledges them.
///
/// Entries are kept in send order.
#[derive(Debug, Clone)]
pub struct ResendQueue<T> {
    entries: VecDeque<ResendEntry<T>>,
}

impl<T> Default for ResendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResendQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Record a sent message.
    pub fn push(&mut self, seq: u32, item: T) {
        self.entries.push_back(ResendEntry { seq, item });
    }

    /// Drop every entry whose sequence is before `ack`.
    ///
    /// Returns the number of entries removed. An entry whose sequence equals
    /// `ack` is kept: the peer is still waiting for it.
    pub fn prune(&mut self, ack: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !seq_less(e.seq, ack));
        before - self.entries.len()
    }

    /// Sequences currently queued, in order.
    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.seq)
    }

    /// Entries in send order.
    pub fn iter(&self) -> impl Iterator<Item = &ResendEntry<T>> {
        self.entries.iter()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = ResendEntry<T>> + '_ {
        self.entries.drain(..)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> ResendQueue<T> {
    /// Entries with sequence at or after `ack`, in order.
    pub fn from_ack(&self, ack: u32) -> Vec<ResendEntry<T>> {
        self.entries
            .iter()
            .filter(|e| !seq_less(e.seq, ack))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(seqs: &[u32]) -> ResendQueue<&'static str> {
        let mut q = ResendQueue::new();
        for &s in seqs {
            q.push(s, "msg");
        }
        q
    }

    #[test]
    fn test_prune_keeps_entry_equal_to_ack() {
        let mut q = queue(&[5, 6, 7, 8]);
        assert_eq!(q.prune(7), 2);
        assert_eq!(q.sequences().collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_prune_past_everything() {
        let mut q = queue(&[5, 6]);
        assert_eq!(q.prune(9), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_prune_across_wraparound() {
        let mut q = queue(&[u32::MAX - 1, u32::MAX, 0, 1]);
        q.prune(0);
        assert_eq!(q.sequences().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_from_ack_in_order() {
        let q = queue(&[10, 11, 12]);
        let seqs: Vec<_> = q.from_ack(11).into_iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![11, 12]);
        assert_eq!(q.len(), 3);
    }
}
