//! Sequence and acknowledgment bookkeeping.
//!
//! Every message sent over a reliable protocol is stamped with the next
//! sequence number and kept in a [`ResendQueue`] until the peer acknowledges
//! it with `ack = seq + 1`. Inbound sequences must arrive without gaps:
//!
//! ```text
//! last = 4:   5 -> accepted, ack 6
//!             4 -> skipped (duplicate)
//!             7 -> violation, transport closed
//! ```

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use super::redirect::RedirectQueue;
use super::resend::{ResendEntry, ResendQueue};
use super::seq::{SequenceCounter, seq_less};
use crate::core::Protocol;

/// Outcome of checking an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next in order. `ack` is set when an acknowledgment is due now.
    Accepted {
        /// Acknowledgment to send immediately.
        ack: Option<u32>,
    },
    /// Already delivered; drop silently.
    Skipped,
    /// A gap: the transport must be closed.
    Violation {
        /// The sequence that would have been accepted.
        expected: u32,
        /// The sequence that arrived.
        received: u32,
    },
}

impl SequenceCheck {
    /// Whether the message should be delivered.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SequenceCheck::Accepted { .. })
    }
}

/// Reliability state of one protocol.
#[derive(Debug, Clone)]
pub struct ChannelReliability<T> {
    counter: SequenceCounter,
    last_received: Option<u32>,
    sent_ack: u32,
    resend: ResendQueue<T>,
    unsent: VecDeque<T>,
    wait_for_ack: bool,
    delayed_ack_interval: f32,
    ack_timer: f32,
}

impl<T> ChannelReliability<T> {
    /// Create with a random sequence base.
    ///
    /// A positive `delayed_ack_interval` batches acknowledgments.
    pub fn new(delayed_ack_interval: f32) -> Self {
        Self::with_counter(SequenceCounter::random(), delayed_ack_interval)
    }

    /// Create with a specific counter.
    pub fn with_counter(counter: SequenceCounter, delayed_ack_interval: f32) -> Self {
        Self {
            counter,
            last_received: None,
            sent_ack: 0,
            resend: ResendQueue::new(),
            unsent: VecDeque::new(),
            wait_for_ack: false,
            delayed_ack_interval,
            ack_timer: 0.0,
        }
    }

    /// Stamp the next outbound sequence.
    pub fn next_sequence(&mut self) -> u32 {
        self.counter.next()
    }

    /// The last inbound sequence accepted.
    pub fn last_received(&self) -> Option<u32> {
        self.last_received
    }

    /// Keep a sent message until it is acknowledged.
    pub fn record_sent(&mut self, seq: u32, item: T) {
        trace!(seq, "awaiting ack");
        self.resend.push(seq, item);
    }

    /// Messages awaiting acknowledgment.
    pub fn resend_queue(&self) -> &ResendQueue<T> {
        &self.resend
    }

    /// Whether the channel waits for the peer's ack before sending.
    pub fn is_waiting_for_ack(&self) -> bool {
        self.wait_for_ack
    }

    /// Enter the wait-for-ack state after a reconnect.
    ///
    /// Returns the ack to announce, if anything was received before.
    pub fn begin_wait_for_ack(&mut self) -> Option<u32> {
        self.wait_for_ack = true;
        let ack = self.last_received.map(|s| s.wrapping_add(1));
        if let Some(ack) = ack {
            self.sent_ack = ack;
        }
        ack
    }

    /// Leave the wait-for-ack state without an ack.
    pub fn end_wait_for_ack(&mut self) {
        self.wait_for_ack = false;
    }

    /// Check an inbound sequence.
    pub fn on_sequence_received(&mut self, seq: u32) -> SequenceCheck {
        if let Some(last) = self.last_received {
            if !seq_less(last, seq) {
                warn!(seq, last, "skipping duplicate sequence");
                return SequenceCheck::Skipped;
            }
            let expected = last.wrapping_add(1);
            if seq != expected {
                warn!(seq, expected, "sequence gap");
                return SequenceCheck::Violation {
                    expected,
                    received: seq,
                };
            }
        }

        self.last_received = Some(seq);
        let ack = seq.wrapping_add(1);
        if self.delayed_ack_interval > 0.0 {
            return SequenceCheck::Accepted { ack: None };
        }
        self.sent_ack = ack;
        SequenceCheck::Accepted { ack: Some(ack) }
    }

    /// Advance the delayed-ack timer; returns an ack when one is due.
    pub fn tick(&mut self, delta: f32) -> Option<u32> {
        if self.delayed_ack_interval <= 0.0 {
            return None;
        }
        self.ack_timer += delta;
        if self.ack_timer < self.delayed_ack_interval {
            return None;
        }
        self.ack_timer = 0.0;

        let ack = self.last_received?.wrapping_add(1);
        if seq_less(self.sent_ack, ack) {
            self.sent_ack = ack;
            debug!(ack, "sending delayed ack");
            Some(ack)
        } else {
            None
        }
    }

    /// Claim the ack still owed to the peer so it can ride on an outgoing
    /// message. The delayed-ack timer then has nothing left to send.
    pub fn take_pending_ack(&mut self) -> Option<u32> {
        let ack = self.last_received?.wrapping_add(1);
        if !seq_less(self.sent_ack, ack) {
            return None;
        }
        self.sent_ack = ack;
        self.ack_timer = 0.0;
        Some(ack)
    }

    /// Hold a message until the transport connects.
    pub fn queue_unsent(&mut self, item: T) {
        self.unsent.push_back(item);
    }

    /// Take the held messages, in order.
    pub fn take_unsent(&mut self) -> Vec<T> {
        self.unsent.drain(..).collect()
    }

    /// Number of held messages.
    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Move unacknowledged then unsent messages into a redirect queue.
    pub fn begin_redirect(&mut self) -> RedirectQueue<T> {
        let mut queue = RedirectQueue::from_items(self.resend.drain().map(|e| e.item));
        queue.extend(self.unsent.drain(..));
        queue
    }

    /// A session id was assigned: a new random base and no receive
    /// history. Messages held until connect are kept.
    pub fn establish(&mut self) {
        self.counter.reseed();
        self.last_received = None;
        self.sent_ack = 0;
        self.resend.clear();
        self.wait_for_ack = false;
        self.ack_timer = 0.0;
    }

    /// Forget the session: a new random base and empty queues.
    pub fn reset(&mut self) {
        self.counter.reseed();
        self.last_received = None;
        self.sent_ack = 0;
        self.resend.clear();
        self.unsent.clear();
        self.wait_for_ack = false;
        self.ack_timer = 0.0;
    }
}

impl<T: Clone> ChannelReliability<T> {
    /// Process an inbound ack.
    ///
    /// Prunes acknowledged entries. In the wait-for-ack state, returns the
    /// remaining entries from `ack` onward for retransmission and leaves it.
    pub fn on_ack(&mut self, ack: u32) -> Vec<ResendEntry<T>> {
        let pruned = self.resend.prune(ack);
        trace!(ack, pruned, "ack received");
        if !self.wait_for_ack {
            return Vec::new();
        }
        self.wait_for_ack = false;
        let resend = self.resend.from_ack(ack);
        if !resend.is_empty() {
            debug!(ack, count = resend.len(), "resending unacknowledged messages");
        }
        resend
    }
}

/// Reliability state for every protocol of a session.
#[derive(Debug, Clone)]
pub struct ReliabilitySession<T> {
    channels: BTreeMap<Protocol, ChannelReliability<T>>,
}

impl<T> Default for ReliabilitySession<T> {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
        }
    }
}

impl<T> ReliabilitySession<T> {
    /// Create with no protocols.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol.
    pub fn add_protocol(&mut self, protocol: Protocol, delayed_ack_interval: f32) {
        self.channels
            .entry(protocol)
            .or_insert_with(|| ChannelReliability::new(delayed_ack_interval));
    }

    /// State of one protocol.
    pub fn channel(&self, protocol: Protocol) -> Option<&ChannelReliability<T>> {
        self.channels.get(&protocol)
    }

    /// Mutable state of one protocol.
    pub fn channel_mut(&mut self, protocol: Protocol) -> Option<&mut ChannelReliability<T>> {
        self.channels.get_mut(&protocol)
    }

    /// Stamp the next outbound sequence for `protocol`.
    pub fn next_sequence(&mut self, protocol: Protocol) -> Option<u32> {
        self.channels.get_mut(&protocol).map(|c| c.next_sequence())
    }

    /// Check an inbound sequence for `protocol`.
    pub fn on_sequence_received(&mut self, protocol: Protocol, seq: u32) -> SequenceCheck {
        match self.channels.get_mut(&protocol) {
            Some(channel) => channel.on_sequence_received(seq),
            None => SequenceCheck::Accepted { ack: None },
        }
    }

    /// Snapshot `protocol`'s unsent and unacknowledged messages.
    pub fn begin_redirect(&mut self, protocol: Protocol) -> RedirectQueue<T> {
        self.channels
            .get_mut(&protocol)
            .map(ChannelReliability::begin_redirect)
            .unwrap_or_default()
    }

    /// Establish every protocol; see [`ChannelReliability::establish`].
    pub fn establish(&mut self) {
        for channel in self.channels.values_mut() {
            channel.establish();
        }
    }

    /// Reset every protocol.
    pub fn reset(&mut self) {
        for channel in self.channels.values_mut() {
            channel.reset();
        }
    }
}

impl<T: Clone> ReliabilitySession<T> {
    /// Process an inbound ack for `protocol`; see [`ChannelReliability::on_ack`].
    pub fn on_ack(&mut self, protocol: Protocol, ack: u32) -> Vec<ResendEntry<T>> {
        self.channels
            .get_mut(&protocol)
            .map(|c| c.on_ack(ack))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn channel() -> ChannelReliability<u32> {
        ChannelReliability::with_counter(SequenceCounter::starting_at(4), 0.0)
    }

    #[test]
    fn test_in_order_sequences_accepted() {
        let mut c = channel();
        for seq in 1..=10 {
            assert_eq!(
                c.on_sequence_received(seq),
                SequenceCheck::Accepted { ack: Some(seq + 1) }
            );
        }
        assert_eq!(c.last_received(), Some(10));
    }

    #[test]
    fn test_gap_is_violation() {
        let mut c = channel();
        c.on_sequence_received(3);
        assert_eq!(
            c.on_sequence_received(5),
            SequenceCheck::Violation {
                expected: 4,
                received: 5
            }
        );
        assert_eq!(c.last_received(), Some(3));
    }

    #[test]
    fn test_duplicate_and_earlier_skipped() {
        let mut c = channel();
        c.on_sequence_received(7);
        c.on_sequence_received(8);
        assert_eq!(c.on_sequence_received(8), SequenceCheck::Skipped);
        assert_eq!(c.on_sequence_received(2), SequenceCheck::Skipped);
        assert!(c.on_sequence_received(9).is_accepted());
    }

    #[test]
    fn test_first_sequence_accepted_anywhere() {
        let mut c = channel();
        assert!(c.on_sequence_received(u32::MAX).is_accepted());
        assert!(c.on_sequence_received(0).is_accepted());
    }

    #[test]
    fn test_ack_prunes_without_resend() {
        let mut c = channel();
        for seq in 5..=8 {
            c.record_sent(seq, seq * 10);
        }
        assert!(c.on_ack(7).is_empty());
        assert_eq!(c.resend_queue().sequences().collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_ack_in_wait_state_resends_in_order() {
        let mut c = channel();
        for seq in 5..=8 {
            c.record_sent(seq, seq * 10);
        }
        c.on_sequence_received(41);
        assert_eq!(c.begin_wait_for_ack(), Some(42));

        let resend = c.on_ack(6);
        assert_eq!(resend.iter().map(|e| e.item).collect::<Vec<_>>(), vec![60, 70, 80]);
        assert!(!c.is_waiting_for_ack());
        // Still unacknowledged: kept for the next reconnect.
        assert_eq!(c.resend_queue().len(), 3);
    }

    #[test]
    fn test_wait_for_ack_without_history() {
        let mut c = channel();
        assert_eq!(c.begin_wait_for_ack(), None);
        assert!(c.is_waiting_for_ack());
    }

    #[test]
    fn test_delayed_ack() {
        let mut c = ChannelReliability::<u32>::with_counter(SequenceCounter::starting_at(0), 0.5);
        assert_eq!(c.on_sequence_received(1), SequenceCheck::Accepted { ack: None });
        assert_eq!(c.on_sequence_received(2), SequenceCheck::Accepted { ack: None });

        assert_eq!(c.tick(0.3), None);
        assert_eq!(c.tick(0.3), Some(3));
        // Nothing new since.
        assert_eq!(c.tick(0.6), None);

        c.on_sequence_received(3);
        assert_eq!(c.tick(0.6), Some(4));
    }

    #[test]
    fn test_pending_ack_claimed_once() {
        let mut c = ChannelReliability::<u32>::with_counter(SequenceCounter::starting_at(0), 0.5);
        assert_eq!(c.take_pending_ack(), None);
        c.on_sequence_received(20);
        c.on_sequence_received(21);

        assert_eq!(c.take_pending_ack(), Some(22));
        assert_eq!(c.take_pending_ack(), None);
        // Already carried: the timer has nothing to send.
        assert_eq!(c.tick(1.0), None);

        c.on_sequence_received(22);
        assert_eq!(c.take_pending_ack(), Some(23));
    }

    #[test]
    fn test_begin_redirect_snapshot_order() {
        let mut c = channel();
        c.record_sent(5, 1);
        c.record_sent(6, 2);
        c.queue_unsent(3);
        let queue = c.begin_redirect();
        assert_eq!(queue.into_replay(), vec![1, 2, 3]);
        assert!(c.resend_queue().is_empty());
        assert_eq!(c.unsent_len(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut c = channel();
        c.record_sent(5, 1);
        c.queue_unsent(2);
        c.on_sequence_received(9);
        c.reset();
        assert_eq!(c.last_received(), None);
        assert!(c.resend_queue().is_empty());
        assert_eq!(c.unsent_len(), 0);
        assert!(c.on_sequence_received(100).is_accepted());
    }

    #[test]
    fn test_establish_keeps_unsent() {
        let mut c = channel();
        c.record_sent(5, 1);
        c.queue_unsent(2);
        c.on_sequence_received(9);
        c.establish();
        assert_eq!(c.last_received(), None);
        assert!(c.resend_queue().is_empty());
        assert_eq!(c.take_unsent(), vec![2]);
    }

    #[test]
    fn test_session_routes_by_protocol() {
        let mut session = ReliabilitySession::<u32>::new();
        session.add_protocol(Protocol::Tcp, 0.0);
        assert!(session.next_sequence(Protocol::Tcp).is_some());
        assert!(session.next_sequence(Protocol::Udp).is_none());

        session.on_sequence_received(Protocol::Tcp, 1);
        assert!(!session.on_sequence_received(Protocol::Tcp, 3).is_accepted());
        assert!(session.on_ack(Protocol::Http, 1).is_empty());
    }

    proptest! {
        #[test]
        fn prop_run_then_gap(start: u32, k in 1u32..200) {
            let mut c = channel();
            for i in 0..k {
                prop_assert!(c.on_sequence_received(start.wrapping_add(i)).is_accepted());
            }
            let last = start.wrapping_add(k - 1);
            prop_assert_eq!(c.last_received(), Some(last));

            let gap = c.on_sequence_received(last.wrapping_add(2));
            let is_violation = matches!(gap, SequenceCheck::Violation { .. });
            prop_assert!(is_violation);
            if k > 1 {
                prop_assert_eq!(c.on_sequence_received(last.wrapping_sub(1)), SequenceCheck::Skipped);
            }
        }

        #[test]
        fn prop_ack_prunes_strictly_less(base: u32, n in 1u32..50, off in 0u32..60) {
            let mut c = channel();
            for i in 0..n {
                c.record_sent(base.wrapping_add(i), i);
            }
            let ack = base.wrapping_add(off);
            c.on_ack(ack);
            for seq in c.resend_queue().sequences() {
                prop_assert!(!seq_less(seq, ack));
            }
            prop_assert_eq!(c.resend_queue().len() as u32, n.saturating_sub(off));
        }
    }
}
