//! Tick-driven timers.

use std::fmt;

use tracing::debug;

type TimeoutFn = Box<dyn FnMut(&str)>;

struct PendingReply {
    reply_type: String,
    remaining: f32,
    on_timeout: Option<TimeoutFn>,
}

/// Watchdogs for expected replies, one per registration.
#[derive(Default)]
pub struct PendingReplies {
    entries: Vec<PendingReply>,
}

impl PendingReplies {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `reply_type` within `timeout` seconds.
    ///
    /// Without a callback of its own, an expiry is reported through the
    /// fallback passed to [`tick`](Self::tick).
    pub fn register(
        &mut self,
        reply_type: impl Into<String>,
        timeout: f32,
        on_timeout: Option<TimeoutFn>,
    ) {
        self.entries.push(PendingReply {
            reply_type: reply_type.into(),
            remaining: timeout,
            on_timeout,
        });
    }

    /// A reply arrived; cancels the oldest registration for it.
    pub fn cancel(&mut self, reply_type: &str) -> bool {
        match self.entries.iter().position(|e| e.reply_type == reply_type) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Advance every timer, firing and removing expired ones.
    pub fn tick(&mut self, delta: f32, fallback: &mut dyn FnMut(&str)) {
        for entry in &mut self.entries {
            entry.remaining -= delta;
        }
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.remaining <= 0.0);
        self.entries = live;

        for mut entry in expired {
            debug!(reply_type = %entry.reply_type, "reply timed out");
            match entry.on_timeout.as_mut() {
                Some(callback) => callback(&entry.reply_type),
                None => fallback(&entry.reply_type),
            }
        }
    }

    /// Number of outstanding registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration without firing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.reply_type, e.remaining)))
            .finish()
    }
}

/// Time since the last batch of inbound messages.
#[derive(Debug, Clone, Default)]
pub struct ResponseTimer {
    threshold: f32,
    elapsed: f32,
}

impl ResponseTimer {
    /// A timer expiring after `threshold` seconds; zero disables it.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            elapsed: 0.0,
        }
    }

    /// Something arrived.
    pub fn reset(&mut self) {
        self.elapsed = 0.0;
    }

    /// Advance; true once the threshold is exceeded.
    pub fn tick(&mut self, delta: f32) -> bool {
        if self.threshold <= 0.0 {
            return false;
        }
        self.elapsed += delta;
        self.elapsed > self.threshold
    }
}
