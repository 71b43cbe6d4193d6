//! Reconnect backoff.

use crate::core::{RECONNECT_INITIAL_DELAY_SECS, RECONNECT_MAX_DELAY_SECS};

/// Exponential reconnect backoff: 1, 2, 4, 8, 8, ... seconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    attempts: u32,
    remaining_delay: Option<f32>,
}

impl Backoff {
    /// Allow up to `max_attempts` reconnects.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            remaining_delay: None,
        }
    }

    /// Schedule the next attempt; returns its number and delay, or `None`
    /// once the attempts are used up.
    pub fn schedule(&mut self) -> Option<(u32, f32)> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = (RECONNECT_INITIAL_DELAY_SECS * 2f32.powi(self.attempts.min(16) as i32))
            .min(RECONNECT_MAX_DELAY_SECS);
        self.attempts += 1;
        self.remaining_delay = Some(delay);
        Some((self.attempts, delay))
    }

    /// Advance the delay; true when the scheduled attempt is due.
    pub fn tick(&mut self, delta: f32) -> bool {
        let Some(remaining) = self.remaining_delay.as_mut() else {
            return false;
        };
        *remaining -= delta;
        if *remaining <= 0.0 {
            self.remaining_delay = None;
            true
        } else {
            false
        }
    }

    /// An attempt is scheduled.
    pub fn is_pending(&self) -> bool {
        self.remaining_delay.is_some()
    }

    /// Connected: start over.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.remaining_delay = None;
    }

    /// Drop a scheduled attempt, keeping the count.
    pub fn cancel(&mut self) {
        self.remaining_delay = None;
    }
}
