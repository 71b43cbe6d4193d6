//! Serial-number arithmetic for 32-bit sequence numbers.

/// Wraparound-aware `x < y`.
///
/// True when `y` is ahead of `x` by less than half the sequence space.
#[inline]
pub fn seq_less(x: u32, y: u32) -> bool {
    (y.wrapping_sub(x) as i32) > 0
}

/// Outbound sequence counter.
///
/// Starts from a random base so that sequences from consecutive sessions
/// do not collide.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    current: u32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::random()
    }
}

impl SequenceCounter {
    /// A counter starting at a random base.
    pub fn random() -> Self {
        Self::starting_at(rand::random())
    }

    /// A counter whose first [`next`](Self::next) returns `base + 1`.
    pub fn starting_at(base: u32) -> Self {
        Self { current: base }
    }

    /// Pick a new random base.
    pub fn reseed(&mut self) {
        self.current = rand::random();
    }

    /// Increment and return.
    pub fn next(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        self.current
    }

    /// The last value returned.
    pub fn current(&self) -> u32 {
        self.current
    }
}
