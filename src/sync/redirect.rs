//! Messages carried over a server redirect.

/// A message captured when a redirect began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry<T> {
    /// The message.
    pub item: T,
    /// Set by the redirect policy to drop the message instead of replaying it.
    pub discard: bool,
}

/// Unsent and unacknowledged messages snapshotted at the start of a redirect.
///
/// After the new server accepts the session, non-discarded entries are
/// replayed in their original order with fresh sequence numbers.
#[derive(Debug, Clone)]
pub struct RedirectQueue<T> {
    entries: Vec<RedirectEntry<T>>,
}

impl<T> Default for RedirectQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> RedirectQueue<T> {
    /// Build from messages in send order.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            entries: items
                .into_iter()
                .map(|item| RedirectEntry {
                    item,
                    discard: false,
                })
                .collect(),
        }
    }

    /// Append more messages.
    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.entries
            .extend(items.into_iter().map(|item| RedirectEntry {
                item,
                discard: false,
            }));
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &RedirectEntry<T>> {
        self.entries.iter()
    }

    /// Mutable entries, for a policy that sets `discard`.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RedirectEntry<T>> {
        self.entries.iter_mut()
    }

    /// Mark entries for which `discard` returns true.
    pub fn discard_if(&mut self, mut discard: impl FnMut(&T) -> bool) {
        for entry in &mut self.entries {
            if discard(&entry.item) {
                entry.discard = true;
            }
        }
    }

    /// Number of entries, discarded or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The messages to replay, in order.
    pub fn into_replay(self) -> Vec<T> {
        self.entries
            .into_iter()
            .filter(|e| !e.discard)
            .map(|e| e.item)
            .collect()
    }
}
