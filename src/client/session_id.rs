//! Server-assigned session identity.

use std::fmt;

/// Session id assigned by the server. Empty means no session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a server-provided id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether a session is established.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Forget the id.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let mut id = SessionId::new("a1b2");
        assert!(id.is_valid());
        assert_eq!(id.to_string(), "a1b2");
        id.clear();
        assert!(!id.is_valid());
        assert_eq!(id, SessionId::default());
    }
}
