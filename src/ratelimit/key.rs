//! Client key construction and handling.

use super::technique::Technique;

/// A key that uniquely identifies a rate-limited subject.
///
/// Keys are supplied by the caller and never generated internally. By
/// convention the technique name is prefixed to the client origin, so the
/// four limiters never collide in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Wrap an already-built key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build the conventional `"{technique}:{origin}"` key.
    pub fn for_origin(technique: Technique, origin: &str) -> Self {
        Self(format!("{}:{}", technique, origin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A store key scoped under this client, e.g. `"{key}:tokens"`.
    pub fn derived(&self, suffix: &str) -> String {
        format!("{}:{}", self.0, suffix)
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ClientKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
