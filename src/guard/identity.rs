//! Identity key fingerprinting.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// Store key that identifies one tracked identity.
///
/// The key is a SHA-256 fingerprint over the non-empty parts, in order.
/// Each part is digested on its own before the fixed-width digests are
/// hashed together, so part boundaries can never be confused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Fingerprint an ordered list of optional parts.
    ///
    /// Absent and empty parts are skipped and do not affect the result.
    pub fn fingerprint<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let mut outer = Sha256::new();
        for part in parts.into_iter().flatten().filter(|p| !p.is_empty()) {
            outer.update(Sha256::digest(part.as_bytes()));
        }
        Self(BASE64.encode(outer.finalize()))
    }

    /// Key for one limiter, optionally scoped to a network identity.
    pub fn for_attempt(
        network_identity: Option<&str>,
        limiter_name: &str,
        sub_key: Option<&str>,
    ) -> Self {
        Self::fingerprint([network_identity, Some(limiter_name), sub_key])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
