use cask_types::EnvelopeId;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation. Envelope identities and reserved schema identities live in
/// different domains, so no user envelope can ever hash onto a reserved id.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for envelope canonical bytes.
    pub const ENVELOPE: Self = Self {
        domain: "cask-envelope-v1",
    };
    /// Hasher for built-in reserved identities (tombstone schema, ...).
    pub const RESERVED: Self = Self {
        domain: "cask-reserved-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> EnvelopeId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        EnvelopeId::from_hash(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected identity.
    pub fn verify(&self, data: &[u8], expected: &EnvelopeId) -> bool {
        self.hash(data) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"canonical bytes";
        assert_eq!(ContentHasher::ENVELOPE.hash(data), ContentHasher::ENVELOPE.hash(data));
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let data = b"tombstone";
        assert_ne!(
            ContentHasher::ENVELOPE.hash(data),
            ContentHasher::RESERVED.hash(data)
        );
    }

    #[test]
    fn different_data_produces_different_hashes() {
        assert_ne!(
            ContentHasher::ENVELOPE.hash(b"hello"),
            ContentHasher::ENVELOPE.hash(b"world")
        );
    }

    #[test]
    fn verify_detects_tampering() {
        let id = ContentHasher::ENVELOPE.hash(b"original");
        assert!(ContentHasher::ENVELOPE.verify(b"original", &id));
        assert!(!ContentHasher::ENVELOPE.verify(b"tampered", &id));
    }

    #[test]
    fn custom_domain() {
        let hasher = ContentHasher::new("my-custom-domain-v1");
        assert_eq!(hasher.domain(), "my-custom-domain-v1");
        assert_ne!(hasher.hash(b"data"), ContentHasher::ENVELOPE.hash(b"data"));
    }

    #[test]
    fn hash_is_never_null_for_empty_input() {
        assert!(!ContentHasher::ENVELOPE.hash(b"").is_null());
    }
}
