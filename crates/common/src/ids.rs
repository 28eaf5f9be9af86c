//! Type-safe identifier newtypes for AutoCert.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of a certificate's stable identity with the opaque
//! provider token that correlates webhook deliveries to a renewal attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable certificate identity.
///
/// Usually a logical name (`api.example.com`) or subject plus serial. An
/// identity is never reused once a record has been created for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateId(String);

impl CertificateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendition of the identity.
    ///
    /// Every byte outside `[A-Za-z0-9._-]` is hex-escaped as `%XX`, so two
    /// distinct identities never map to the same file name.
    pub fn to_file_stem(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                    out.push(byte as char)
                }
                _ => out.push_str(&format!("%{:02X}", byte)),
            }
        }
        // "." and ".." are not usable file names
        if out.chars().all(|c| c == '.') {
            out = out.replace('.', "%2E");
        }
        out
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CertificateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CertificateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque correlation token shared with the certificate provider.
///
/// A fresh token is generated for every renewal attempt. Webhook events carry
/// the token back, which is how a delivery is matched to the attempt that
/// caused it (and how deliveries for superseded attempts are recognized).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderRef(String);

impl ProviderRef {
    /// Generate a new random provider reference
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_id() {
        let id = CertificateId::new("api.example.com");
        assert_eq!(id.as_str(), "api.example.com");
        assert_eq!(id.to_string(), "api.example.com");
    }

    #[test]
    fn test_provider_ref_generate_is_unique() {
        let a = ProviderRef::generate();
        let b = ProviderRef::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_file_stem_plain_name_unchanged() {
        let id = CertificateId::new("www.example.com");
        assert_eq!(id.to_file_stem(), "www.example.com");
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        let id = CertificateId::new("CN=api/serial 01");
        assert_eq!(id.to_file_stem(), "CN%3Dapi%2Fserial%2001");
    }

    #[test]
    fn test_file_stem_dot_names() {
        assert_eq!(CertificateId::new("..").to_file_stem(), "%2E%2E");
    }

    #[test]
    fn test_serde_transparent() {
        let id = CertificateId::new("a.com");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"a.com\"");
    }

    proptest::proptest! {
        #[test]
        fn prop_file_stem_is_injective(a in ".{0,16}", b in ".{0,16}") {
            let sa = CertificateId::new(a.clone()).to_file_stem();
            let sb = CertificateId::new(b.clone()).to_file_stem();
            proptest::prop_assert_eq!(a == b, sa == sb);
        }
    }
}
