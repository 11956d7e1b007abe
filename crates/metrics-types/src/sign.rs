//! Keyed integrity digest over request bodies.
//!
//! Both sides compute HMAC-SHA256 over the exact JSON bytes of the body before
//! any transport compression, and exchange it lower-hex encoded in the
//! [`HASH_HEADER`] header.

use core::error::Error;
use core::fmt;

use error_stack::Report;
use error_stack::ResultExt;
use ring::hmac;

/// Header carrying the hex digest of the body.
pub const HASH_HEADER: &str = "HashSHA256";

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SignError {
    #[display("Digest is not valid hex")]
    MalformedDigest,
    #[display("Digest does not match body")]
    Mismatch,
}

impl Error for SignError {}

/// Lower-hex HMAC-SHA256 of `body` under `key`.
pub fn sign(body: &[u8], key: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hex::encode(hmac::sign(&key, body).as_ref())
}

/// Signs and verifies with an optional shared secret.
///
/// Without a key every operation is a no-op: nothing is signed and every body
/// verifies.
#[derive(Clone, Default)]
pub struct Signer {
    key: Option<hmac::Key>,
}

impl Signer {
    /// Blank keys count as "no key configured".
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key
                .filter(|k| !k.is_empty())
                .map(|k| hmac::Key::new(hmac::HMAC_SHA256, k.as_bytes())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn sign(&self, body: &[u8]) -> Option<String> {
        self.key
            .as_ref()
            .map(|key| hex::encode(hmac::sign(key, body).as_ref()))
    }

    /// Checks `digest` against `body`. A missing digest is accepted.
    ///
    /// # Errors
    ///
    /// - [`SignError::MalformedDigest`] if `digest` is not hex
    /// - [`SignError::Mismatch`] if the digest was computed over other bytes or
    ///   with another key
    pub fn verify(&self, body: &[u8], digest: Option<&str>) -> Result<(), Report<SignError>> {
        let (Some(key), Some(digest)) = (&self.key, digest) else {
            return Ok(());
        };
        let tag = hex::decode(digest.trim())
            .change_context(SignError::MalformedDigest)
            .attach_printable_lazy(|| format!("digest: {digest}"))?;
        hmac::verify(key, body, &tag).map_err(|_| Report::new(SignError::Mismatch))
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn matches_rfc4231_vector() {
        assert_eq!(
            sign(b"what do ya want for nothing?", b"Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn digest_is_deterministic_and_key_dependent() {
        let body = br#"[{"id":"Alloc","type":"gauge","value":1.5}]"#;
        assert_eq!(sign(body, b"k1"), sign(body, b"k1"));
        assert_ne!(sign(body, b"k1"), sign(body, b"k2"));
    }

    #[test]
    fn signer_without_key_is_noop() {
        let signer = Signer::new(None);
        assert!(!signer.is_enabled());
        assert_eq!(signer.sign(b"body"), None);
        assert!(signer.verify(b"body", Some("zz")).is_ok());

        assert!(!Signer::new(Some("")).is_enabled());
    }

    #[test]
    fn signer_round_trip() {
        let signer = Signer::new(Some("secret"));
        let digest = signer.sign(b"payload").expect("key configured");
        assert_eq!(digest, sign(b"payload", b"secret"));
        assert!(signer.verify(b"payload", Some(&digest)).is_ok());
        assert!(signer.verify(b"payload", None).is_ok());
    }

    #[test]
    fn signer_rejects_tampering() {
        let signer = Signer::new(Some("secret"));
        let digest = signer.sign(b"payload").expect("key configured");

        let err = signer
            .verify(b"payload!", Some(&digest))
            .expect_err("tampered body");
        assert_eq!(err.current_context(), &SignError::Mismatch);

        let err = signer
            .verify(b"payload", Some("not-hex"))
            .expect_err("malformed digest");
        assert_eq!(err.current_context(), &SignError::MalformedDigest);
    }
}
