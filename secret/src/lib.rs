//! Credentials that must not leak into logs.

use std::{borrow::Cow, fmt, ops::Deref};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

/// A password, signing key, webhook secret or any other semi-secret value.
///
/// The wrapper keeps the value out of `Debug` output and zeroes owned
/// storage on drop. Use [`Secret::revealed`] to get at the value.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

/// Tiny wrapper struct to indicate that the inner object should
/// be directly printed in fmt::Debug implementations.
struct DirectDebug<D>(D);

impl<D> fmt::Debug for DirectDebug<D>
where
    D: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&DirectDebug("****")).finish()
    }
}

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// Whether the secret is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode a base64 encoded secret, such as a PEM key passed through an
    /// environment variable. Surrounding whitespace is ignored.
    pub fn decode_base64(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.revealed().trim())
    }

    /// Hex encoded HMAC-SHA256 of `payload`, keyed by this secret.
    pub fn sign_sha256(&self, payload: &[u8]) -> String {
        // HMAC accepts keys of any length.
        let mut mac = Hmac::<Sha256>::new_from_slice(self.revealed().as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check an HMAC-SHA256 hex signature in constant time.
    pub fn verify_sha256(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.revealed().as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }
}

impl From<Cow<'static, str>> for Secret {
    fn from(inner: Cow<'static, str>) -> Self {
        Secret(inner)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn secret_hidden_debug() {
        let key = "secret garden";
        let secret = Secret::from(key);

        assert!(!format!("{secret:?}").contains("secret garden"));
        assert_eq!(&format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.revealed(), key);
    }

    #[test]
    fn hmac_signature() {
        // RFC 4231 test case 2.
        let secret = Secret::from("Jefe");
        let signature = secret.sign_sha256(b"what do ya want for nothing?");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(secret.verify_sha256(b"what do ya want for nothing?", &signature));
        assert!(!secret.verify_sha256(b"something else", &signature));
    }

    #[test]
    fn base64_decoding() {
        let secret: Secret = serde_json::from_str("\" aGVsbG8=\\n\"").unwrap();
        assert_eq!(secret.decode_base64().unwrap(), b"hello");
    }
}
