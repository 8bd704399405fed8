//! Private-key capabilities used to sign device responses and key-binding
//! tokens.

use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("private key is invalid or unavailable: {0}")]
    Key(String),
    #[error("signing primitive failed: {0}")]
    Primitive(String),
}

/// A handle to a presentation private key.
///
/// The key may be software-held or live behind a hardware keystore; the
/// engine only ever asks the handle to sign and never observes key
/// material. The call blocks until a signature is produced or fails;
/// implementations that gate signing on user confirmation resolve that
/// before returning.
pub trait CredentialSigner {
    /// Signs `payload` with ECDSA P-256 over SHA-256, returning the
    /// DER-encoded signature.
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Software-held P-256 key.
#[derive(Clone)]
pub struct SoftwareSigner {
    key: SigningKey,
}

impl SoftwareSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Loads a device key from an unencrypted PKCS#8 DER document, the form
    /// credential databases hand out.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, SigningError> {
        SigningKey::from_pkcs8_der(der)
            .map(Self::new)
            .map_err(|e| SigningError::Key(e.to_string()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

impl fmt::Debug for SoftwareSigner {
    // Never expose key material through Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareSigner").finish_non_exhaustive()
    }
}

impl CredentialSigner for SoftwareSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SigningError> {
        let signature: Signature = self
            .key
            .try_sign(payload)
            .map_err(|e| SigningError::Primitive(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::pkcs8::EncodePrivateKey;

    #[test]
    fn signatures_verify_under_the_public_key() {
        let signer = SoftwareSigner::new(SigningKey::random(&mut rand::rngs::OsRng));
        let der = signer.sign(b"session transcript").unwrap();
        let signature = Signature::from_der(&der).unwrap();
        signer
            .verifying_key()
            .verify(b"session transcript", &signature)
            .unwrap();
    }

    #[test]
    fn loads_pkcs8_device_keys() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let document = key.to_pkcs8_der().unwrap();
        let signer = SoftwareSigner::from_pkcs8_der(document.as_bytes()).unwrap();
        assert_eq!(signer.verifying_key(), *key.verifying_key());

        assert!(matches!(
            SoftwareSigner::from_pkcs8_der(b"not a key"),
            Err(SigningError::Key(_))
        ));
    }
}
