//! Signing capability consumed by the codec and the inbound path.
//!
//! Key management lives outside the bus; only the sign and verify
//! operations are used here.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _};
use rand::rngs::OsRng;

use crate::error::BusError;
use crate::protocol::PeerId;

/// Produces signatures over serialized payloads.
pub trait Signer: Send + Sync {
    /// Signs `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying key cannot sign.
    fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, BusError>;

    /// The peer whose key produces the signatures.
    fn peer_id(&self) -> PeerId;
}

/// Checks signatures against the claimed creator of a payload.
pub trait Verifier: Send + Sync {
    /// Verifies `signature` over `bytes` for `creator`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Signature`] if the signature does not verify.
    fn verify(&self, creator: &PeerId, bytes: &[u8], signature: &[u8]) -> Result<(), BusError>;
}

/// Ed25519 signer with a self-certifying peer id.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Wraps an existing signing key.
    #[must_use]
    pub const fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, BusError> {
        Ok(self.key.sign(bytes).to_bytes().to_vec())
    }

    fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.key.verifying_key())
    }
}

/// Verifies Ed25519 signatures using the key embedded in the creator's id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, creator: &PeerId, bytes: &[u8], signature: &[u8]) -> Result<(), BusError> {
        let key = creator.to_verifying_key().ok_or_else(|| {
            BusError::Signature(format!("creator {creator} is not a public key id"))
        })?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| BusError::Signature(format!("malformed signature: {e}")))?;
        key.verify(bytes, &signature)
            .map_err(|e| BusError::Signature(format!("verification failed: {e}")))
    }
}
