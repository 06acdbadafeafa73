//! Identifiers shared by every layer of the bus.
//!
//! - [`PeerId`]: textual identifier of a peer, as resolved by the transport
//! - [`ProtocolId`]: name a stream handler is registered under

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a peer in the network.
///
/// Peer ids are opaque strings to the bus. Ids produced by
/// [`PeerId::from_public_key`] are self-certifying: they are the base58 form
/// of an Ed25519 verifying key and can be turned back into that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a self-certifying `PeerId` from an Ed25519 public key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(bs58::encode(key.as_bytes()).into_string())
    }

    /// Recovers the verifying key for a self-certifying id.
    ///
    /// Returns `None` when the id was not derived from a public key.
    #[must_use]
    pub fn to_verifying_key(&self) -> Option<VerifyingKey> {
        let bytes = bs58::decode(&self.0).into_vec().ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty id (an unset `sender_id`, for instance).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of an application protocol multiplexed over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Creates a protocol id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
