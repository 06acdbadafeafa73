//! Envelope codec: `Payload` → `Message` → `Envelope` and back.
//!
//! Every layer is serialized as JSON with byte fields carried as padded
//! base64 strings and empty fields omitted. An envelope occupies exactly one
//! newline-terminated frame on the wire; JSON output never contains a raw
//! newline, so the delimiter is unambiguous.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

use crate::error::BusError;
use crate::identity::{Signer, Verifier};
use crate::protocol::PeerId;

/// Byte that terminates every frame.
pub const FRAME_DELIMITER: u8 = b'\n';

/// SHA3-256 digest of a serialized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes `bytes` with SHA3-256.
    #[must_use]
    pub fn compute(bytes: &[u8]) -> Self {
        Self(Sha3_256::digest(bytes).into())
    }

    /// Creates a hash from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Application-level data plus the metadata needed to route it to a handler.
///
/// Immutable once constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "PeerId::is_empty")]
    creator: PeerId,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    codec: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    data: Vec<u8>,
}

impl Payload {
    /// Creates a payload with an empty codec.
    #[must_use]
    pub fn new(creator: PeerId, kind: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            creator,
            kind: kind.into(),
            codec: String::new(),
            data: data.into(),
        }
    }

    /// Sets the codec identifier describing `data`.
    #[must_use]
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    /// The peer that created the payload.
    #[must_use]
    pub const fn creator(&self) -> &PeerId {
        &self.creator
    }

    /// The application message kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The encoding of `data`.
    #[must_use]
    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// The opaque application bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A serialized payload and its optional signature.
///
/// The parsed [`Payload`] is a derived view and is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        rename = "payload",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    payload_bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    signature: Option<Vec<u8>>,
    #[serde(skip)]
    payload: Payload,
}

impl Message {
    /// Parses a serialized message and the payload it carries.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Decode`] if either layer does not parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        let mut message: Self = serde_json::from_slice(bytes)
            .map_err(|e| BusError::Decode(format!("invalid message: {e}")))?;
        message.payload = serde_json::from_slice(&message.payload_bytes)
            .map_err(|e| BusError::Decode(format!("invalid payload: {e}")))?;
        Ok(message)
    }

    /// The parsed payload.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The payload exactly as it was signed and hashed.
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload_bytes
    }

    /// The signature over `payload_bytes`, if the sender signed.
    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Checks the signature against the payload creator.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Signature`] if verification fails, or if the
    /// message is unsigned and `required` is set.
    pub fn verify_signature(
        &self,
        verifier: &dyn Verifier,
        required: bool,
    ) -> Result<(), BusError> {
        match &self.signature {
            Some(signature) => {
                verifier.verify(self.payload.creator(), &self.payload_bytes, signature)
            }
            None if required => Err(BusError::Signature(format!(
                "unsigned message from {}",
                self.payload.creator()
            ))),
            None => Ok(()),
        }
    }
}

/// Wire frame: a serialized message and its content hash.
///
/// The recipient is not part of the envelope; the dispatcher pairs one
/// shared envelope with each recipient separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        rename = "message",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    message_bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    hash: Vec<u8>,
}

impl Envelope {
    /// Parses one frame, with or without its trailing delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Frame`] if the frame is not an envelope.
    pub fn from_frame(frame: &[u8]) -> Result<Self, BusError> {
        let frame = frame.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(frame);
        serde_json::from_slice(frame).map_err(|e| BusError::Frame(format!("invalid envelope: {e}")))
    }

    /// Serializes the envelope as a delimited frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<Vec<u8>, BusError> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(FRAME_DELIMITER);
        Ok(frame)
    }

    /// The serialized message.
    #[must_use]
    pub fn message_bytes(&self) -> &[u8] {
        &self.message_bytes
    }

    /// The hash as carried on the wire.
    #[must_use]
    pub fn carried_hash(&self) -> &[u8] {
        &self.hash
    }

    /// Recomputes the hash over the carried message bytes and compares.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Integrity`] on mismatch.
    pub fn verify(&self) -> Result<ContentHash, BusError> {
        let actual = ContentHash::compute(&self.message_bytes);
        if actual.as_bytes().as_slice() != self.hash.as_slice() {
            return Err(BusError::Integrity {
                expected: hex::encode(&self.hash),
                actual: actual.to_string(),
            });
        }
        Ok(actual)
    }

    /// Verifies integrity and decodes the message and payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Integrity`] or [`BusError::Decode`].
    pub fn open(&self) -> Result<Delivery, BusError> {
        let hash = self.verify()?;
        let message = Message::from_bytes(&self.message_bytes)?;
        Ok(Delivery { hash, message })
    }

    #[cfg(test)]
    pub(crate) fn message_bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.message_bytes
    }
}

/// A verified message handed to a dissemination policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Content hash of the serialized message.
    pub hash: ContentHash,
    /// The decoded message.
    pub message: Message,
}

/// Encodes a payload into an envelope, signing it when a signer is given.
///
/// # Errors
///
/// Returns an error if serialization or signing fails.
pub fn encode(payload: &Payload, signer: Option<&dyn Signer>) -> Result<Envelope, BusError> {
    let payload_bytes = serde_json::to_vec(payload)?;
    let signature = signer.map(|s| s.sign(&payload_bytes)).transpose()?;
    let message = Message {
        payload_bytes,
        signature,
        payload: payload.clone(),
    };
    let message_bytes = serde_json::to_vec(&message)?;
    let hash = ContentHash::compute(&message_bytes);
    Ok(Envelope {
        message_bytes,
        hash: hash.as_bytes().to_vec(),
    })
}

/// Decodes a frame into a verified message.
///
/// [`BusError::Frame`] means the frame itself is broken; any other error
/// concerns only this frame's contents.
///
/// # Errors
///
/// Returns [`BusError::Frame`], [`BusError::Integrity`] or [`BusError::Decode`].
pub fn decode(frame: &[u8]) -> Result<Delivery, BusError> {
    Envelope::from_frame(frame)?.open()
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
