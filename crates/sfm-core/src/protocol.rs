//! AirDrop transfer protocol — wire types and validation.
//!
//! These types ARE the protocol. Bodies are JSON; binary fields travel as
//! base64 strings; chunk metadata rides in the `X-Chunk-Metadata` header
//! next to a raw ciphertext body. The handshake signature covers the
//! canonical serialization of the request with its signature field null.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::identity::{self, DeviceIdentity};

/// Fixed chunk size for file transport: 4 MiB. Only the final chunk of a
/// transfer may be smaller.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// HTTP header carrying [`ChunkMetadata`] as JSON.
pub const CHUNK_METADATA_HEADER: &str = "X-Chunk-Metadata";

/// Number of chunks for a file of `size` bytes.
///
/// Derived identically on both sides; a size that is an exact multiple of
/// [`CHUNK_SIZE`] produces no short final chunk.
pub fn total_chunks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE) as u32
}

/// SHA-256 of a chunk's plaintext, lowercase hex.
pub fn chunk_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ── Base64 field encoding ─────────────────────────────────────────────────────

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as base64 or null.
pub mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Metadata for the file being offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

/// Sent by the sender to initiate a transfer.
///
/// `device_pubkey` lets the receiver verify the signature and pin the key on
/// first use; the fingerprint must be the fingerprint of that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub device_name: String,
    pub device_fingerprint: String,
    /// Long-lived Ed25519 public key, 32 bytes.
    #[serde(with = "base64_bytes")]
    pub device_pubkey: Vec<u8>,
    /// Ephemeral X25519 public key, 32 bytes. Fresh per transfer.
    #[serde(with = "base64_bytes")]
    pub ephemeral_pubkey: Vec<u8>,
    pub file_metadata: FileMetadata,
    /// Ed25519 signature, 64 bytes. Null while unsigned.
    #[serde(with = "base64_opt")]
    pub signature: Option<Vec<u8>>,
}

impl HandshakeRequest {
    /// Build and sign a request for one outgoing transfer.
    pub fn new_signed(
        identity: &DeviceIdentity,
        device_name: &str,
        ephemeral_pubkey: [u8; 32],
        file_metadata: FileMetadata,
    ) -> Result<Self, Error> {
        let mut request = Self {
            device_name: device_name.to_string(),
            device_fingerprint: identity.fingerprint().to_string(),
            device_pubkey: identity.public_key().to_vec(),
            ephemeral_pubkey: ephemeral_pubkey.to_vec(),
            file_metadata,
            signature: None,
        };
        let bytes = request.signing_bytes()?;
        request.signature = Some(identity.sign(&bytes).to_vec());
        Ok(request)
    }

    /// Canonical byte serialization covered by the signature: the request
    /// itself with `signature` null.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned)
            .map_err(|e| Error::InvalidFormat(format!("unserializable handshake request: {e}")))
    }

    /// The presented long-lived public key as a fixed array.
    pub fn device_pubkey_array(&self) -> Result<[u8; 32], Error> {
        self.device_pubkey
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidFormat("device_pubkey must be 32 bytes".into()))
    }

    /// The ephemeral X25519 public key as a fixed array.
    pub fn ephemeral_pubkey_array(&self) -> Result<[u8; 32], Error> {
        self.ephemeral_pubkey
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidFormat("ephemeral_pubkey must be 32 bytes".into()))
    }

    /// Whether the presented fingerprint is the fingerprint of the presented
    /// public key.
    pub fn fingerprint_matches_key(&self) -> Result<bool, Error> {
        let pubkey = self.device_pubkey_array()?;
        Ok(identity::fingerprint(&pubkey) == self.device_fingerprint)
    }

    /// Verify the signature over the canonical bytes against the presented
    /// public key. `Ok(false)` means a well-formed but invalid signature.
    pub fn verify_signature(&self) -> Result<bool, Error> {
        let Some(signature) = self.signature.as_deref() else {
            return Ok(false);
        };
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::InvalidFormat("signature must be 64 bytes".into()))?;
        let pubkey = self.device_pubkey_array()?;
        let bytes = self.signing_bytes()?;
        Ok(identity::verify(&pubkey, &bytes, &signature))
    }
}

/// Sent by the receiver in answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    /// Receiver's ephemeral X25519 public key. Present iff accepted.
    #[serde(with = "base64_opt", default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_pubkey: Option<Vec<u8>>,
    /// UUIDv4 identifying the new session. Present iff accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandshakeResponse {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            ephemeral_pubkey: None,
            session_id: None,
            message: Some(message.into()),
        }
    }
}

// ── Chunk transport ───────────────────────────────────────────────────────────

/// Describes one chunk; carried in the `X-Chunk-Metadata` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Chunk index in `[0, total)`.
    pub index: u32,
    /// Total chunks in this transfer.
    pub total: u32,
    /// Plaintext length of this chunk in bytes.
    pub size: u32,
    /// SHA-256 of the plaintext, lowercase hex.
    pub checksum: String,
    pub session_id: String,
}

impl ChunkMetadata {
    /// Validate a decrypted chunk against its declared metadata and the
    /// session's geometry.
    ///
    /// Every chunk except the final one must be exactly [`CHUNK_SIZE`]
    /// bytes; the final chunk must cover the remainder of the file.
    pub fn verify(&self, plaintext: &[u8], total_chunks: u32, file_size: u64) -> Result<(), Error> {
        if self.total != total_chunks {
            return Err(Error::InvalidFormat(format!(
                "chunk declares {} total chunks, session has {total_chunks}",
                self.total
            )));
        }
        if self.index >= total_chunks {
            return Err(Error::InvalidFormat(format!(
                "chunk index {} out of range [0, {total_chunks})",
                self.index
            )));
        }

        let offset = self.index as u64 * CHUNK_SIZE;
        let expected_len = CHUNK_SIZE.min(file_size - offset) as usize;
        if plaintext.len() != expected_len {
            return Err(Error::InvalidFormat(format!(
                "chunk {} is {} bytes, expected {expected_len}",
                self.index,
                plaintext.len()
            )));
        }
        if self.size as usize != plaintext.len() {
            return Err(Error::InvalidFormat(format!(
                "chunk {} declares {} bytes, carries {}",
                self.index,
                self.size,
                plaintext.len()
            )));
        }

        if chunk_checksum(plaintext) != self.checksum {
            return Err(Error::IntegrityFailed { index: self.index });
        }
        Ok(())
    }
}

/// Receiver's acknowledgement of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAck {
    pub index: u32,
    pub session_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkAck {
    pub fn success(metadata: &ChunkMetadata) -> Self {
        Self {
            index: metadata.index,
            session_id: metadata.session_id.clone(),
            success: true,
            error: None,
        }
    }

    pub fn failure(metadata: &ChunkMetadata, error: impl Into<String>) -> Self {
        Self {
            index: metadata.index,
            session_id: metadata.session_id.clone(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Receiver's view of an in-progress transfer, served from `/status`.
///
/// The receiver's received-set is the authority: a sender resumes by sending
/// exactly the chunks absent from `received_chunks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    pub session_id: String,
    pub total_chunks: u32,
    /// Sorted indices of chunks received so far.
    pub received_chunks: Vec<u32>,
    /// Percentage complete.
    pub progress: f64,
    pub can_resume: bool,
}

/// Served from `/ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub device_name: String,
    pub fingerprint: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
