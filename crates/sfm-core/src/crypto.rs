//! Cryptographic primitives for SFM.
//!
//! Three families of operations:
//!   1. Argon2id password-based key derivation — container keys
//!   2. AES-256-GCM seal/open — container bodies and chunk transport
//!   3. X25519 ephemeral agreement — per-transfer session keys
//!
//! A CTR-mode streaming variant is also provided for callers that need to
//! encrypt data larger than memory. It carries no authentication tag;
//! everything that needs integrity goes through `aead_seal`/`aead_open`.
//!
//! Derived key material is zeroized on drop. There is no unsafe code in
//! this module.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;
/// GCM nonce length in bytes. A fresh random nonce is generated per seal.
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Container salt length in bytes.
pub const SALT_SIZE: usize = 32;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

// ── Keys ──────────────────────────────────────────────────────────────────────

/// A 256-bit symmetric key. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

// ── Key derivation ────────────────────────────────────────────────────────────

/// Argon2id parameters. Stored in the container header so every container
/// is self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Iterations (time cost).
    pub time: u32,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Parallelism.
    pub threads: u8,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time: 3,
            memory_kib: 65536,
            threads: 4,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.time == 0 || self.memory_kib == 0 || self.threads == 0 {
            return Err(Error::Config(format!(
                "Argon2id parameters out of range: time={} memory_kib={} threads={}",
                self.time, self.memory_kib, self.threads
            )));
        }
        Ok(())
    }
}

/// Derive a 256-bit key from a password and salt using Argon2id v0x13.
pub fn derive_key(password: &str, salt: &[u8; SALT_SIZE], params: &KdfParams) -> Result<Key, Error> {
    params.validate()?;

    let argon_params = Params::new(
        params.memory_kib,
        params.time,
        params.threads as u32,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::Config(format!("Argon2id parameters out of range: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| Error::Config(format!("Argon2id derivation failed: {e}")))?;

    Ok(Key::from_bytes(key))
}

/// Generate a random container salt from the OS CSPRNG.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

// ── AEAD ──────────────────────────────────────────────────────────────────────

/// Encrypt with AES-256-GCM under a fresh random nonce.
///
/// Returns `nonce ‖ ciphertext ‖ tag`; the nonce is prepended so the
/// counterpart can split it back out.
pub fn aead_seal(plaintext: &[u8], key: &Key) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Config("plaintext too large for AES-GCM".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt the output of [`aead_seal`].
///
/// Fails with [`Error::AuthenticationFailed`] when the tag does not verify:
/// wrong key, tampered ciphertext, or truncation.
pub fn aead_open(sealed: &[u8], key: &Key) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::AuthenticationFailed);
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::AuthenticationFailed)
}

// ── Streaming (confidentiality only) ──────────────────────────────────────────

/// Encrypt `reader` into `writer` with AES-256-CTR.
///
/// Writes a random 12-byte nonce, then a single keystream-masked copy of the
/// data. The IV is the nonce padded with a 32-bit zero counter. There is no
/// authentication tag: a tampered stream decrypts to garbage rather than
/// failing, so callers that need integrity must use [`aead_seal`] instead.
pub fn seal_stream<R: Read, W: Write>(reader: &mut R, writer: &mut W, key: &Key) -> Result<u64, Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    writer
        .write_all(&nonce)
        .map_err(|e| Error::io("failed to write stream nonce", e))?;
    apply_ctr(reader, writer, key, &nonce)
}

/// Decrypt the output of [`seal_stream`]. Returns the number of payload
/// bytes written. No integrity check is performed.
pub fn open_stream<R: Read, W: Write>(reader: &mut R, writer: &mut W, key: &Key) -> Result<u64, Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    reader
        .read_exact(&mut nonce)
        .map_err(|e| Error::io("failed to read stream nonce", e))?;
    apply_ctr(reader, writer, key, &nonce)
}

fn apply_ctr<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &Key,
    nonce: &[u8; NONCE_SIZE],
) -> Result<u64, Error> {
    let mut iv = [0u8; 16];
    iv[..NONCE_SIZE].copy_from_slice(nonce);
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());

    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::io("failed to read stream", e))?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| Error::io("failed to write stream", e))?;
        total += n as u64;
    }
    Ok(total)
}

// ── X25519 session keys ───────────────────────────────────────────────────────

/// Generate an ephemeral X25519 keypair for one handshake.
///
/// The secret is consumed by [`session_key`]; it cannot outlive the
/// agreement, which is what gives each transfer forward secrecy.
pub fn ephemeral_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Derive the shared session key: SHA-256 of the X25519 shared secret.
///
/// Both sides compute the same key from their own secret and the peer's
/// public key. The key is never transmitted.
pub fn session_key(secret: EphemeralSecret, peer_public: &[u8; 32]) -> Key {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    let digest = Sha256::digest(shared.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    Key::from_bytes(key)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
