//! Device identity — long-lived Ed25519 keypair and fingerprint.
//!
//! The keypair persists as two files: `device.pub` (0644) and `device.key`
//! (0600) inside a 0700 directory. The fingerprint is recomputed from the
//! public key on every load, never stored, so it always matches the on-disk
//! key. The private key signs handshake requests only; session encryption
//! uses ephemeral X25519 keys.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// File name of the persisted public key (mode 0644).
pub const PUBLIC_KEY_FILE: &str = "device.pub";
/// File name of the persisted private key (mode 0600).
pub const PRIVATE_KEY_FILE: &str = "device.key";

/// The device's long-lived signing identity.
pub struct DeviceIdentity {
    signing: SigningKey,
    fingerprint: String,
}

impl DeviceIdentity {
    /// Load the identity from `dir`, generating and persisting a fresh
    /// keypair when either key file is missing.
    pub fn load_or_generate(dir: &Path) -> Result<Self, Error> {
        let pub_path = dir.join(PUBLIC_KEY_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);

        if let (Ok(pub_bytes), Ok(key_bytes)) = (fs::read(&pub_path), fs::read(&key_path)) {
            let private: [u8; 32] = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidFormat(format!("{} is not a 32-byte key", key_path.display())))?;
            let signing = SigningKey::from_bytes(&private);
            if signing.verifying_key().to_bytes().as_slice() != pub_bytes.as_slice() {
                return Err(Error::InvalidFormat(format!(
                    "{} does not match {}",
                    pub_path.display(),
                    key_path.display()
                )));
            }
            return Ok(Self::from_signing(signing));
        }

        let signing = SigningKey::generate(&mut OsRng);
        persist(dir, &signing)?;
        Ok(Self::from_signing(signing))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let fingerprint = fingerprint(&signing.verifying_key().to_bytes());
        Self { signing, fingerprint }
    }

    /// The 32-byte Ed25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The stable human-visible fingerprint of this device.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Sign `data` with the long-lived private key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature. Returns false for malformed keys as well as
/// bad signatures.
pub fn verify(public_key: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(data, &Signature::from_bytes(signature)).is_ok()
}

/// Render a device fingerprint: lowercase hex of the first 16 bytes of
/// SHA-256(public key), one colon between every byte pair — 47 characters.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    digest[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn persist(dir: &Path, signing: &SigningKey) -> Result<(), Error> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create identity directory {}", dir.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io(format!("failed to restrict {}", dir.display()), e))?;
    }

    let pub_path = dir.join(PUBLIC_KEY_FILE);
    write_key_file(&pub_path, &signing.verifying_key().to_bytes(), 0o644)
        .map_err(|e| Error::io(format!("failed to save {}", pub_path.display()), e))?;

    let key_path = dir.join(PRIVATE_KEY_FILE);
    write_key_file(&key_path, &signing.to_bytes(), 0o600)
        .map_err(|e| Error::io(format!("failed to save {}", key_path.display()), e))?;

    Ok(())
}

#[cfg(unix)]
fn write_key_file(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, bytes: &[u8], _mode: u32) -> std::io::Result<()> {
    fs::write(path, bytes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
