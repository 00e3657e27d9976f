//! Trust-on-first-use store — fingerprint → pinned Ed25519 public key.
//!
//! The first accepted handshake from a fingerprint pins the presented public
//! key and persists it; every later handshake from that fingerprint must
//! present the same key. The fingerprint shows only the first 16 bytes of
//! the key hash, so pinning the full 32-byte key is what actually closes the
//! door on a second-preimage over the visible prefix.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use dashmap::DashMap;

use sfm_core::Error;

/// Outcome of checking a presented key against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCheck {
    /// Never seen this fingerprint before.
    FirstUse,
    /// Fingerprint known, key matches the pinned one.
    Match,
    /// Fingerprint known, key differs. Reject the handshake.
    Mismatch,
}

/// Persistent map of pinned device keys.
pub struct TofuStore {
    path: PathBuf,
    pinned: DashMap<String, [u8; 32]>,
}

impl TofuStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let pinned = DashMap::new();

        match std::fs::read(&path) {
            Ok(bytes) => {
                let entries: HashMap<String, String> = serde_json::from_slice(&bytes)
                    .map_err(|e| {
                        Error::InvalidFormat(format!("malformed trust store {}: {e}", path.display()))
                    })?;
                for (fingerprint, hex_key) in entries {
                    let key_bytes = hex::decode(&hex_key).map_err(|e| {
                        Error::InvalidFormat(format!("malformed pinned key for {fingerprint}: {e}"))
                    })?;
                    let key: [u8; 32] = key_bytes.try_into().map_err(|_| {
                        Error::InvalidFormat(format!("pinned key for {fingerprint} is not 32 bytes"))
                    })?;
                    pinned.insert(fingerprint, key);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("failed to read trust store", e)),
        }

        Ok(Self { path, pinned })
    }

    /// Check a presented key against the store. Has no side effect: a new
    /// fingerprint reports [`TrustCheck::FirstUse`] but is pinned only by
    /// [`TofuStore::pin`], once the transfer is actually accepted.
    pub fn check(&self, fingerprint: &str, public_key: &[u8; 32]) -> TrustCheck {
        match self.pinned.get(fingerprint) {
            Some(pinned) if *pinned.value() == *public_key => TrustCheck::Match,
            Some(_) => TrustCheck::Mismatch,
            None => TrustCheck::FirstUse,
        }
    }

    /// Pin a key for a fingerprint seen for the first time. A key already
    /// pinned for this fingerprint is left untouched.
    pub fn pin(&self, fingerprint: &str, public_key: &[u8; 32]) {
        let mut newly_pinned = false;
        self.pinned.entry(fingerprint.to_string()).or_insert_with(|| {
            newly_pinned = true;
            *public_key
        });
        if !newly_pinned {
            return;
        }

        if let Err(e) = self.save() {
            // The pin still holds in memory for this run.
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist trust store");
        }
        tracing::info!(fingerprint, "pinned new device key");
    }

    /// Drop a pinned key, e.g. after a deliberate device reset.
    pub fn forget(&self, fingerprint: &str) -> Result<(), Error> {
        if self.pinned.remove(fingerprint).is_some() {
            self.save()?;
            tracing::info!(fingerprint, "forgot pinned device key");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io("failed to create trust store directory", e))?;
        }
        let entries: HashMap<String, String> = self
            .pinned
            .iter()
            .map(|entry| (entry.key().clone(), hex::encode(entry.value())))
            .collect();
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| Error::InvalidFormat(format!("unserializable trust store: {e}")))?;
        std::fs::write(&self.path, json).map_err(|e| Error::io("failed to write trust store", e))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sfm-trust-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("trusted_devices.json")
    }

    #[test]
    fn first_use_pins_then_matches() {
        let store = TofuStore::open(store_path("pin")).unwrap();
        let fp = "aa:bb";
        assert_eq!(store.check(fp, &[1u8; 32]), TrustCheck::FirstUse);
        // Checking alone pins nothing.
        assert_eq!(store.check(fp, &[2u8; 32]), TrustCheck::FirstUse);

        store.pin(fp, &[1u8; 32]);
        assert_eq!(store.check(fp, &[1u8; 32]), TrustCheck::Match);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn changed_key_is_a_mismatch() {
        let store = TofuStore::open(store_path("mismatch")).unwrap();
        let fp = "aa:bb";
        store.pin(fp, &[1u8; 32]);
        assert_eq!(store.check(fp, &[2u8; 32]), TrustCheck::Mismatch);
        // A mismatching pin attempt does not replace the original.
        store.pin(fp, &[2u8; 32]);
        assert_eq!(store.check(fp, &[1u8; 32]), TrustCheck::Match);
    }

    #[test]
    fn pins_survive_reopen() {
        let path = store_path("reload");
        {
            let store = TofuStore::open(path.clone()).unwrap();
            store.pin("aa:bb", &[9u8; 32]);
        }
        let reopened = TofuStore::open(path).unwrap();
        assert_eq!(reopened.check("aa:bb", &[9u8; 32]), TrustCheck::Match);
        assert_eq!(reopened.check("aa:bb", &[8u8; 32]), TrustCheck::Mismatch);
    }

    #[test]
    fn forget_unpins() {
        let store = TofuStore::open(store_path("forget")).unwrap();
        store.pin("aa:bb", &[1u8; 32]);
        store.forget("aa:bb").unwrap();
        assert_eq!(store.check("aa:bb", &[2u8; 32]), TrustCheck::FirstUse);
    }

    #[test]
    fn malformed_store_file_rejected() {
        let path = store_path("malformed");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            TofuStore::open(path),
            Err(Error::InvalidFormat(_))
        ));
    }
}
