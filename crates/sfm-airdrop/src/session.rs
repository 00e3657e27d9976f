//! Receiver-side session state — one entry per in-progress transfer.
//!
//! A session exists from handshake acceptance until every chunk has been
//! received or the server discards it. Chunk writes are positional and take
//! no lock; the session mutex covers only the received-set and is never held
//! across I/O. Dropping the session closes the output file.

use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use sfm_core::crypto::Key;
use sfm_core::protocol::{FileMetadata, CHUNK_SIZE};

/// Shared table of active sessions, keyed by session ID.
pub type SessionTable = Arc<DashMap<String, Arc<TransferSession>>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// State for one accepted incoming transfer.
pub struct TransferSession {
    pub session_id: String,
    pub sender_name: String,
    pub sender_fingerprint: String,
    pub metadata: FileMetadata,
    /// AEAD key agreed at handshake time. Derived once, never transmitted.
    pub session_key: Key,
    pub total_chunks: u32,
    /// Output path the file is being written to.
    pub path: PathBuf,
    /// Indices of chunks written so far.
    received: Mutex<HashSet<u32>>,
    file: File,
    last_activity: Mutex<Instant>,
}

impl TransferSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        sender_name: String,
        sender_fingerprint: String,
        metadata: FileMetadata,
        session_key: Key,
        total_chunks: u32,
        file: File,
        path: PathBuf,
    ) -> Self {
        Self {
            session_id,
            sender_name,
            sender_fingerprint,
            metadata,
            session_key,
            total_chunks,
            path,
            received: Mutex::new(HashSet::new()),
            file,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Write one decrypted chunk at its fixed offset `index * CHUNK_SIZE`.
    /// Positional write; concurrent chunks for this session may interleave.
    pub fn write_chunk(&self, index: u32, plaintext: &[u8]) -> std::io::Result<()> {
        write_at(&self.file, plaintext, index as u64 * CHUNK_SIZE)
    }

    /// Mark a chunk received. Returns the received count and whether the
    /// transfer is now complete. Completeness is monotonic: chunks are only
    /// ever added.
    pub async fn mark_received(&self, index: u32) -> (usize, bool) {
        let mut received = self.received.lock().await;
        received.insert(index);
        let count = received.len();
        (count, count as u32 == self.total_chunks)
    }

    /// Sorted indices of the chunks received so far.
    pub async fn received_indices(&self) -> Vec<u32> {
        let received = self.received.lock().await;
        let mut indices: Vec<u32> = received.iter().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Record chunk activity for idle accounting.
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Time since the last chunk for this session.
    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    /// Flush the output file to disk.
    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        written += n;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(total_chunks: u32, dir: &std::path::Path) -> TransferSession {
        let path = dir.join("out.bin");
        let file = File::create(&path).unwrap();
        TransferSession::new(
            "session-1".into(),
            "laptop".into(),
            "aa:bb".into(),
            FileMetadata {
                name: "out.bin".into(),
                size: total_chunks as u64 * CHUNK_SIZE,
                mime: "application/octet-stream".into(),
            },
            Key::from_bytes([0u8; 32]),
            total_chunks,
            file,
            path,
        )
    }

    fn test_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sfm-session-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn marks_accumulate_and_complete() {
        let dir = test_dir("marks");
        let session = sample_session(3, &dir);

        assert_eq!(session.mark_received(0).await, (1, false));
        assert_eq!(session.mark_received(2).await, (2, false));
        // Re-delivery of a chunk is idempotent.
        assert_eq!(session.mark_received(0).await, (2, false));
        assert_eq!(session.mark_received(1).await, (3, true));

        assert_eq!(session.received_indices().await, vec![0, 1, 2]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn chunks_land_at_their_offsets() {
        let dir = test_dir("offsets");
        let session = sample_session(2, &dir);

        // Write out of order; offsets must not depend on arrival order.
        session.write_chunk(1, b"SECOND").unwrap();
        session.write_chunk(0, b"FIRST").unwrap();
        session.sync().unwrap();

        let bytes = std::fs::read(&session.path).unwrap();
        assert_eq!(&bytes[..5], b"FIRST");
        assert_eq!(
            &bytes[CHUNK_SIZE as usize..CHUNK_SIZE as usize + 6],
            b"SECOND"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn touch_resets_idle_clock() {
        let dir = test_dir("idle");
        let session = sample_session(1, &dir);
        session.touch().await;
        assert!(session.idle_for().await < Duration::from_secs(1));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
