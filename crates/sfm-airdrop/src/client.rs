//! AirDrop transfer client — drives the handshake, the chunk loop, and
//! status queries.
//!
//! The client recovers nothing on its own: a failed chunk aborts the loop,
//! and the decision to resume — query `/status`, resend what is missing —
//! belongs to the caller.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sfm_core::crypto::{self, Key};
use sfm_core::identity::DeviceIdentity;
use sfm_core::protocol::{
    self, ChunkAck, ChunkMetadata, FileMetadata, HandshakeRequest, HandshakeResponse,
    PingResponse, TransferStatus, CHUNK_SIZE,
};
use sfm_core::Error;

use crate::error::TransferError;

/// Whole-transfer HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Progress callback: (chunks_sent, total_chunks).
pub type ProgressFn = dyn Fn(u32, u32) + Send + Sync;

/// Sender side of the transfer protocol.
pub struct AirdropClient {
    http: reqwest::Client,
    identity: Arc<DeviceIdentity>,
    device_name: String,
}

impl AirdropClient {
    pub fn new(device_name: impl Into<String>, identity: Arc<DeviceIdentity>) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            identity,
            device_name: device_name.into(),
        })
    }

    /// Ask a peer who it is. `addr` is `host:port`.
    pub async fn ping(&self, addr: &str) -> Result<PingResponse, TransferError> {
        let response = self.http.get(format!("http://{addr}/ping")).send().await?;
        Ok(response.json().await?)
    }

    /// Offer a file to a peer: sign and send the handshake, agree the
    /// session key, and return a live [`Transfer`] handle.
    pub async fn offer(&self, addr: &str, path: &Path) -> Result<Transfer, TransferError> {
        let file_size = std::fs::metadata(path)
            .map_err(|e| Error::io(format!("failed to stat {}", path.display()), e))?
            .len();
        if file_size == 0 {
            return Err(Error::Config(format!(
                "refusing to send zero-size file {}",
                path.display()
            ))
            .into());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("path has no usable file name: {}", path.display())))?;

        let metadata = FileMetadata {
            name: name.to_string(),
            size: file_size,
            mime: "application/octet-stream".into(),
        };

        let (ephemeral_secret, ephemeral_public) = crypto::ephemeral_keypair();
        let request = HandshakeRequest::new_signed(
            &self.identity,
            &self.device_name,
            ephemeral_public.to_bytes(),
            metadata,
        )?;

        let response: HandshakeResponse = self
            .http
            .post(format!("http://{addr}/handshake"))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if !response.accepted {
            return Err(TransferError::Rejected(
                response.message.unwrap_or_else(|| "no reason given".into()),
            ));
        }

        let peer_ephemeral: [u8; 32] = response
            .ephemeral_pubkey
            .as_deref()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                TransferError::InvalidResponse("handshake response missing 32-byte ephemeral key".into())
            })?;
        let session_id = response
            .session_id
            .ok_or_else(|| TransferError::InvalidResponse("handshake response missing session id".into()))?;

        let session_key = crypto::session_key(ephemeral_secret, &peer_ephemeral);
        tracing::info!(addr, session_id = %session_id, file = name, bytes = file_size, "handshake accepted");

        Ok(Transfer {
            http: self.http.clone(),
            addr: addr.to_string(),
            path: path.to_path_buf(),
            file_size,
            total_chunks: protocol::total_chunks(file_size),
            session_id,
            session_key,
        })
    }

    /// Handshake and send every chunk in order.
    pub async fn send_file(
        &self,
        addr: &str,
        path: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<(), TransferError> {
        let transfer = self.offer(addr, path).await?;
        transfer.send_all(progress).await
    }
}

/// One accepted transfer: the session ID and the agreed AEAD key.
pub struct Transfer {
    http: reqwest::Client,
    addr: String,
    path: PathBuf,
    file_size: u64,
    total_chunks: u32,
    session_id: String,
    session_key: Key,
}

impl std::fmt::Debug for Transfer {
    /// Omits `session_key`: `Key` deliberately does not implement `Debug`
    /// so key material never lands in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("addr", &self.addr)
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("total_chunks", &self.total_chunks)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Transfer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// The AEAD key agreed for this transfer.
    pub fn session_key(&self) -> &Key {
        &self.session_key
    }

    /// Send every chunk in index order.
    pub async fn send_all(&self, progress: Option<&ProgressFn>) -> Result<(), TransferError> {
        let file = File::open(&self.path)
            .map_err(|e| Error::io(format!("failed to open {}", self.path.display()), e))?;

        for index in 0..self.total_chunks {
            self.send_one(&file, index).await?;
            if let Some(progress) = progress {
                progress(index + 1, self.total_chunks);
            }
        }

        tracing::info!(session_id = %self.session_id, chunks = self.total_chunks, "all chunks sent");
        Ok(())
    }

    /// Send a specific set of chunks, in the order given.
    pub async fn send_chunks(&self, indices: &[u32]) -> Result<(), TransferError> {
        let file = File::open(&self.path)
            .map_err(|e| Error::io(format!("failed to open {}", self.path.display()), e))?;

        for &index in indices {
            self.send_one(&file, index).await?;
        }
        Ok(())
    }

    /// Query `/status` and send only the chunks the receiver is missing.
    /// The receiver's received-set is the authority.
    pub async fn send_missing(&self) -> Result<(), TransferError> {
        let status = self.status().await?;
        let received: HashSet<u32> = status.received_chunks.iter().copied().collect();
        let missing: Vec<u32> = (0..self.total_chunks)
            .filter(|index| !received.contains(index))
            .collect();

        tracing::info!(
            session_id = %self.session_id,
            missing = missing.len(),
            total = self.total_chunks,
            "resuming transfer"
        );
        self.send_chunks(&missing).await
    }

    /// The receiver's view of this transfer.
    pub async fn status(&self) -> Result<TransferStatus, TransferError> {
        let response = self
            .http
            .get(format!("http://{}/status", self.addr))
            .query(&[("session_id", self.session_id.as_str())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(TransferError::UnknownSession(self.session_id.clone()));
        }
        Ok(response.json().await?)
    }

    async fn send_one(&self, file: &File, index: u32) -> Result<(), TransferError> {
        let plaintext = read_chunk(file, index, self.file_size)
            .map_err(|e| Error::io(format!("failed to read chunk {index}"), e))?;

        let metadata = ChunkMetadata {
            index,
            total: self.total_chunks,
            size: plaintext.len() as u32,
            checksum: protocol::chunk_checksum(&plaintext),
            session_id: self.session_id.clone(),
        };
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| Error::InvalidFormat(format!("unserializable chunk metadata: {e}")))?;

        let sealed = crypto::aead_seal(&plaintext, &self.session_key)?;

        let response = self
            .http
            .post(format!("http://{}/chunk", self.addr))
            .header(protocol::CHUNK_METADATA_HEADER, metadata_json)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(sealed)
            .send()
            .await?;

        // The server answers 400 for a session it does not know; the caller
        // must re-handshake.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(TransferError::UnknownSession(self.session_id.clone()));
        }

        let ack: ChunkAck = response.json().await?;
        if !ack.success {
            return Err(TransferError::ChunkRejected {
                index,
                reason: ack.error.unwrap_or_else(|| "unspecified".into()),
            });
        }

        tracing::debug!(session_id = %self.session_id, index, "chunk acknowledged");
        Ok(())
    }
}

/// Read the chunk at `index` from its fixed offset `index * CHUNK_SIZE`.
/// The final chunk may be short; every other chunk is exactly `CHUNK_SIZE`.
fn read_chunk(file: &File, index: u32, file_size: u64) -> std::io::Result<Vec<u8>> {
    let offset = index as u64 * CHUNK_SIZE;
    let len = CHUNK_SIZE.min(file_size.saturating_sub(offset)) as usize;
    let mut buf = vec![0u8; len];
    read_exact_at(file, &mut buf, offset)?;
    Ok(buf)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shorter than expected",
            ));
        }
        read += n;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
