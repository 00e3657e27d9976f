//! AirDrop transfer server — a session state machine behind four HTTP routes.
//!
//! Per session the receiver moves through: handshake pending → active
//! (in the table, chunks landing) → complete (destroyed). There is no retry
//! state: each chunk either ACKs success or ACKs failure, and the sender
//! decides whether to resend. Chunk failures never tear down the session;
//! a session ends only on completion or idle discard.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use sfm_core::crypto::{self, NONCE_SIZE, TAG_SIZE};
use sfm_core::identity::DeviceIdentity;
use sfm_core::protocol::{
    self, ChunkAck, ChunkMetadata, HandshakeRequest, HandshakeResponse, PingResponse,
    TransferStatus, CHUNK_SIZE,
};
use sfm_core::Error;

use crate::observer::{Direction, NoopObserver, TransferObserver};
use crate::session::{new_session_table, SessionTable, TransferSession};
use crate::trust::{TofuStore, TrustCheck};

/// Largest acceptable `/chunk` body: one chunk plus AEAD overhead.
const MAX_CHUNK_BODY: usize = CHUNK_SIZE as usize + NONCE_SIZE + TAG_SIZE;

/// Sessions with no chunk activity for this long are discarded.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the idle sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// What the accept callback gets to see before a transfer starts.
#[derive(Debug, Clone)]
pub struct TransferOffer {
    pub sender_name: String,
    pub sender_fingerprint: String,
    pub file_name: String,
    pub size: u64,
}

/// The gate for user consent. Return false to refuse the transfer.
pub type AcceptCallback = Arc<dyn Fn(&TransferOffer) -> bool + Send + Sync>;

/// Transfer server state. Cheap to clone; all collaborators are injected at
/// construction — the server reads no configuration itself.
#[derive(Clone)]
pub struct AirdropServer {
    device_name: String,
    identity: Arc<DeviceIdentity>,
    download_dir: PathBuf,
    sessions: SessionTable,
    trust: Arc<TofuStore>,
    on_accept: AcceptCallback,
    observer: Arc<dyn TransferObserver>,
    idle_timeout: Duration,
}

impl AirdropServer {
    pub fn new(
        device_name: impl Into<String>,
        identity: Arc<DeviceIdentity>,
        download_dir: PathBuf,
        trust: Arc<TofuStore>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            identity,
            download_dir,
            sessions: new_session_table(),
            trust,
            on_accept: Arc::new(|_| true),
            observer: Arc::new(NoopObserver),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Install the consent gate. The default accepts everything.
    pub fn with_accept_callback(mut self, on_accept: AcceptCallback) -> Self {
        self.on_accept = on_accept;
        self
    }

    /// Install a completion observer. The default records nothing.
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// The live session table, shared with the running server.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Build the HTTP router over this state.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ping", get(handle_ping))
            .route("/handshake", post(handle_handshake))
            .route(
                "/chunk",
                post(handle_chunk).layer(DefaultBodyLimit::max(MAX_CHUNK_BODY)),
            )
            .route("/status", get(handle_status))
            .with_state(self)
    }

    /// Create the download directory, start the idle sweeper, and serve
    /// until the listener fails or the task is dropped.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.download_dir).with_context(|| {
            format!("failed to create download directory {}", self.download_dir.display())
        })?;

        self.clone().spawn_idle_sweeper();

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        tracing::info!(port, device_name = %self.device_name, "airdrop server listening");

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn spawn_idle_sweeper(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                self.evict_idle_sessions().await;
            }
        });
    }

    /// Discard sessions with no chunk activity for longer than the idle
    /// timeout. Dropping a session closes its file; the partial output
    /// stays on disk.
    pub async fn evict_idle_sessions(&self) {
        let snapshot: Vec<(String, Arc<TransferSession>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (session_id, session) in snapshot {
            if session.idle_for().await > self.idle_timeout
                && self.sessions.remove(&session_id).is_some()
            {
                tracing::warn!(
                    session_id = %session_id,
                    sender = %session.sender_fingerprint,
                    file = %session.path.display(),
                    "discarding idle session"
                );
            }
        }
    }
}

// ── /ping ─────────────────────────────────────────────────────────────────────

async fn handle_ping(State(server): State<AirdropServer>) -> Json<PingResponse> {
    Json(PingResponse {
        device_name: server.device_name.clone(),
        fingerprint: server.identity.fingerprint().to_string(),
    })
}

// ── /handshake ────────────────────────────────────────────────────────────────

async fn handle_handshake(
    State(server): State<AirdropServer>,
    Json(request): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, (StatusCode, String)> {
    tracing::info!(
        sender = %request.device_name,
        fingerprint = %request.device_fingerprint,
        file = %request.file_metadata.name,
        size = request.file_metadata.size,
        "handshake received"
    );

    let sender_pubkey = request
        .device_pubkey_array()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let peer_ephemeral = request
        .ephemeral_pubkey_array()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // Authentication failures are answered in-protocol so the sender sees
    // the reason; only malformed requests get HTTP errors.
    let fingerprint_bound = request
        .fingerprint_matches_key()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if !fingerprint_bound {
        tracing::warn!(fingerprint = %request.device_fingerprint, "fingerprint does not match presented key");
        return Ok(Json(HandshakeResponse::rejected(
            "fingerprint does not match presented key",
        )));
    }

    match request.verify_signature() {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(fingerprint = %request.device_fingerprint, "invalid handshake signature");
            return Ok(Json(HandshakeResponse::rejected("invalid handshake signature")));
        }
        Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string())),
    }

    if server.trust.check(&request.device_fingerprint, &sender_pubkey) == TrustCheck::Mismatch {
        tracing::warn!(fingerprint = %request.device_fingerprint, "device key changed since first use");
        return Ok(Json(HandshakeResponse::rejected(format!(
            "device key for {} changed since first use",
            request.device_fingerprint
        ))));
    }

    if request.file_metadata.size == 0 {
        return Ok(Json(HandshakeResponse::rejected("refusing zero-size file")));
    }

    let offer = TransferOffer {
        sender_name: request.device_name.clone(),
        sender_fingerprint: request.device_fingerprint.clone(),
        file_name: request.file_metadata.name.clone(),
        size: request.file_metadata.size,
    };
    if !(server.on_accept)(&offer) {
        tracing::info!(sender = %offer.sender_name, file = %offer.file_name, "transfer rejected by user");
        return Ok(Json(HandshakeResponse::rejected("Transfer rejected by user")));
    }

    // First accept from this fingerprint pins its key for good.
    server.trust.pin(&request.device_fingerprint, &sender_pubkey);

    // Ephemeral agreement: the secret lives exactly as long as this
    // handshake, which is what gives the session forward secrecy.
    let (ephemeral_secret, ephemeral_public) = crypto::ephemeral_keypair();
    let session_key = crypto::session_key(ephemeral_secret, &peer_ephemeral);

    let total_chunks = protocol::total_chunks(request.file_metadata.size);
    let session_id = Uuid::new_v4().to_string();

    let (file, path) = allocate_output_file(&server.download_dir, &request.file_metadata.name)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create output file: {e}"),
            )
        })?;

    let session = Arc::new(TransferSession::new(
        session_id.clone(),
        request.device_name.clone(),
        request.device_fingerprint.clone(),
        request.file_metadata.clone(),
        session_key,
        total_chunks,
        file,
        path,
    ));
    server.sessions.insert(session_id.clone(), session);

    tracing::info!(session_id = %session_id, total_chunks, "session created");

    Ok(Json(HandshakeResponse {
        accepted: true,
        ephemeral_pubkey: Some(ephemeral_public.as_bytes().to_vec()),
        session_id: Some(session_id),
        message: Some("Transfer accepted".into()),
    }))
}

// ── /chunk ────────────────────────────────────────────────────────────────────

async fn handle_chunk(
    State(server): State<AirdropServer>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkAck>, (StatusCode, String)> {
    let metadata = parse_chunk_metadata(&headers)?;

    // Lookup only under the table lock; the guard drops before any I/O.
    let session = match server.sessions.get(&metadata.session_id) {
        Some(entry) => entry.value().clone(),
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown session {}", metadata.session_id),
            ))
        }
    };

    session.touch().await;

    let plaintext = match crypto::aead_open(&body, &session.session_key) {
        Ok(plaintext) => plaintext,
        Err(_) => {
            tracing::warn!(
                session_id = %metadata.session_id,
                index = metadata.index,
                sender = %session.sender_fingerprint,
                "chunk failed to decrypt"
            );
            return Ok(Json(ChunkAck::failure(&metadata, "Decryption failed")));
        }
    };

    if let Err(e) = metadata.verify(&plaintext, session.total_chunks, session.metadata.size) {
        let reason = match &e {
            Error::IntegrityFailed { .. } => "Checksum mismatch".to_string(),
            other => other.to_string(),
        };
        tracing::warn!(
            session_id = %metadata.session_id,
            index = metadata.index,
            sender = %session.sender_fingerprint,
            %reason,
            "chunk rejected"
        );
        return Ok(Json(ChunkAck::failure(&metadata, reason)));
    }

    if let Err(e) = session.write_chunk(metadata.index, &plaintext) {
        tracing::warn!(
            session_id = %metadata.session_id,
            index = metadata.index,
            error = %e,
            "chunk write failed"
        );
        return Ok(Json(ChunkAck::failure(&metadata, "Failed to write chunk")));
    }

    let (received, complete) = session.mark_received(metadata.index).await;
    tracing::debug!(
        session_id = %metadata.session_id,
        index = metadata.index,
        received,
        total = session.total_chunks,
        "chunk written"
    );

    if complete {
        if let Err(e) = session.sync() {
            tracing::warn!(error = %e, "fsync failed on completed transfer");
        }
        let _ = server.sessions.remove(&metadata.session_id);
        server.observer.on_transfer_complete(
            &session.sender_fingerprint,
            &session.path,
            session.metadata.size,
            Direction::Receive,
        );
        tracing::info!(
            session_id = %metadata.session_id,
            path = %session.path.display(),
            bytes = session.metadata.size,
            sender = %session.sender_fingerprint,
            "transfer complete"
        );
    }

    Ok(Json(ChunkAck::success(&metadata)))
}

fn parse_chunk_metadata(headers: &HeaderMap) -> Result<ChunkMetadata, (StatusCode, String)> {
    let raw = headers.get(protocol::CHUNK_METADATA_HEADER).ok_or((
        StatusCode::BAD_REQUEST,
        format!("missing {} header", protocol::CHUNK_METADATA_HEADER),
    ))?;
    let raw = raw.to_str().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("{} header is not valid text", protocol::CHUNK_METADATA_HEADER),
        )
    })?;
    serde_json::from_str(raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid chunk metadata: {e}")))
}

// ── /status ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusQuery {
    session_id: String,
}

async fn handle_status(
    State(server): State<AirdropServer>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<TransferStatus>, (StatusCode, String)> {
    let session = match server.sessions.get(&query.session_id) {
        Some(entry) => entry.value().clone(),
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("unknown session {}", query.session_id),
            ))
        }
    };

    let received_chunks = session.received_indices().await;
    let progress = received_chunks.len() as f64 / session.total_chunks as f64 * 100.0;

    Ok(Json(TransferStatus {
        session_id: query.session_id,
        total_chunks: session.total_chunks,
        received_chunks,
        progress,
        can_resume: true,
    }))
}

// ── Output file allocation ────────────────────────────────────────────────────

/// Strip path components and awkward characters from a sender-supplied name.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let trimmed = base.trim_start_matches('.');

    let clean: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        "received_file".to_string()
    } else {
        clean
    }
}

/// Open the output file, renaming on collision: `name`, `name (1).ext`, …
/// `create_new` makes each claim atomic, so concurrent handshakes cannot
/// race onto the same path.
fn allocate_output_file(dir: &Path, raw_name: &str) -> std::io::Result<(File, PathBuf)> {
    let name = sanitize_filename(raw_name);
    let (stem, extension) = split_name(&name);

    for attempt in 0u32..10_000 {
        let candidate = if attempt == 0 {
            name.clone()
        } else if extension.is_empty() {
            format!("{stem} ({attempt})")
        } else {
            format!("{stem} ({attempt}).{extension}")
        };
        let path = dir.join(candidate);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("too many name collisions for {name}"),
    ))
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, extension),
        _ => (name, ""),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
