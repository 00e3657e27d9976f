//! Transfer-layer errors.

/// Errors surfaced by the AirDrop client and server.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Core(#[from] sfm_core::Error),

    /// Receiver refused the handshake. The message is the receiver's,
    /// verbatim.
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// The receiver no longer knows this session; re-handshake to continue.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The receiver rejected one chunk; the send loop stops at it.
    #[error("chunk {index} rejected by receiver: {reason}")]
    ChunkRejected { index: u32, reason: String },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with something that is not the protocol.
    #[error("malformed peer response: {0}")]
    InvalidResponse(String),

    #[error("discovery error: {0}")]
    Discovery(#[from] mdns_sd::Error),
}
