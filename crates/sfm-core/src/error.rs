//! Error kinds the core reports upward.

/// Errors produced by the container engine, crypto primitives, identity
/// store, and protocol validation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed on-disk or on-wire data: bad magic, unsupported version,
    /// inconsistent key files, out-of-range chunk metadata.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// AEAD tag verification failed. For a container this is
    /// indistinguishable from a wrong password, and the message is
    /// deliberately identical for both causes.
    #[error("wrong password or corrupted container")]
    AuthenticationFailed,

    /// Chunk checksum mismatch after successful decryption.
    #[error("integrity check failed for chunk {index}")]
    IntegrityFailed { index: u32 },

    /// An underlying read or write failed. The context names the operation;
    /// the source error is preserved untransformed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Rejected inputs: KDF parameters out of range, a zero-size file, a
    /// source path with no usable name.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error with the operation that failed.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
