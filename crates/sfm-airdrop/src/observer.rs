//! Completion observer — the seam for external bookkeeping.
//!
//! Transfer history, paired-device records, and any other persistence live
//! outside this crate; the server reports completed transfers through this
//! trait and carries no database dependency of its own.

use std::path::Path;

/// Which way the bytes moved, from this device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Receives a callback once per completed transfer.
pub trait TransferObserver: Send + Sync {
    fn on_transfer_complete(
        &self,
        _peer_fingerprint: &str,
        _path: &Path,
        _bytes: u64,
        _direction: Direction,
    ) {
    }
}

/// Observer that records nothing.
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}
