//! sfm-airdrop — secure LAN file transfer over HTTP.
//!
//! A transfer is one handshake plus a stream of independently encrypted
//! chunks. The handshake is signed with the sender's long-lived Ed25519
//! identity and agrees a per-transfer AES-256-GCM key via ephemeral X25519,
//! so session traffic has forward secrecy. The receiver tracks which chunks
//! have landed; a sender that disconnects can query `/status` and send only
//! what is missing.
//!
//! Four HTTP endpoints: `GET /ping`, `POST /handshake`, `POST /chunk`,
//! `GET /status`. Only `/ping` carries no session semantics.

pub mod client;
pub mod discovery;
pub mod error;
pub mod observer;
pub mod server;
pub mod session;
pub mod trust;

pub use client::{AirdropClient, Transfer};
pub use error::TransferError;
pub use observer::{Direction, NoopObserver, TransferObserver};
pub use server::{AcceptCallback, AirdropServer, TransferOffer};
pub use session::{new_session_table, SessionTable, TransferSession};
pub use trust::{TofuStore, TrustCheck};
