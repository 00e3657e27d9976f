//! End-to-end transfer tests: a real server on a loopback port driven by the
//! real client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use sfm_airdrop::{
    AirdropClient, AirdropServer, Direction, TofuStore, TransferError, TransferObserver,
};
use sfm_core::identity::DeviceIdentity;
use sfm_core::protocol::{self, ChunkMetadata, CHUNK_SIZE};
use sfm_core::{crypto, Error};

fn test_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sfm-e2e-{label}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn receiver_server(dir: &Path) -> AirdropServer {
    let identity_dir = dir.join("receiver-identity");
    let identity = Arc::new(DeviceIdentity::load_or_generate(&identity_dir).unwrap());
    let trust = Arc::new(TofuStore::open(identity_dir.join("trusted_devices.json")).unwrap());
    std::fs::create_dir_all(dir.join("downloads")).unwrap();
    AirdropServer::new("receiver", identity, dir.join("downloads"), trust)
}

fn sender_client(dir: &Path) -> AirdropClient {
    let identity = Arc::new(DeviceIdentity::load_or_generate(&dir.join("sender-identity")).unwrap());
    AirdropClient::new("sender", identity).unwrap()
}

/// Bind the server on an ephemeral loopback port and return its address.
async fn spawn(server: AirdropServer) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server.router()).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_reports_identity() {
    let dir = test_dir("ping");
    let server = receiver_server(&dir);
    let fingerprint = {
        let identity =
            DeviceIdentity::load_or_generate(&dir.join("receiver-identity")).unwrap();
        identity.fingerprint().to_string()
    };
    let addr = spawn(server).await;

    let client = sender_client(&dir);
    let ping = client.ping(&addr).await.unwrap();
    assert_eq!(ping.device_name, "receiver");
    assert_eq!(ping.fingerprint, fingerprint);
    assert_eq!(ping.fingerprint.len(), 47);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn ten_byte_file_is_one_chunk() {
    let dir = test_dir("ten-byte");
    let addr = spawn(receiver_server(&dir)).await;

    let source = dir.join("data.txt");
    std::fs::write(&source, b"abcdefghij").unwrap();

    let client = sender_client(&dir);
    let transfer = client.offer(&addr, &source).await.unwrap();
    assert_eq!(transfer.total_chunks(), 1);
    transfer.send_all(None).await.unwrap();

    let received = std::fs::read(dir.join("downloads/data.txt")).unwrap();
    assert_eq!(received, b"abcdefghij");

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn six_mib_file_is_two_chunks() {
    let dir = test_dir("six-mib");
    let addr = spawn(receiver_server(&dir)).await;

    let payload = vec![0x41u8; 6 * 1024 * 1024];
    let source = dir.join("big.bin");
    std::fs::write(&source, &payload).unwrap();

    let client = sender_client(&dir);
    let sent = Arc::new(AtomicUsize::new(0));
    let sent_cb = sent.clone();

    let transfer = client.offer(&addr, &source).await.unwrap();
    assert_eq!(transfer.total_chunks(), 2);
    let progress = move |done: u32, total: u32| {
        assert_eq!(total, 2);
        sent_cb.store(done as usize, Ordering::SeqCst);
    };
    transfer.send_all(Some(&progress)).await.unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 2);

    let received = std::fs::read(dir.join("downloads/big.bin")).unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(sha256(&received), sha256(&payload));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tampered_chunk_is_rejected_and_not_written() {
    let dir = test_dir("tamper");
    let addr = spawn(receiver_server(&dir)).await;

    // 6 MiB: chunk 0 full of 0x41, chunk 1 is 2 MiB of 0x42.
    let mut payload = vec![0x41u8; CHUNK_SIZE as usize];
    payload.extend(vec![0x42u8; 2 * 1024 * 1024]);
    let source = dir.join("big.bin");
    std::fs::write(&source, &payload).unwrap();

    let client = sender_client(&dir);
    let transfer = client.offer(&addr, &source).await.unwrap();

    // Chunk 0 goes through normally.
    transfer.send_chunks(&[0]).await.unwrap();

    // Chunk 1 is sent by hand with a flipped ciphertext byte.
    let chunk1 = &payload[CHUNK_SIZE as usize..];
    let mut sealed = crypto::aead_seal(chunk1, transfer.session_key()).unwrap();
    sealed[crypto::NONCE_SIZE + 100] ^= 0xFF;

    let metadata = ChunkMetadata {
        index: 1,
        total: 2,
        size: chunk1.len() as u32,
        checksum: protocol::chunk_checksum(chunk1),
        session_id: transfer.session_id().to_string(),
    };

    let http = reqwest::Client::new();
    let ack: protocol::ChunkAck = http
        .post(format!("http://{addr}/chunk"))
        .header(
            protocol::CHUNK_METADATA_HEADER,
            serde_json::to_string(&metadata).unwrap(),
        )
        .body(sealed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("Decryption failed"));

    // The receiver must not have written anything at offset 4 MiB.
    let status = transfer.status().await.unwrap();
    assert_eq!(status.received_chunks, vec![0]);
    let partial = std::fs::read(dir.join("downloads/big.bin")).unwrap();
    assert!(partial.len() <= CHUNK_SIZE as usize);

    // A wrong checksum with valid encryption is also rejected, with the
    // pinned error string.
    let mut bad_metadata = metadata.clone();
    bad_metadata.checksum = protocol::chunk_checksum(b"not the chunk");
    let sealed = crypto::aead_seal(chunk1, transfer.session_key()).unwrap();
    let ack: protocol::ChunkAck = http
        .post(format!("http://{addr}/chunk"))
        .header(
            protocol::CHUNK_METADATA_HEADER,
            serde_json::to_string(&bad_metadata).unwrap(),
        )
        .body(sealed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("Checksum mismatch"));

    // Sending the honest chunk afterwards completes the transfer intact.
    transfer.send_chunks(&[1]).await.unwrap();
    let received = std::fs::read(dir.join("downloads/big.bin")).unwrap();
    assert_eq!(sha256(&received), sha256(&payload));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn resume_sends_only_missing_chunks() {
    let dir = test_dir("resume");
    let addr = spawn(receiver_server(&dir)).await;

    // 9 MiB: three chunks (4 + 4 + 1).
    let payload: Vec<u8> = (0..9 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let source = dir.join("resume.bin");
    std::fs::write(&source, &payload).unwrap();

    let client = sender_client(&dir);
    let transfer = client.offer(&addr, &source).await.unwrap();
    assert_eq!(transfer.total_chunks(), 3);

    // Send chunks 0 and 2, then "disconnect".
    transfer.send_chunks(&[0, 2]).await.unwrap();

    let status = transfer.status().await.unwrap();
    assert_eq!(status.received_chunks, vec![0, 2]);
    assert_eq!(status.total_chunks, 3);
    assert!(status.can_resume);
    assert!((status.progress - 2.0 / 3.0 * 100.0).abs() < 0.01);

    // Resume: only chunk 1 goes over the wire, and the file completes.
    transfer.send_missing().await.unwrap();

    let received = std::fs::read(dir.join("downloads/resume.bin")).unwrap();
    assert_eq!(sha256(&received), sha256(&payload));

    // The completed session is gone.
    assert!(matches!(
        transfer.status().await,
        Err(TransferError::UnknownSession(_))
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn repeated_transfer_renames_instead_of_overwriting() {
    let dir = test_dir("rename");
    let addr = spawn(receiver_server(&dir)).await;

    let source = dir.join("data.txt");
    std::fs::write(&source, b"abcdefghij").unwrap();

    let client = sender_client(&dir);
    client.send_file(&addr, &source, None).await.unwrap();
    client.send_file(&addr, &source, None).await.unwrap();

    assert_eq!(
        std::fs::read(dir.join("downloads/data.txt")).unwrap(),
        b"abcdefghij"
    );
    assert_eq!(
        std::fs::read(dir.join("downloads/data (1).txt")).unwrap(),
        b"abcdefghij"
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn zero_size_file_is_refused() {
    let dir = test_dir("zero");
    let addr = spawn(receiver_server(&dir)).await;

    let source = dir.join("empty.txt");
    std::fs::write(&source, b"").unwrap();

    let client = sender_client(&dir);
    let err = client.offer(&addr, &source).await.unwrap_err();
    assert!(matches!(err, TransferError::Core(Error::Config(_))));

    // A sender that skips the client-side check is refused by the server.
    let identity =
        Arc::new(DeviceIdentity::load_or_generate(&dir.join("sender-identity")).unwrap());
    let (_, ephemeral_public) = crypto::ephemeral_keypair();
    let request = protocol::HandshakeRequest::new_signed(
        &identity,
        "sender",
        ephemeral_public.to_bytes(),
        protocol::FileMetadata {
            name: "empty.txt".into(),
            size: 0,
            mime: "application/octet-stream".into(),
        },
    )
    .unwrap();

    let response: protocol::HandshakeResponse = reqwest::Client::new()
        .post(format!("http://{addr}/handshake"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!response.accepted);
    assert!(response.message.unwrap().contains("zero-size"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn rejected_handshake_surfaces_receiver_message() {
    let dir = test_dir("reject");
    let server = receiver_server(&dir).with_accept_callback(Arc::new(|_| false));
    let addr = spawn(server).await;

    let source = dir.join("data.txt");
    std::fs::write(&source, b"abcdefghij").unwrap();

    let client = sender_client(&dir);
    match client.offer(&addr, &source).await {
        Err(TransferError::Rejected(message)) => {
            assert_eq!(message, "Transfer rejected by user");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn forged_signature_is_rejected() {
    let dir = test_dir("forged");
    let addr = spawn(receiver_server(&dir)).await;

    let identity =
        Arc::new(DeviceIdentity::load_or_generate(&dir.join("sender-identity")).unwrap());
    let (_, ephemeral_public) = crypto::ephemeral_keypair();
    let mut request = protocol::HandshakeRequest::new_signed(
        &identity,
        "sender",
        ephemeral_public.to_bytes(),
        protocol::FileMetadata {
            name: "data.txt".into(),
            size: 10,
            mime: "application/octet-stream".into(),
        },
    )
    .unwrap();

    // Change the offer after signing.
    request.file_metadata.size = 11;

    let response: protocol::HandshakeResponse = reqwest::Client::new()
        .post(format!("http://{addr}/handshake"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!response.accepted);
    assert!(response.message.unwrap().contains("signature"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn chunk_for_unknown_session_is_a_protocol_error() {
    let dir = test_dir("unknown-session");
    let addr = spawn(receiver_server(&dir)).await;

    let metadata = ChunkMetadata {
        index: 0,
        total: 1,
        size: 1,
        checksum: protocol::chunk_checksum(b"x"),
        session_id: "no-such-session".into(),
    };

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/chunk"))
        .header(
            protocol::CHUNK_METADATA_HEADER,
            serde_json::to_string(&metadata).unwrap(),
        )
        .body(vec![0u8; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn idle_sessions_are_discarded() {
    let dir = test_dir("idle");
    let server = receiver_server(&dir).with_idle_timeout(Duration::from_millis(50));
    let sweeper = server.clone();
    let addr = spawn(server).await;

    let source = dir.join("data.txt");
    std::fs::write(&source, b"abcdefghij").unwrap();

    let client = sender_client(&dir);
    let transfer = client.offer(&addr, &source).await.unwrap();
    assert_eq!(sweeper.sessions().len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    sweeper.evict_idle_sessions().await;

    assert!(sweeper.sessions().is_empty());
    assert!(matches!(
        transfer.status().await,
        Err(TransferError::UnknownSession(_))
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn completion_notifies_observer() {
    struct Recorder(std::sync::Mutex<Vec<(String, PathBuf, u64)>>);

    impl TransferObserver for Recorder {
        fn on_transfer_complete(
            &self,
            peer_fingerprint: &str,
            path: &Path,
            bytes: u64,
            direction: Direction,
        ) {
            assert_eq!(direction, Direction::Receive);
            self.0
                .lock()
                .unwrap()
                .push((peer_fingerprint.to_string(), path.to_path_buf(), bytes));
        }
    }

    let dir = test_dir("observer");
    let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
    let server = receiver_server(&dir).with_observer(recorder.clone());
    let addr = spawn(server).await;

    let source = dir.join("data.txt");
    std::fs::write(&source, b"abcdefghij").unwrap();

    let client = sender_client(&dir);
    let sender_fingerprint = {
        DeviceIdentity::load_or_generate(&dir.join("sender-identity"))
            .unwrap()
            .fingerprint()
            .to_string()
    };
    client.send_file(&addr, &source, None).await.unwrap();

    let events = recorder.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (fingerprint, path, bytes) = &events[0];
    assert_eq!(fingerprint, &sender_fingerprint);
    assert_eq!(path, &dir.join("downloads/data.txt"));
    assert_eq!(*bytes, 10);

    let _ = std::fs::remove_dir_all(&dir);
}
