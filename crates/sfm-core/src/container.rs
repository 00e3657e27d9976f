//! Encrypted container format.
//!
//! A container is a fixed 64-byte little-endian header followed by the body:
//! a gzip-compressed tar of the source path, encrypted as a sequence of
//! AES-256-GCM frames. Every field and every reserved byte of the header is
//! part of the on-disk format; the layout is pinned with zerocopy and a
//! compile-time size assertion.
//!
//! Body framing: each frame is a `u32` little-endian sealed length followed
//! by `aead_seal` output for up to [`SEGMENT_SIZE`] bytes of plaintext.
//! Every body byte sits under a GCM tag, and segmenting bounds memory while
//! encrypting large trees. On open, any body failure — bad frame length,
//! truncation, tag mismatch — is reported as [`Error::AuthenticationFailed`]
//! so a wrong password and a corrupted file are indistinguishable.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{self, KdfParams, Key, NONCE_SIZE, SALT_SIZE, TAG_SIZE};
use crate::error::Error;

/// Container magic: `S F M 0x00`.
pub const MAGIC: [u8; 4] = *b"SFM\x00";
/// Current container format version.
pub const FORMAT_VERSION: u32 = 1;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 64;
/// Plaintext bytes per AEAD frame in the body.
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

// ── Header ────────────────────────────────────────────────────────────────────

/// The 64-byte container header. Little-endian, bit-exact.
///
/// The salt stored here is the exact salt used to derive the key; it is
/// never regenerated on open. The KDF parameters travel with the container
/// so it is self-describing.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ContainerHeader {
    /// Must equal [`MAGIC`].
    pub magic: [u8; 4],
    /// Format version. Currently 1.
    pub version: U32<LittleEndian>,
    /// Random per-container Argon2id salt.
    pub salt: [u8; SALT_SIZE],
    /// Argon2id iterations.
    pub argon2_time: U32<LittleEndian>,
    /// Argon2id memory cost in KiB.
    pub argon2_memory: U32<LittleEndian>,
    /// Argon2id parallelism.
    pub argon2_threads: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 15],
}

// Compile-time size guard. If this fails, the on-disk format has silently changed.
assert_eq_size!(ContainerHeader, [u8; HEADER_SIZE]);

impl ContainerHeader {
    fn new(salt: [u8; SALT_SIZE], params: &KdfParams) -> Self {
        Self {
            magic: MAGIC,
            version: U32::new(FORMAT_VERSION),
            salt,
            argon2_time: U32::new(params.time),
            argon2_memory: U32::new(params.memory_kib),
            argon2_threads: params.threads,
            reserved: [0u8; 15],
        }
    }

    fn kdf_params(&self) -> KdfParams {
        KdfParams {
            time: self.argon2_time.get(),
            memory_kib: self.argon2_memory.get(),
            threads: self.argon2_threads,
        }
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

/// Pack `source` (a file or directory tree) into an encrypted container.
///
/// Tar entry names are relative paths rooted at the source's base name: a
/// single file produces one entry named `basename`, a directory produces
/// `dirname/...` entries.
pub fn create(source: &Path, container: &Path, password: &str, params: &KdfParams) -> Result<(), Error> {
    params.validate()?;

    let salt = crypto::generate_salt();
    let key = crypto::derive_key(password, &salt, params)?;

    let archive = build_archive(source)?;

    let file = File::create(container)
        .map_err(|e| Error::io(format!("failed to create container {}", container.display()), e))?;
    let mut writer = BufWriter::new(file);

    let header = ContainerHeader::new(salt, params);
    writer
        .write_all(header.as_bytes())
        .map_err(|e| Error::io("failed to write container header", e))?;

    seal_body(&archive, &mut writer, &key)?;

    writer
        .flush()
        .map_err(|e| Error::io("failed to flush container", e))?;
    Ok(())
}

/// Build an in-memory gzip-compressed tar of the source path.
fn build_archive(source: &Path) -> Result<Vec<u8>, Error> {
    let base_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("source path has no base name: {}", source.display())))?;

    let metadata = std::fs::metadata(source)
        .map_err(|e| Error::io(format!("failed to stat {}", source.display()), e))?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    if metadata.is_dir() {
        builder
            .append_dir_all(base_name, source)
            .map_err(|e| Error::io(format!("failed to archive {}", source.display()), e))?;
    } else {
        builder
            .append_path_with_name(source, base_name)
            .map_err(|e| Error::io(format!("failed to archive {}", source.display()), e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io("failed to finish archive", e))?;
    encoder
        .finish()
        .map_err(|e| Error::io("failed to finish compression", e))
}

fn seal_body<W: Write>(archive: &[u8], writer: &mut W, key: &Key) -> Result<(), Error> {
    for segment in archive.chunks(SEGMENT_SIZE) {
        let sealed = crypto::aead_seal(segment, key)?;
        let len = sealed.len() as u32;
        writer
            .write_all(&len.to_le_bytes())
            .map_err(|e| Error::io("failed to write container body", e))?;
        writer
            .write_all(&sealed)
            .map_err(|e| Error::io("failed to write container body", e))?;
    }
    Ok(())
}

// ── Open ──────────────────────────────────────────────────────────────────────

/// Decrypt a container and extract its tree under `output`.
///
/// The magic and version are checked before the key-derivation path is
/// touched. Past the header, every failure decrypting the body surfaces as
/// [`Error::AuthenticationFailed`] — a wrong password and a corrupted
/// container must not be distinguishable.
pub fn open(container: &Path, output: &Path, password: &str) -> Result<(), Error> {
    let file = File::open(container)
        .map_err(|e| Error::io(format!("failed to open container {}", container.display()), e))?;
    let mut reader = BufReader::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|_| Error::InvalidFormat("container shorter than header".into()))?;
    let header = ContainerHeader::read_from(&header_bytes[..])
        .ok_or_else(|| Error::InvalidFormat("malformed container header".into()))?;

    let magic = header.magic;
    if magic != MAGIC {
        return Err(Error::InvalidFormat("not an SFM container".into()));
    }
    let version = header.version.get();
    if version != FORMAT_VERSION {
        return Err(Error::InvalidFormat(format!(
            "unsupported container version {version}"
        )));
    }

    let salt = header.salt;
    let key = crypto::derive_key(password, &salt, &header.kdf_params())?;

    let archive = open_body(&mut reader, &key)?;
    extract_archive(&archive, output)
}

fn open_body<R: Read>(reader: &mut R, key: &Key) -> Result<Vec<u8>, Error> {
    let max_sealed = SEGMENT_SIZE + NONCE_SIZE + TAG_SIZE;
    let mut plaintext = Vec::new();
    let mut len_buf = [0u8; 4];

    loop {
        if !read_frame_len(reader, &mut len_buf)? {
            break;
        }
        let sealed_len = u32::from_le_bytes(len_buf) as usize;
        if sealed_len < NONCE_SIZE + TAG_SIZE || sealed_len > max_sealed {
            return Err(Error::AuthenticationFailed);
        }

        let mut sealed = vec![0u8; sealed_len];
        reader
            .read_exact(&mut sealed)
            .map_err(|_| Error::AuthenticationFailed)?;

        let segment = crypto::aead_open(&sealed, key)?;
        plaintext.extend_from_slice(&segment);
    }

    Ok(plaintext)
}

/// Read a 4-byte frame length. Returns false at a clean end of body; a
/// partial length prefix counts as corruption.
fn read_frame_len<R: Read>(reader: &mut R, buf: &mut [u8; 4]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|_| Error::AuthenticationFailed)?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::AuthenticationFailed);
        }
        filled += n;
    }
    Ok(true)
}

fn extract_archive(archive: &[u8], output: &Path) -> Result<(), Error> {
    let gz = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(gz);

    let entries = tar
        .entries()
        .map_err(|e| Error::io("failed to read archive", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io("failed to read archive entry", e))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::InvalidFormat(format!("unreadable archive entry name: {e}")))?
            .into_owned();
        let target = safe_join(output, &entry_path)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
                }
                let mut out = File::create(&target)
                    .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| Error::io(format!("failed to write {}", target.display()), e))?;
            }
            // Links, FIFOs, and other entry types are silently skipped.
            _ => {}
        }
    }

    Ok(())
}

/// Join a tar entry path onto the output root, rejecting absolute paths and
/// parent-directory components.
fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf, Error> {
    let mut target = root.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidFormat(format!(
                    "archive entry escapes output directory: {}",
                    entry.display()
                )))
            }
        }
    }
    Ok(target)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
