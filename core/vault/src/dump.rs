//! Encrypted dump files.
//!
//! Layout (integers big-endian):
//!
//! ```text
//! magic       6 bytes   "KLDUMP"
//! version     u16
//! kdf params  3 x u32   memory_cost, time_cost, parallelism
//! salt        32 bytes
//! nonce       24 bytes
//! length      u64       ciphertext length
//! ciphertext  length bytes
//! ```
//!
//! Magic through salt are bound to the ciphertext as associated data.
//!
//! The dump key is derived from the dump password with a fresh salt on
//! every write. Files are replaced atomically: the new dump is written to a
//! temporary file in the same directory, synced and renamed over the old one.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::record::Snapshot;
use keylock_common::{Error, Result};
use keylock_crypto::{
    decrypt_with_aad, derive_key, encrypt_with_aad, KdfParams, Nonce, Salt, NONCE_SIZE,
    SALT_LENGTH,
};

/// Magic bytes at the start of every dump file.
pub const DUMP_MAGIC: &[u8; 6] = b"KLDUMP";

/// Current dump format version.
pub const DUMP_FORMAT_VERSION: u16 = 1;

/// Length of the fixed header.
pub const HEADER_LEN: usize = 6 + 2 + 12 + SALT_LENGTH + NONCE_SIZE + 8;

/// Serialize and encrypt `snapshot` into dump file bytes.
///
/// # Errors
/// - `InvalidInput` if `dump_password` is empty or `kdf_params` are out of range
/// - KDF or encryption failure
pub fn encode(snapshot: &Snapshot, dump_password: &[u8], kdf_params: &KdfParams) -> Result<Vec<u8>> {
    if !kdf_params.is_within_limits() {
        return Err(Error::InvalidInput(
            "KDF parameters exceed what a dump can be restored with".to_string(),
        ));
    }
    let salt = Salt::generate();
    let key = derive_key(dump_password, &salt, kdf_params)?;

    let payload = Zeroizing::new(
        serde_json::to_vec(snapshot).map_err(|e| Error::Serialization(e.to_string()))?,
    );

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(DUMP_MAGIC);
    header.extend_from_slice(&DUMP_FORMAT_VERSION.to_be_bytes());
    header.extend_from_slice(&kdf_params.memory_cost.to_be_bytes());
    header.extend_from_slice(&kdf_params.time_cost.to_be_bytes());
    header.extend_from_slice(&kdf_params.parallelism.to_be_bytes());
    header.extend_from_slice(salt.as_bytes());

    let (ciphertext, nonce) = encrypt_with_aad(key.as_bytes(), &payload, &header)?;

    let mut out = header;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(ciphertext.len() as u64).to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt and parse dump file bytes.
///
/// # Errors
/// - `CorruptFormat` for bad magic, unsupported version, out-of-range KDF
///   parameters, truncation or an unparseable payload
/// - `AuthFailure` if the dump password is wrong or the file was tampered with
pub fn decode(bytes: &[u8], dump_password: &[u8]) -> Result<Snapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::CorruptFormat("dump header is truncated".to_string()));
    }

    let mut reader = HeaderReader::new(bytes);
    if reader.take(DUMP_MAGIC.len()) != DUMP_MAGIC {
        return Err(Error::CorruptFormat("not a dump file".to_string()));
    }
    let version = reader.u16();
    if version != DUMP_FORMAT_VERSION {
        return Err(Error::CorruptFormat(format!(
            "unsupported dump version {}",
            version
        )));
    }
    let kdf_params = KdfParams {
        memory_cost: reader.u32(),
        time_cost: reader.u32(),
        parallelism: reader.u32(),
    };
    // The header is not authenticated until after the KDF has run.
    if !kdf_params.is_within_limits() {
        return Err(Error::CorruptFormat("kdf parameters out of range".to_string()));
    }
    let mut salt = [0u8; SALT_LENGTH];
    salt.copy_from_slice(reader.take(SALT_LENGTH));
    let aad_len = reader.position();

    let mut nonce: Nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(reader.take(NONCE_SIZE));
    let declared_len = reader.u64();
    let ciphertext = reader.rest();
    if ciphertext.len() as u64 != declared_len {
        return Err(Error::CorruptFormat(format!(
            "dump body is {} bytes, header declares {}",
            ciphertext.len(),
            declared_len
        )));
    }

    let key = derive_key(dump_password, &Salt::from_bytes(salt), &kdf_params).map_err(|e| {
        match e {
            Error::Crypto(msg) => Error::CorruptFormat(msg),
            other => other,
        }
    })?;

    let payload = Zeroizing::new(decrypt_with_aad(
        key.as_bytes(),
        ciphertext,
        &nonce,
        &bytes[..aad_len],
    )?);

    serde_json::from_slice(&payload)
        .map_err(|e| Error::CorruptFormat(format!("dump payload is unreadable: {}", e)))
}

/// Write `snapshot` to `dump_path`, atomically replacing any existing dump.
///
/// Blocking: call from a blocking context.
///
/// # Postconditions
/// - On success, `dump_path` holds the new dump and has been synced
/// - On failure, any previous dump at `dump_path` is left untouched
pub fn dump(
    snapshot: &Snapshot,
    dump_path: &Path,
    dump_password: &[u8],
    kdf_params: &KdfParams,
) -> Result<()> {
    let bytes = encode(snapshot, dump_password, kdf_params)?;
    write_atomic(dump_path, &bytes)?;
    info!(
        path = %dump_path.display(),
        records = snapshot.state.len(),
        size = bytes.len(),
        "Dump written"
    );
    Ok(())
}

/// Read and decrypt the dump at `dump_path`.
///
/// Blocking: call from a blocking context.
///
/// # Returns
/// `None` if no dump exists yet (first run).
///
/// # Errors
/// - `AuthFailure`, `CorruptFormat` as for [`decode`]
/// - `Io` if the file exists but cannot be read
pub fn restore(dump_path: &Path, dump_password: &[u8]) -> Result<Option<Snapshot>> {
    let bytes = match fs::read(dump_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %dump_path.display(), "No dump found, starting empty");
            return Ok(None);
        }
        Err(e) => return Err(Error::Io(e)),
    };

    match decode(&bytes, dump_password) {
        Ok(snapshot) => {
            info!(
                path = %dump_path.display(),
                records = snapshot.state.len(),
                "Dump restored"
            );
            Ok(Some(snapshot))
        }
        Err(e) => {
            warn!(path = %dump_path.display(), error = %e, "Dump restore failed");
            Err(e)
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    debug!(path = %path.display(), "Dump file renamed into place");

    // Make the rename itself durable.
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;

    Ok(())
}

/// Cursor over a header that is known to be at least `HEADER_LEN` long.
struct HeaderReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    fn u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2));
        u16::from_be_bytes(buf)
    }

    fn u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4));
        u32::from_be_bytes(buf)
    }

    fn u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8));
        u64::from_be_bytes(buf)
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Metadata;
    use crate::store::KeyVault;
    use keylock_common::KeyId;

    fn fast() -> KdfParams {
        KdfParams {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    async fn populated_snapshot() -> Snapshot {
        let vault = KeyVault::open(b"helloworld", fast(), None).unwrap();
        let meta = Metadata::from([("owner".to_string(), "ops".to_string())]);
        vault
            .put(KeyId::new("k1").unwrap(), &[0x11; 16], meta)
            .await
            .unwrap();
        vault
            .put(KeyId::new("k2").unwrap(), b"second key", Metadata::new())
            .await
            .unwrap();
        vault.snapshot().await
    }

    #[tokio::test]
    async fn test_dump_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.dump");
        let snapshot = populated_snapshot().await;

        dump(&snapshot, &path, b"dump-pw", &fast()).unwrap();
        let restored = restore(&path, b"dump-pw").unwrap().unwrap();

        let vault = KeyVault::open(b"helloworld", fast(), Some(restored)).unwrap();
        assert_eq!(
            vault.get(&KeyId::new("k1").unwrap()).await.unwrap().as_slice(),
            &[0x11; 16]
        );
        assert_eq!(
            vault.get(&KeyId::new("k2").unwrap()).await.unwrap().as_slice(),
            b"second key"
        );
        let listed = vault.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].metadata["owner"], "ops");
    }

    #[test]
    fn test_missing_dump_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let restored = restore(&dir.path().join("absent.dump"), b"pw").unwrap();
        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_wrong_dump_password_is_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.dump");
        dump(&populated_snapshot().await, &path, b"dump-pw", &fast()).unwrap();

        assert!(matches!(restore(&path, b"other-pw"), Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_truncated_dump_is_corrupt() {
        let bytes = encode(&populated_snapshot().await, b"pw", &fast()).unwrap();

        assert!(matches!(
            decode(&bytes[..HEADER_LEN - 1], b"pw"),
            Err(Error::CorruptFormat(_))
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 10], b"pw"),
            Err(Error::CorruptFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_magic_and_version_are_corrupt() {
        let bytes = encode(&populated_snapshot().await, b"pw", &fast()).unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic, b"pw"), Err(Error::CorruptFormat(_))));

        let mut bad_version = bytes.clone();
        bad_version[7] = 9;
        assert!(matches!(decode(&bad_version, b"pw"), Err(Error::CorruptFormat(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_kdf_header_is_corrupt() {
        let bytes = encode(&populated_snapshot().await, b"pw", &fast()).unwrap();

        for range in [8..12, 12..16, 16..20] {
            let mut bad = bytes.clone();
            bad[range].copy_from_slice(&u32::MAX.to_be_bytes());
            assert!(matches!(decode(&bad, b"pw"), Err(Error::CorruptFormat(_))));
        }

        let mut zero_time = bytes.clone();
        zero_time[12..16].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(decode(&zero_time, b"pw"), Err(Error::CorruptFormat(_))));
    }

    #[tokio::test]
    async fn test_tampered_body_is_auth_failure() {
        let mut bytes = encode(&populated_snapshot().await, b"pw", &fast()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(decode(&bytes, b"pw"), Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_fresh_salt_per_dump() {
        let snapshot = populated_snapshot().await;
        let a = encode(&snapshot, b"pw", &fast()).unwrap();
        let b = encode(&snapshot, b"pw", &fast()).unwrap();

        assert_ne!(&a[20..20 + SALT_LENGTH], &b[20..20 + SALT_LENGTH]);
    }

    #[tokio::test]
    async fn test_dump_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.dump");
        let snapshot = populated_snapshot().await;

        dump(&snapshot, &path, b"pw", &fast()).unwrap();
        dump(&snapshot, &path, b"pw", &fast()).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(restore(&path, b"pw").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_dump_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.dump");
        let snapshot = populated_snapshot().await;
        dump(&snapshot, &path, b"pw", &fast()).unwrap();
        let before = fs::read(&path).unwrap();

        // An empty dump password fails before anything touches the disk.
        assert!(dump(&snapshot, &path, b"", &fast()).is_err());
        assert_eq!(fs::read(&path).unwrap(), before);
    }
}
