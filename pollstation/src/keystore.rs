//! Write-once storage for poll keys and terminal signatures.
//!
//! For each poll two records exist, keyed by the qualified poll id: the
//! private poll key, written on start, and the signature of the first stop
//! artifact, written on stop. Both are immutable once written.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("a key for the poll already exists")]
    KeyExists,

    #[error("no key for the poll exists")]
    NoKey,

    #[error("a different signature is already stored for the poll")]
    SignatureMismatch,

    #[error("key store io: {0}")]
    Io(#[from] io::Error),
}

pub trait KeyStore: Send + Sync {
    /// Stores the private poll key. Fails with `KeyExists` if a key is
    /// already stored under the id.
    fn save_key(&self, id: &str, key: &[u8]) -> Result<(), KeyStoreError>;

    /// Returns the private poll key, `None` for an unknown poll.
    fn load_key(&self, id: &str) -> Result<Option<Vec<u8>>, KeyStoreError>;

    /// Makes sure no other signature is stored for the poll: stores the
    /// signature on first call, compares byte-for-byte afterwards. Fails
    /// with `NoKey` if no key exists for the id.
    fn validate_signature(&self, id: &str, signature: &[u8]) -> Result<(), KeyStoreError>;

    /// Removes both records. Safe on unknown polls.
    fn clear_poll(&self, id: &str) -> Result<(), KeyStoreError>;
}

/// Key store backed by a single mutexed map pair.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    records: Mutex<MemoryRecords>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    keys: HashMap<String, Vec<u8>>,
    signatures: HashMap<String, Vec<u8>>,
}

impl KeyStore for MemoryKeyStore {
    fn save_key(&self, id: &str, key: &[u8]) -> Result<(), KeyStoreError> {
        let mut records = self.records.lock().unwrap();
        if records.keys.contains_key(id) {
            return Err(KeyStoreError::KeyExists);
        }
        records.keys.insert(id.to_string(), key.to_vec());
        Ok(())
    }

    fn load_key(&self, id: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        Ok(self.records.lock().unwrap().keys.get(id).cloned())
    }

    fn validate_signature(&self, id: &str, signature: &[u8]) -> Result<(), KeyStoreError> {
        let mut records = self.records.lock().unwrap();
        if !records.keys.contains_key(id) {
            return Err(KeyStoreError::NoKey);
        }
        match records.signatures.get(id) {
            Some(stored) if stored == signature => Ok(()),
            Some(_) => Err(KeyStoreError::SignatureMismatch),
            None => {
                records.signatures.insert(id.to_string(), signature.to_vec());
                Ok(())
            }
        }
    }

    fn clear_poll(&self, id: &str) -> Result<(), KeyStoreError> {
        let mut records = self.records.lock().unwrap();
        records.keys.remove(id);
        records.signatures.remove(id);
        Ok(())
    }
}

/// Key store writing each record to its own read-only file.
///
/// Keys live at `<root>/<escaped-id>_key`, signatures at
/// `<root>/<escaped-id>_hash`. Files are created with `O_CREATE|O_EXCL` so
/// the filesystem enforces write-once; all access is serialized by one
/// process-wide mutex.
#[derive(Debug)]
pub struct FsKeyStore {
    guard: Mutex<()>,
    root: PathBuf,
}

impl FsKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> FsKeyStore {
        FsKeyStore {
            guard: Mutex::new(()),
            root: root.into(),
        }
    }

    fn key_file(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}_key", escape(id)))
    }

    fn hash_file(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}_hash", escape(id)))
    }
}

fn escape(id: &str) -> String {
    id.replace('/', "_")
}

fn create_exclusive(path: &Path, content: &[u8]) -> Result<(), KeyStoreError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o400);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, KeyStoreError> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), KeyStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl KeyStore for FsKeyStore {
    fn save_key(&self, id: &str, key: &[u8]) -> Result<(), KeyStoreError> {
        let _guard = self.guard.lock().unwrap();
        fs::create_dir_all(&self.root)?;
        match create_exclusive(&self.key_file(id), key) {
            Err(KeyStoreError::Io(err)) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(KeyStoreError::KeyExists)
            }
            other => other,
        }
    }

    fn load_key(&self, id: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        let _guard = self.guard.lock().unwrap();
        read_optional(&self.key_file(id))
    }

    fn validate_signature(&self, id: &str, signature: &[u8]) -> Result<(), KeyStoreError> {
        let _guard = self.guard.lock().unwrap();
        if read_optional(&self.key_file(id))?.is_none() {
            return Err(KeyStoreError::NoKey);
        }
        match create_exclusive(&self.hash_file(id), signature) {
            Ok(()) => Ok(()),
            Err(KeyStoreError::Io(err)) if err.kind() == io::ErrorKind::AlreadyExists => {
                let stored = read_optional(&self.hash_file(id))?.unwrap_or_default();
                if stored == signature {
                    Ok(())
                } else {
                    Err(KeyStoreError::SignatureMismatch)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn clear_poll(&self, id: &str) -> Result<(), KeyStoreError> {
        let _guard = self.guard.lock().unwrap();
        remove_optional(&self.key_file(id))?;
        remove_optional(&self.hash_file(id))
    }
}
