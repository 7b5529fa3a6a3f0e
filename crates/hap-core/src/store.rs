//! Persistent key/value store for accessory state.
//!
//! The accessory keeps its long-term Ed25519 key pair, its device identifier
//! and one record per controller pairing in a byte-blob store. Records are
//! JSON; pairing keys are `hex(controller-name).pairing`, the key pair lives
//! under `keypair` and the schema version under `schema` (`"1"` is current).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Byte-blob store contract. Operations are atomic per key.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Keys whose name ends with `suffix`.
    fn keys_with_suffix(&self, suffix: &str) -> Result<Vec<String>>;
}

/// Long-term accessory Ed25519 key pair.
///
/// `private` is the 64-byte expanded form (seed followed by public key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// Controllers may be plain users or admins.
pub const PERMISSION_USER: u8 = 0x00;
pub const PERMISSION_ADMIN: u8 = 0x01;

/// A persisted trust record for one controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pairing {
    pub name: String,
    pub public_key: Vec<u8>,
    pub permission: u8,
}

impl Pairing {
    pub fn is_admin(&self) -> bool {
        self.permission == PERMISSION_ADMIN
    }
}

/// In-memory store, used by tests and throwaway accessories.
#[derive(Default)]
pub struct MemStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()).into())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    fn keys_with_suffix(&self, suffix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.ends_with(suffix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Filesystem store keeping one file per key inside a directory.
pub struct FsStore {
    path: PathBuf,
}

impl FsStore {
    /// Create the store, preparing the directory if needed.
    ///
    /// The execute bit must be set on created directories so files inside
    /// them can be opened.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref()).map_err(StoreError::Io)?;
        Ok(Self {
            path: dir.as_ref().to_path_buf(),
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.path.join(sanitize_filename(key))
    }
}

impl Store for FsStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        // fs::write truncates before writing. The stored blobs shrink when a
        // pairing loses fields, so writing without truncation would leave
        // trailing bytes of the previous record.
        fs::write(self.file_path(key), value).map_err(StoreError::Io)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.file_path(key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()).into())
            }
            Err(e) => Err(StoreError::Io(e).into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.file_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e).into()),
        }
    }

    fn keys_with_suffix(&self, suffix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(StoreError::Io)? {
            let entry = entry.map_err(StoreError::Io)?;
            if entry.file_type().map_err(StoreError::Io)?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.ends_with(suffix) {
                        keys.push(name.to_string());
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Colons are not valid in file names on every platform.
fn sanitize_filename(name: &str) -> String {
    name.replace(':', "")
}

/// Typed record access on top of a raw [`Store`].
pub struct Storer {
    inner: Box<dyn Store>,
}

const SCHEMA_KEY: &str = "schema";
const SCHEMA_CURRENT: &str = "1";
const KEYPAIR_KEY: &str = "keypair";
const DEVICE_ID_KEY: &str = "uuid";
const PAIRING_SUFFIX: &str = ".pairing";

impl Storer {
    pub fn new(store: impl Store + 'static) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value.as_bytes())
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        let bytes = self.inner.get(key)?;
        String::from_utf8(bytes).map_err(|e| {
            StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Stamp the store with the current schema version if it has none.
    pub fn ensure_schema(&self) -> Result<()> {
        match self.get_string(SCHEMA_KEY) {
            Ok(v) if v == SCHEMA_CURRENT => Ok(()),
            _ => self.set_string(SCHEMA_KEY, SCHEMA_CURRENT),
        }
    }

    pub fn key_pair(&self) -> Result<KeyPair> {
        let bytes = self.inner.get(KEYPAIR_KEY)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Corrupt {
                key: KEYPAIR_KEY.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn save_key_pair(&self, kp: &KeyPair) -> Result<()> {
        let bytes = serde_json::to_vec(kp).map_err(|e| StoreError::Corrupt {
            key: KEYPAIR_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.inner.set(KEYPAIR_KEY, &bytes)
    }

    pub fn device_id(&self) -> Result<String> {
        self.get_string(DEVICE_ID_KEY)
    }

    pub fn save_device_id(&self, id: &str) -> Result<()> {
        self.set_string(DEVICE_ID_KEY, id)
    }

    pub fn pairing(&self, name: &str) -> Result<Pairing> {
        self.pairing_for_key(&key_for_pairing_name(name))
    }

    pub fn save_pairing(&self, p: &Pairing) -> Result<()> {
        let key = key_for_pairing_name(&p.name);
        let bytes = serde_json::to_vec(p).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.inner.set(&key, &bytes)
    }

    pub fn delete_pairing(&self, name: &str) -> Result<()> {
        self.inner.delete(&key_for_pairing_name(name))
    }

    /// All persisted pairings. Unreadable records are skipped.
    pub fn pairings(&self) -> Vec<Pairing> {
        let mut out = Vec::new();
        if let Ok(keys) = self.inner.keys_with_suffix(PAIRING_SUFFIX) {
            for key in keys {
                if let Ok(p) = self.pairing_for_key(&key) {
                    out.push(p);
                }
            }
        }
        out
    }

    pub fn is_paired(&self) -> bool {
        !self.pairings().is_empty()
    }

    pub fn paired_with_admin(&self) -> bool {
        self.pairings().iter().any(Pairing::is_admin)
    }

    fn pairing_for_key(&self, key: &str) -> Result<Pairing> {
        let bytes = self.inner.get(key)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn key_for_pairing_name(name: &str) -> String {
    format!("{}{}", hex::encode(name.as_bytes()), PAIRING_SUFFIX)
}
