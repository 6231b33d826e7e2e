// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Persistent key/value storage for update progress.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tempfile::NamedTempFile;
use thiserror::Error;

pub const KEY_UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
pub const KEY_UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const KEY_UPDATE_STATE_NEXT_DATA_LENGTH: &str = "update-state-next-data-length";
pub const KEY_UPDATE_STATE_SHA256_CONTEXT: &str = "update-state-sha256-context";
pub const KEY_UPDATE_STATE_SIGNED_SHA256_CONTEXT: &str = "update-state-signed-sha256-context";
pub const KEY_UPDATE_STATE_SIGNATURE_BLOB: &str = "update-state-signature-blob";
pub const KEY_MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const KEY_MANIFEST_SIGNATURE_SIZE: &str = "manifest-signature-size";
pub const KEY_RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";
pub const KEY_UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const KEY_DYNAMIC_PARTITION_METADATA_UPDATED: &str = "dynamic-partition-metadata-updated";
pub const KEY_VERITY_WRITTEN: &str = "verity-written";

/// Every key that describes the progress of an update.
pub const UPDATE_STATE_KEYS: &[&str] = &[
    KEY_UPDATE_STATE_NEXT_OPERATION,
    KEY_UPDATE_STATE_NEXT_DATA_OFFSET,
    KEY_UPDATE_STATE_NEXT_DATA_LENGTH,
    KEY_UPDATE_STATE_SHA256_CONTEXT,
    KEY_UPDATE_STATE_SIGNED_SHA256_CONTEXT,
    KEY_UPDATE_STATE_SIGNATURE_BLOB,
    KEY_MANIFEST_METADATA_SIZE,
    KEY_MANIFEST_SIGNATURE_SIZE,
    KEY_RESUMED_UPDATE_FAILURES,
    KEY_DYNAMIC_PARTITION_METADATA_UPDATED,
    KEY_VERITY_WRITTEN,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),
    #[error("Value for {key:?} is not a valid {kind}: {value:?}")]
    InvalidValue {
        key: String,
        kind: &'static str,
        value: String,
    },
    #[error("Failed to access pref {key:?}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Key/value store. Missing keys read back as [`None`].
pub trait Prefs: Send {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;

    fn delete(&mut self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        self.get_string(key).map(|v| v.is_some())
    }

    fn get_int64(&self, key: &str) -> Result<Option<i64>> {
        self.get_string(key)?
            .map(|v| {
                v.trim().parse().map_err(|_| Error::InvalidValue {
                    key: key.to_owned(),
                    kind: "integer",
                    value: v,
                })
            })
            .transpose()
    }

    fn set_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }

    fn get_boolean(&self, key: &str) -> Result<Option<bool>> {
        self.get_string(key)?
            .map(|v| match v.trim() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(Error::InvalidValue {
                    key: key.to_owned(),
                    kind: "boolean",
                    value: v,
                }),
            })
            .transpose()
    }

    fn set_boolean(&mut self, key: &str, value: bool) -> Result<()> {
        self.set_string(key, if value { "true" } else { "false" })
    }
}

/// In-memory prefs. Clones share the same storage, so a test can keep a handle
/// to inspect what an engine instance persisted.
#[derive(Clone, Debug, Default)]
pub struct MemoryPrefs {
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory. Values are replaced atomically so a
/// crash never leaves a torn value behind.
#[derive(Clone, Debug)]
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::Io {
            key: dir.display().to_string(),
            source: e,
        })?;

        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(Error::InvalidKey(key.to_owned()));
        }

        Ok(self.dir.join(key))
    }
}

impl Prefs for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;

        match fs::read_to_string(&path) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io {
                key: key.to_owned(),
                source: e,
            }),
        }
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let io_error = |e| Error::Io {
            key: key.to_owned(),
            source: e,
        };

        let mut file = NamedTempFile::new_in(&self.dir).map_err(io_error)?;
        file.write_all(value.as_bytes()).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(&path).map_err(|e| io_error(e.error))?;

        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io {
                key: key.to_owned(),
                source: e,
            }),
        }
    }
}
