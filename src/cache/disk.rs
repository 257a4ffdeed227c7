// src/cache/disk.rs
// =============================================================================
// One file per cache key under a directory.
//
// File names are the hex SHA-256 of the key, so any URL maps to a safe,
// fixed-length name. Each write goes to its own uniquely named temporary
// file in the same directory and is renamed into place, so a reader never
// sees half an entry, even when two writers race on one key.
// =============================================================================

use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    // Creates the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(hex::encode(digest))
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&value)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| io::Error::new(ErrorKind::Other, e))?
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
