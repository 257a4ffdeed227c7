// src/cache/sled_store.rs
// Embedded key-value cache store backed by sled.

use std::path::Path;

use async_trait::async_trait;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CacheStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.db.remove(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::exercise_store;

    #[tokio::test]
    async fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        exercise_store(&store).await;
    }
}
