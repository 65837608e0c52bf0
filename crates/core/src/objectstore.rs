use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn get_object_url(&self, key: &str) -> Result<String, StorageError>;

    /// Byte length of a stored object.
    async fn object_size(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.get_object(key).await?.len() as u64)
    }
}

/// Object storage on the local filesystem; keys are relative paths under `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.trim().is_empty() || escapes {
            return Err(StorageError::InvalidRequest(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put_object(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn object_size(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_object_url(&self, key: &str) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        url::Url::from_file_path(&absolute)
            .map(|url| url.to_string())
            .map_err(|_| {
                StorageError::InvalidRequest(format!("cannot build url for {}", absolute.display()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn objects_round_trip_under_root() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let storage = LocalObjectStorage::new(dir.path());
        storage.put_object("BizTypeKnowledge/1_a.txt", b"hello").await?;
        assert_eq!(storage.get_object("BizTypeKnowledge/1_a.txt").await?, b"hello");
        assert_eq!(storage.object_size("BizTypeKnowledge/1_a.txt").await?, 5);

        let url = storage.get_object_url("BizTypeKnowledge/1_a.txt").await?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("BizTypeKnowledge/1_a.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_objects_and_escaping_keys_fail() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let storage = LocalObjectStorage::new(dir.path());
        assert!(matches!(
            storage.get_object("nope.txt").await,
            Err(StorageError::ObjectNotFound(_))
        ));
        assert!(matches!(
            storage.object_size("nope.txt").await,
            Err(StorageError::ObjectNotFound(_))
        ));
        assert!(matches!(
            storage.put_object("../outside.txt", b"x").await,
            Err(StorageError::InvalidRequest(_))
        ));
        Ok(())
    }
}
