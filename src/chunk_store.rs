use crate::codec::chunk_file_name;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ChunkStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found: {scope}/{name}")]
    NotFound { scope: String, name: String },
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// Byte-blob storage keyed by (project scope, file name).
///
/// Chunk files and the transcript of one imported recording live under the same scope.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn exists(&self, scope: &str, name: &str) -> Result<bool, ChunkStoreError>;
    async fn read(&self, scope: &str, name: &str) -> Result<Vec<u8>, ChunkStoreError>;
    async fn write(&self, scope: &str, name: &str, data: &[u8]) -> Result<(), ChunkStoreError>;
    /// Remove files in a scope, optionally only those with the given extension
    async fn clear(&self, scope: &str, extension: Option<&str>) -> Result<(), ChunkStoreError>;
}

/// Stores each scope as a directory under a root path
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: &str) -> Result<PathBuf, ChunkStoreError> {
        validate_component(scope)?;
        Ok(self.root.join(scope))
    }

    fn file_path(&self, scope: &str, name: &str) -> Result<PathBuf, ChunkStoreError> {
        validate_component(name)?;
        Ok(self.scope_dir(scope)?.join(name))
    }
}

/// Reject names that would escape the scope directory
fn validate_component(component: &str) -> Result<(), ChunkStoreError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(ChunkStoreError::InvalidName(component.to_string()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ChunkStore for LocalChunkStore {
    async fn exists(&self, scope: &str, name: &str) -> Result<bool, ChunkStoreError> {
        let path = self.file_path(scope, name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read(&self, scope: &str, name: &str) -> Result<Vec<u8>, ChunkStoreError> {
        let path = self.file_path(scope, name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ChunkStoreError::NotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, scope: &str, name: &str, data: &[u8]) -> Result<(), ChunkStoreError> {
        let dir = self.scope_dir(scope)?;
        fs::create_dir_all(&dir).await?;
        let path = self.file_path(scope, name)?;
        fs::write(&path, data).await?;
        debug!("LocalChunkStore: wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn clear(&self, scope: &str, extension: Option<&str>) -> Result<(), ChunkStoreError> {
        let dir = self.scope_dir(scope)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let matches = match extension {
                Some(ext) => path.extension().and_then(|s| s.to_str()) == Some(ext),
                None => true,
            };
            if matches {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        info!("LocalChunkStore: cleared {} files from scope {}", removed, scope);
        Ok(())
    }
}

/// Cheaply cloneable handle to the configured chunk store
#[derive(Clone)]
pub struct ChunkStoreManager {
    storage: Arc<dyn ChunkStore>,
}

impl std::fmt::Debug for ChunkStoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStoreManager")
            .field("storage", &"<dyn ChunkStore>")
            .finish()
    }
}

impl ChunkStoreManager {
    /// Store rooted at a directory on the local filesystem
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::from_storage(Arc::new(LocalChunkStore::new(root)))
    }

    pub fn from_storage(storage: Arc<dyn ChunkStore>) -> Self {
        Self { storage }
    }

    pub async fn chunk_exists(&self, scope: &str, index: u32) -> Result<bool, ChunkStoreError> {
        self.storage.exists(scope, &chunk_file_name(index)).await
    }

    pub async fn read_chunk(&self, scope: &str, index: u32) -> Result<Vec<u8>, ChunkStoreError> {
        self.storage.read(scope, &chunk_file_name(index)).await
    }

    pub async fn write_chunk(
        &self,
        scope: &str,
        index: u32,
        data: &[u8],
    ) -> Result<(), ChunkStoreError> {
        self.storage.write(scope, &chunk_file_name(index), data).await
    }

    pub async fn exists(&self, scope: &str, name: &str) -> Result<bool, ChunkStoreError> {
        self.storage.exists(scope, name).await
    }

    pub async fn read(&self, scope: &str, name: &str) -> Result<Vec<u8>, ChunkStoreError> {
        self.storage.read(scope, name).await
    }

    pub async fn write(&self, scope: &str, name: &str, data: &[u8]) -> Result<(), ChunkStoreError> {
        self.storage.write(scope, name, data).await
    }

    pub async fn clear(&self, scope: &str, extension: Option<&str>) -> Result<(), ChunkStoreError> {
        self.storage.clear(scope, extension).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStoreManager::local(temp_dir.path());

        assert!(!store.chunk_exists("talk", 0).await.unwrap());
        store.write_chunk("talk", 0, b"abc").await.unwrap();
        assert!(store.chunk_exists("talk", 0).await.unwrap());
        assert_eq!(store.read_chunk("talk", 0).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStoreManager::local(temp_dir.path());

        let err = store.read_chunk("talk", 3).await.unwrap_err();
        assert!(matches!(err, ChunkStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn clear_by_extension_keeps_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStoreManager::local(temp_dir.path());

        store.write_chunk("talk", 0, b"a").await.unwrap();
        store.write_chunk("talk", 1, b"b").await.unwrap();
        store.write("talk", "transcript.srt", b"1").await.unwrap();

        store.clear("talk", Some("mp3")).await.unwrap();

        assert!(!store.chunk_exists("talk", 0).await.unwrap());
        assert!(!store.chunk_exists("talk", 1).await.unwrap());
        assert!(store.exists("talk", "transcript.srt").await.unwrap());

        store.clear("talk", None).await.unwrap();
        assert!(!store.exists("talk", "transcript.srt").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStoreManager::local(temp_dir.path());

        let err = store.write("..", "x", b"1").await.unwrap_err();
        assert!(matches!(err, ChunkStoreError::InvalidName(_)));
    }
}
