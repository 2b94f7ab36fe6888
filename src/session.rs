use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Values that survive between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub last_play_index: Option<usize>,
    pub last_project: Option<String>,
}

/// Durable session values, kept in a JSON file or only in memory
pub struct SessionStore {
    path: Option<PathBuf>,
    session: Mutex<Session>,
}

impl SessionStore {
    /// Open the session file at `path`; a missing or unreadable file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let session = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                Session::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Session::default(),
            Err(e) => {
                warn!("Failed to read session file {}: {}", path.display(), e);
                Session::default()
            }
        };

        Self {
            path: Some(path),
            session: Mutex::new(session),
        }
    }

    /// Session that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn last_play_index(&self) -> Option<usize> {
        self.lock().last_play_index
    }

    pub fn last_project(&self) -> Option<String> {
        self.lock().last_project.clone()
    }

    pub async fn set_last_play_index(&self, index: usize) -> Result<(), SessionError> {
        let snapshot = {
            let mut session = self.lock();
            if session.last_play_index == Some(index) {
                return Ok(());
            }
            session.last_play_index = Some(index);
            session.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn set_last_project(&self, project: &str) -> Result<(), SessionError> {
        let snapshot = {
            let mut session = self.lock();
            if session.last_project.as_deref() == Some(project) {
                return Ok(());
            }
            session.last_project = Some(project.to_string());
            session.clone()
        };
        self.persist(&snapshot).await
    }

    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(path, json).await?;
        debug!("Session saved to {}", path.display());
        Ok(())
    }
}

/// Everything a playback controller needs to know about the project it plays
#[derive(Clone)]
pub struct PlaybackContext {
    pub project: String,
    pub session: Arc<SessionStore>,
    /// Play a short tone before the first line of a scene
    pub scene_cue: bool,
}

impl PlaybackContext {
    pub fn new(project: impl Into<String>, session: Arc<SessionStore>) -> Self {
        Self {
            project: project.into(),
            session,
            scene_cue: true,
        }
    }

    pub fn with_scene_cue(mut self, scene_cue: bool) -> Self {
        self.scene_cue = scene_cue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn persists_across_opens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("session.json");

        let store = SessionStore::open(&path).await;
        assert_eq!(store.snapshot(), Session::default());
        store.set_last_project("talk").await.unwrap();
        store.set_last_play_index(12).await.unwrap();

        let reopened = SessionStore::open(&path).await;
        assert_eq!(reopened.last_project().as_deref(), Some("talk"));
        assert_eq!(reopened.last_play_index(), Some(12));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = SessionStore::open(&path).await;
        assert_eq!(store.last_play_index(), None);
    }

    #[tokio::test]
    async fn in_memory_store_keeps_values() {
        let store = SessionStore::in_memory();
        store.set_last_play_index(3).await.unwrap();
        assert_eq!(store.last_play_index(), Some(3));
        assert!(store.path().is_none());
    }
}
