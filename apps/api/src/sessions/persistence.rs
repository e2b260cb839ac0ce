//! Durable snapshot of the whole session collection.
//!
//! One key, one full write per mutation. Callers decide *whether* to write
//! (only for signed-in users); this module only knows *how*.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::models::ChatSession;
use crate::storage::{read_json, remove_json, write_json_atomic, StorageError};

/// File name of the snapshot inside the data directory.
pub const SESSIONS_KEY: &str = "ycmind_sessions.json";

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ChatSession>, StorageError>;
    async fn save(&self, sessions: &[ChatSession]) -> Result<(), StorageError>;
    async fn delete(&self) -> Result<(), StorageError>;
}

pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SESSIONS_KEY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn load(&self) -> Result<Vec<ChatSession>, StorageError> {
        let sessions: Vec<ChatSession> = read_json(&self.path).await?.unwrap_or_default();
        info!("Loaded {} sessions from {}", sessions.len(), self.path.display());
        Ok(sessions)
    }

    async fn save(&self, sessions: &[ChatSession]) -> Result<(), StorageError> {
        write_json_atomic(&self.path, sessions).await
    }

    async fn delete(&self) -> Result<(), StorageError> {
        info!("Deleting session snapshot {}", self.path.display());
        remove_json(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::sessions::store::SessionStore;

    #[tokio::test]
    async fn test_snapshot_roundtrip_preserves_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = JsonSnapshotStore::new(dir.path());

        let mut store = SessionStore::default();
        let id = store.create_session().id.clone();
        store
            .append_messages(&id, vec![Message::user_text("Hello"), Message::ai_text("Hi there")])
            .unwrap();
        store.bind_conversation(&id, "conv-1").unwrap();

        snapshots.save(store.sessions()).await.unwrap();
        let loaded = snapshots.load().await.unwrap();
        assert_eq!(loaded, store.sessions());
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_empty_and_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = JsonSnapshotStore::new(dir.path());
        assert!(snapshots.load().await.unwrap().is_empty());

        snapshots.save(&[]).await.unwrap();
        assert!(snapshots.path().exists());
        snapshots.delete().await.unwrap();
        assert!(!snapshots.path().exists());
    }
}
