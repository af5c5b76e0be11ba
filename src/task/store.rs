//! Task and profile lookup seams.
//!
//! The engine never owns task or profile definitions; it resolves them by id
//! through these traits. In-memory implementations back the binary and tests.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::model::Task;
use super::profile::Profile;
use crate::error::StoreError;

/// Resolves task definitions by id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;
}

/// Resolves full profile records by id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, StoreError>;
}

/// Task store held in memory. Tasks are validated on insert.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a task, replacing any task with the same id.
    pub async fn insert(&self, task: Task) -> Result<(), StoreError> {
        task.validate()?;
        debug!(task_id = %task.id, steps = task.steps.len(), "Task stored");
        self.tasks.write().await.insert(task.id.clone(), task);
        Ok(())
    }

    /// Load every `*.json` task definition in a directory.
    ///
    /// Files that fail to parse or validate are logged and skipped. Returns
    /// the number of tasks loaded.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, StoreError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            match Task::from_json(&contents) {
                Ok(task) => {
                    self.tasks.write().await.insert(task.id.clone(), task);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid task file");
                }
            }
        }

        info!(dir = %dir.display(), count = loaded, "Loaded task definitions");
        Ok(loaded)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }
}

/// Profile store held in memory.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, Profile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: Profile) {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile);
    }

}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.profiles.read().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{Step, StepAction};

    fn wait_task(id: &str) -> Task {
        Task::new(
            id,
            "Wait",
            vec![Step::new("s1", "Wait", StepAction::Wait { duration_ms: 1 })],
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryTaskStore::new();
        assert!(store.get_task("t1").await.unwrap().is_none());

        store.insert(wait_task("t1")).await.unwrap();
        assert_eq!(store.get_task("t1").await.unwrap().unwrap().name, "Wait");
        assert!(store.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_invalid_task() {
        let store = InMemoryTaskStore::new();
        let result = store.insert(Task::new("empty", "No steps", vec![])).await;
        assert!(matches!(result, Err(StoreError::InvalidTask { .. })));
        assert!(store.get_task("empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_dir_skips_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&wait_task("good")).unwrap();
        std::fs::write(tmp.path().join("good.json"), good).unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let store = InMemoryTaskStore::new();
        let loaded = store.load_dir(tmp.path()).await.unwrap();

        assert_eq!(loaded, 1);
        assert!(store.get_task("good").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profile_store_roundtrip() {
        let store = InMemoryProfileStore::new();
        store.insert(Profile::new("p1", "One")).await;
        assert_eq!(store.get_profile("p1").await.unwrap().unwrap().name, "One");
        assert!(store.get_profile("p2").await.unwrap().is_none());
    }
}
