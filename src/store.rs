use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::StoreError;

pub const PROGRESS_FILE: &str = "progress.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Persisted resumption point. The only state shared across page contexts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub active_task_id: Option<String>,
    pub step_index: usize,
}

impl ProgressState {
    pub fn started(task_id: impl Into<String>) -> Self {
        Self {
            active_task_id: Some(task_id.into()),
            step_index: 0,
        }
    }
}

/// Local tier. Read-modify-write, last writer wins.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self) -> Result<ProgressState, StoreError>;

    async fn save(&self, state: &ProgressState) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn set_step_index(&self, step_index: usize) -> Result<(), StoreError> {
        let mut state = self.load().await?;
        state.step_index = step_index;
        self.save(&state).await
    }
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PROGRESS_FILE))
    }
}

#[async_trait]
impl ProgressStore for JsonFileStore {
    async fn load(&self) -> Result<ProgressState, StoreError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, state: &ProgressState) -> Result<(), StoreError> {
        write_json(&self.path, state).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<ProgressState>,
}

impl MemoryStore {
    pub fn new(state: ProgressState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load(&self) -> Result<ProgressState, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ProgressState) -> Result<(), StoreError> {
        *self.state.lock().await = state.clone();
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.state.lock().await = ProgressState::default();
        Ok(())
    }
}

/// Synchronized tier: user configuration and per-task completion flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sink_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub completed: BTreeSet<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SETTINGS_FILE))
    }

    pub async fn load(&self) -> Result<Settings, StoreError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        write_json(&self.path, settings).await
    }

    pub async fn is_completed(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self.load().await?.completed.contains(task_id))
    }

    pub async fn mark_completed(&self, task_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.completed.insert(task_id.to_string());
        })
        .await
    }

    pub async fn clear_completed(&self, task_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.completed.remove(task_id);
        })
        .await
    }

    async fn update(&self, f: impl FnOnce(&mut Settings) + Send) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut settings: Settings = read_json(&self.path).await?.unwrap_or_default();
        f(&mut settings);
        write_json(&self.path, &settings).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());

        assert_eq!(store.load().await.unwrap(), ProgressState::default());

        store.save(&ProgressState::started("lab1")).await.unwrap();
        store.set_step_index(3).await.unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.active_task_id.as_deref(), Some("lab1"));
        assert_eq!(state.step_index, 3);

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), ProgressState::default());
    }

    #[tokio::test]
    async fn completion_flags() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::in_dir(dir.path());

        settings.mark_completed("lab1").await.unwrap();
        assert!(settings.is_completed("lab1").await.unwrap());
        assert!(!settings.is_completed("lab2").await.unwrap());

        settings.clear_completed("lab1").await.unwrap();
        assert!(!settings.is_completed("lab1").await.unwrap());
    }

    #[tokio::test]
    async fn settings_keep_user_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::in_dir(dir.path());
        settings
            .save(&Settings {
                sink_url: Some("https://sink.test/log".into()),
                user_id: Some("student@example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        settings.mark_completed("lab1").await.unwrap();
        let loaded = settings.load().await.unwrap();
        assert_eq!(loaded.user_id.as_deref(), Some("student@example.com"));
        assert!(loaded.completed.contains("lab1"));
    }
}
