use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::CatalogError;
use crate::task::Task;

pub const CATALOG_FILE: &str = "tasks.json";

type Tasks = Arc<BTreeMap<String, Task>>;

/// Read-only task catalog, fetched once on first use.
pub struct TaskCatalog {
    source: Source,
    tasks: OnceCell<Tasks>,
}

enum Source {
    File(PathBuf),
    Inline(String),
}

impl TaskCatalog {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
            tasks: OnceCell::new(),
        }
    }

    pub fn from_json(json: impl Into<String>) -> Self {
        Self {
            source: Source::Inline(json.into()),
            tasks: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<&Tasks, CatalogError> {
        self.tasks
            .get_or_try_init(|| async {
                let raw = match &self.source {
                    Source::File(path) => tokio::fs::read_to_string(path).await.map_err(|source| {
                        CatalogError::Read {
                            path: path.clone(),
                            source,
                        }
                    })?,
                    Source::Inline(json) => json.clone(),
                };
                let tasks = parse(&raw)?;
                debug!(count = tasks.len(), "task catalog loaded");
                Ok::<_, CatalogError>(Arc::new(tasks))
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>, CatalogError> {
        Ok(self.load().await?.get(id).cloned())
    }

    pub async fn tasks(&self) -> Result<Vec<Task>, CatalogError> {
        Ok(self.load().await?.values().cloned().collect())
    }
}

/// Parses a catalog document keyed by task id.
pub fn parse(raw: &str) -> Result<BTreeMap<String, Task>, CatalogError> {
    let mut tasks: BTreeMap<String, Task> = serde_json::from_str(raw)?;
    for (id, task) in tasks.iter_mut() {
        if task.id.is_empty() {
            task.id = id.clone();
        }
        for (index, step) in task.steps.iter_mut().enumerate() {
            if step.id.is_empty() {
                step.id = format!("{id}#{index}");
            }
            step.validate().map_err(|source| CatalogError::InvalidTask {
                task: id.clone(),
                source,
            })?;
        }
    }
    Ok(tasks)
}
