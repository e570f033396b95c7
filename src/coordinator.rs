//! Cross-page authority: decides on every navigation whether the persisted
//! task resumes on the new page, and relays progress out of page contexts.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::catalog::TaskCatalog;
use crate::engine::EngineHandle;
use crate::error::{CoordinatorError, HostError};
use crate::message::{Notice, PanelRequest, ProgressEvent};
use crate::sink::{ProgressReport, ProgressSink};
use crate::store::{ProgressStore, SettingsStore};

const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(pub String);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    /// A new document: any engine of the previous context is gone.
    FullLoad,
    /// Same document, new URL (history-state navigation).
    HistoryState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub tab: TabId,
    pub url: String,
    pub kind: NavigationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub tab: TabId,
    pub url: String,
}

/// The browser side the coordinator drives.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Returns the engine of the tab's current page context, creating it if
    /// the context has none yet. At most one engine exists per context.
    async fn ensure_engine(&self, tab: &TabId) -> Result<EngineHandle, HostError>;

    /// The engine of the tab's current page context, if one was created.
    async fn engine(&self, tab: &TabId) -> Option<EngineHandle>;

    async fn focused_tab(&self) -> Option<TabInfo>;
}

/// Sink settings that take precedence over the synchronized tier.
#[derive(Debug, Clone, Default)]
pub struct SinkOverrides {
    pub url: Option<String>,
    pub user_id: Option<String>,
}

pub struct Coordinator<H: Host> {
    host: Arc<H>,
    store: Arc<dyn ProgressStore>,
    settings: Arc<SettingsStore>,
    catalog: Arc<TaskCatalog>,
    sink: ProgressSink,
    overrides: SinkOverrides,
    notices: broadcast::Sender<Notice>,
}

impl<H: Host> Coordinator<H> {
    pub fn new(
        host: Arc<H>,
        store: Arc<dyn ProgressStore>,
        settings: Arc<SettingsStore>,
        catalog: Arc<TaskCatalog>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            host,
            store,
            settings,
            catalog,
            sink: ProgressSink::new(),
            overrides: SinkOverrides::default(),
            notices,
        }
    }

    pub fn with_sink(mut self, sink: ProgressSink, overrides: SinkOverrides) -> Self {
        self.sink = sink;
        self.overrides = overrides;
        self
    }

    pub async fn run(
        self,
        mut navigations: mpsc::Receiver<NavigationEvent>,
        mut progress: mpsc::UnboundedReceiver<ProgressEvent>,
        mut requests: mpsc::Receiver<PanelRequest>,
    ) {
        loop {
            tokio::select! {
                Some(navigation) = navigations.recv() => self.on_navigation(navigation).await,
                Some(event) = progress.recv() => self.on_progress(event).await,
                Some(request) = requests.recv() => self.on_request(request).await,
                else => break,
            }
        }
        debug!("coordinator stopped");
    }

    pub async fn on_navigation(&self, navigation: NavigationEvent) {
        debug!(tab = %navigation.tab, url = %navigation.url, kind = ?navigation.kind, "page navigated");
        self.resume_quietly(&navigation.tab, &navigation.url).await;
    }

    /// Starts the persisted task on `tab` if the URL is in scope. Returns
    /// whether a start command was delivered.
    pub async fn resume(&self, tab: &TabId, url: &str) -> Result<bool, CoordinatorError> {
        let state = self.store.load().await?;
        let Some(task_id) = state.active_task_id else {
            return Ok(false);
        };
        let Some(task) = self.catalog.get(&task_id).await? else {
            debug!(%task_id, "persisted task is not in the catalog");
            return Ok(false);
        };
        if !task.matches_url(url) {
            debug!(%task_id, %url, "page is outside the task's scope");
            return Ok(false);
        }

        let engine = self.host.ensure_engine(tab).await?;
        engine.start(&task_id, task, state.step_index).await?;
        info!(%task_id, %tab, step = state.step_index, "task resumed on page");
        Ok(true)
    }

    async fn resume_quietly(&self, tab: &TabId, url: &str) {
        if let Err(e) = self.resume(tab, url).await {
            // Protected pages and torn-down contexts end up here; neither is fatal.
            warn!(%tab, "could not set up task on tab: {}", e);
        }
    }

    pub async fn on_request(&self, request: PanelRequest) {
        let Some(focused) = self.host.focused_tab().await else {
            debug!(?request, "no focused tab");
            return;
        };
        match request {
            PanelRequest::InitiateTask => {
                self.resume_quietly(&focused.tab, &focused.url).await;
            }
            PanelRequest::StopTaskOnTab => {
                if let Some(engine) = self.host.engine(&focused.tab).await
                    && let Err(e) = engine.stop().await
                {
                    debug!(tab = %focused.tab, "stop not delivered: {}", e);
                }
            }
        }
        let _ = self.notices.send(Notice::RefreshState);
    }

    /// Decides whether to log progress, fires the sink call in the
    /// background, then tells observers the persisted state moved on.
    pub async fn on_progress(&self, event: ProgressEvent) {
        match self.report_for(&event).await {
            Some((url, report)) => {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    match sink.report(&url, &report).await {
                        Ok(_) => info!(
                            task_id = %report.task_id,
                            percent = report.percent_complete,
                            "progress logged"
                        ),
                        Err(e) => warn!(task_id = %report.task_id, "progress logging failed: {}", e),
                    }
                });
            }
            None => debug!(task_id = %event.task_id, step = event.step_index, "progress not relayed"),
        }
        let _ = self.notices.send(Notice::RefreshState);
    }

    async fn report_for(&self, event: &ProgressEvent) -> Option<(String, ProgressReport)> {
        let settings = match self.settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("cannot read settings: {}", e);
                return None;
            }
        };
        if settings.completed.contains(&event.task_id) {
            return None;
        }
        let url = self
            .overrides
            .url
            .clone()
            .or(settings.sink_url)
            .filter(|url| !url.trim().is_empty())?;
        let identifier = self
            .overrides
            .user_id
            .clone()
            .or(settings.user_id)
            .unwrap_or_else(|| ANONYMOUS.to_string());
        Some((url, ProgressReport::new(&identifier, event)))
    }
}
