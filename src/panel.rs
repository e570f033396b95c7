//! Observer panel: task selection, progress view and the UI layer's cleanup
//! once a task is finished. Served over HTTP with server-sent notices.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::catalog::TaskCatalog;
use crate::coordinator::Host;
use crate::error::StoreError;
use crate::message::{Notice, PanelRequest};
use crate::store::{ProgressState, ProgressStore, SettingsStore};

const PORT_ATTEMPTS: u16 = 10;

/// Edits of persisted progress shared by the panel and the CLI.
#[derive(Clone)]
pub struct Controls {
    store: Arc<dyn ProgressStore>,
    settings: Arc<SettingsStore>,
}

impl Controls {
    pub fn new(store: Arc<dyn ProgressStore>, settings: Arc<SettingsStore>) -> Self {
        Self { store, settings }
    }

    /// Makes `task_id` the active task at step 0. Returns the previously active task.
    pub async fn select(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let previous = self.store.load().await?.active_task_id;
        self.store.save(&ProgressState::started(task_id)).await?;
        Ok(previous)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    /// Back to step 0, and the task may be logged again. Returns the active task.
    pub async fn reset(&self) -> Result<Option<String>, StoreError> {
        self.store.set_step_index(0).await?;
        let active = self.store.load().await?.active_task_id;
        if let Some(task_id) = &active {
            self.settings.clear_completed(task_id).await?;
        }
        Ok(active)
    }

    pub async fn mark_done(&self, task_id: &str) -> Result<(), StoreError> {
        self.store.clear().await?;
        self.settings.mark_completed(task_id).await
    }
}

#[derive(Clone)]
pub struct PanelState {
    pub requests: mpsc::Sender<PanelRequest>,
    pub notices: broadcast::Sender<Notice>,
    pub store: Arc<dyn ProgressStore>,
    pub catalog: Arc<TaskCatalog>,
    pub host: Arc<dyn Host>,
    pub controls: Controls,
}

impl PanelState {
    async fn request(&self, request: PanelRequest) {
        if self.requests.send(request).await.is_err() {
            warn!(?request, "coordinator is not running");
        }
    }

    async fn view(&self) -> Result<PanelView, PanelError> {
        let state = self.store.load().await?;
        let Some(task_id) = state.active_task_id else {
            return Ok(PanelView::idle());
        };
        let Some(task) = self.catalog.get(&task_id).await? else {
            return Ok(PanelView::idle());
        };

        let in_scope = match self.host.focused_tab().await {
            Some(tab) => task.matches_url(&tab.url),
            None => task.start_url.is_none(),
        };
        let total = task.total_steps();
        let instruction = task
            .step(state.step_index)
            .map(|step| format!("Step {}: {}", state.step_index + 1, step.instruction));
        let status = if !in_scope {
            "Please navigate to the correct page to start this lab."
        } else if state.step_index >= total {
            "Well done! You finished the lab!"
        } else {
            "Task in progress..."
        };

        Ok(PanelView {
            task_id: Some(task_id),
            title: Some(task.title.clone()),
            step_index: state.step_index,
            total_steps: total,
            percent: if total == 0 {
                100
            } else {
                (state.step_index.min(total) * 100 / total) as u32
            },
            instruction: instruction.filter(|_| in_scope),
            in_scope,
            start_url: task.start_url.clone(),
            status: status.to_string(),
        })
    }

    /// Completion cleanup: once the persisted index runs past the last step,
    /// forget the progress, flag the task as done and stop the page's engine.
    pub async fn check_finished(&self) -> Result<bool, PanelError> {
        let state = self.store.load().await?;
        let Some(task_id) = state.active_task_id else {
            return Ok(false);
        };
        let Some(task) = self.catalog.get(&task_id).await? else {
            return Ok(false);
        };
        if state.step_index < task.total_steps() {
            return Ok(false);
        }
        self.controls.mark_done(&task_id).await?;
        info!(%task_id, "task complete");
        self.request(PanelRequest::StopTaskOnTab).await;
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] crate::error::CatalogError),

    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::Catalog(_) => StatusCode::SERVICE_UNAVAILABLE,
            PanelError::UnknownTask(_) => StatusCode::NOT_FOUND,
            PanelError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            PanelError::Catalog(_) => "Error: Could not load tasks.".to_string(),
            other => other.to_string(),
        };
        error!("panel request failed: {}", self);
        (status, Json(json!({ "status": message }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelView {
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub step_index: usize,
    pub total_steps: usize,
    pub percent: u32,
    pub instruction: Option<String>,
    pub in_scope: bool,
    pub start_url: Option<String>,
    pub status: String,
}

impl PanelView {
    fn idle() -> Self {
        Self {
            task_id: None,
            title: None,
            step_index: 0,
            total_steps: 0,
            percent: 0,
            instruction: None,
            in_scope: true,
            start_url: None,
            status: "Waiting for task selection...".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskSummary {
    id: String,
    title: String,
    steps: usize,
}

#[derive(Debug, Deserialize)]
struct SelectPayload {
    task_id: Option<String>,
}

pub fn router(state: PanelState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/tasks", get(tasks_handler))
        .route("/state", get(state_handler))
        .route("/select", post(select_handler))
        .route("/reset", post(reset_handler))
        .route("/stop", post(stop_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(Arc::new(state))
}

/// Binds the panel on the first free port from `port` upward and serves it in the background.
pub async fn serve(state: PanelState, port: u16) -> std::io::Result<SocketAddr> {
    let app = router(state);
    let mut last_err = None;
    for candidate in port..port.saturating_add(PORT_ATTEMPTS) {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("panel server stopped: {}", e);
                    }
                });
                info!("panel running at http://{}", addr);
                return Ok(addr);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no port available for the panel")))
}

/// Runs completion cleanup each time the coordinator reports a state change.
pub fn spawn_completion_watch(state: PanelState) -> JoinHandle<()> {
    let mut notices = state.notices.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(Notice::RefreshState) => {
                    if let Err(e) = state.check_finished().await {
                        warn!("completion check failed: {}", e);
                    }
                }
                Ok(Notice::StepCompleted { .. }) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "panel lagged behind notices"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn tasks_handler(
    State(state): State<Arc<PanelState>>,
) -> Result<Json<Vec<TaskSummary>>, PanelError> {
    let tasks = state.catalog.tasks().await?;
    Ok(Json(
        tasks
            .into_iter()
            .map(|task| TaskSummary {
                steps: task.total_steps(),
                id: task.id,
                title: task.title,
            })
            .collect(),
    ))
}

async fn state_handler(State(state): State<Arc<PanelState>>) -> Result<Json<PanelView>, PanelError> {
    Ok(Json(state.view().await?))
}

async fn select_handler(
    State(state): State<Arc<PanelState>>,
    Json(payload): Json<SelectPayload>,
) -> Result<Json<PanelView>, PanelError> {
    match payload.task_id.filter(|id| !id.is_empty()) {
        Some(task_id) => {
            if state.catalog.get(&task_id).await?.is_none() {
                return Err(PanelError::UnknownTask(task_id));
            }
            // A live engine ignores a start for the task it already tracks,
            // so re-selecting the same task has to tear it down too.
            if state.controls.select(&task_id).await?.is_some() {
                state.request(PanelRequest::StopTaskOnTab).await;
            }
            info!(%task_id, "task selected");
            state.request(PanelRequest::InitiateTask).await;
        }
        None => {
            state.request(PanelRequest::StopTaskOnTab).await;
            state.controls.clear().await?;
            info!("task selection cleared");
        }
    }
    Ok(Json(state.view().await?))
}

async fn reset_handler(State(state): State<Arc<PanelState>>) -> Result<Json<PanelView>, PanelError> {
    if let Some(task_id) = state.controls.reset().await? {
        info!(%task_id, "task reset to first step");
        state.request(PanelRequest::StopTaskOnTab).await;
        state.request(PanelRequest::InitiateTask).await;
    }
    Ok(Json(state.view().await?))
}

async fn stop_handler(State(state): State<Arc<PanelState>>) -> StatusCode {
    state.request(PanelRequest::StopTaskOnTab).await;
    StatusCode::NO_CONTENT
}

async fn sse_handler(
    State(state): State<Arc<PanelState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notices.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        let notice = result.ok()?;
        let event = Event::default()
            .event(notice.event_name())
            .json_data(&notice)
            .ok()?;
        Some(Ok::<_, Infallible>(event))
    });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>stepguide</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 24px; width: 340px; color: #1d1d1f; }
  select, button { font-size: 14px; padding: 6px 10px; }
  #guideBox { display: none; margin-top: 16px; }
  .bar { background: #e5e5ea; border-radius: 4px; height: 8px; margin: 8px 0; }
  #progressFill { background: #2575fc; height: 8px; border-radius: 4px; width: 0; transition: width .3s; }
  #status { margin-top: 12px; color: #555; }
</style>
</head>
<body>
  <select id="taskSelector"><option value="">-- Choose your Lab --</option></select>
  <div id="guideBox">
    <div id="stepInstruction"></div>
    <div class="bar"><div id="progressFill"></div></div>
    <button id="resetBtn">Reset</button>
  </div>
  <div id="status">Waiting for task selection...</div>
<script>
  const $ = id => document.getElementById(id);

  function render(view) {
    $('status').innerText = view.in_scope || !view.start_url
      ? view.status
      : view.status + ' (Required URL starts with: ' + view.start_url + ')';
    $('guideBox').style.display = view.instruction ? 'block' : 'none';
    $('stepInstruction').innerText = view.instruction || '';
    $('progressFill').style.width = view.percent + '%';
    if (view.task_id) $('taskSelector').value = view.task_id;
  }

  async function refresh() {
    render(await (await fetch('/state')).json());
  }

  async function post(path, body) {
    const res = await fetch(path, {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify(body || {}),
    });
    if (res.ok && res.status !== 204) render(await res.json());
  }

  async function init() {
    const res = await fetch('/tasks');
    const body = await res.json();
    if (!res.ok) { $('status').innerText = body.status; return; }
    for (const task of body) {
      const option = document.createElement('option');
      option.value = task.id;
      option.innerText = task.title;
      $('taskSelector').appendChild(option);
    }
    await refresh();
  }

  $('taskSelector').addEventListener('change', e => post('/select', {task_id: e.target.value || null}));
  $('resetBtn').addEventListener('click', () => post('/reset'));

  const es = new EventSource('/events');
  es.addEventListener('step_completed', refresh);
  es.addEventListener('refresh_state', refresh);

  init();
</script>
</body>
</html>
"##;
