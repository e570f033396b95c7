//! The step engine: one instance per page context.
//!
//! The engine owns all runtime state for the task it is guiding and only
//! changes it from inside its own event loop. Commands are served before
//! page events, so a stop is always processed before any trigger that was
//! already queued behind it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::detector::{Completion, Detector};
use crate::error::EngineError;
use crate::guide::GuideRenderer;
use crate::locator::{self, Resolution};
use crate::message::{Ack, EngineCommand, Notice, ProgressEvent};
use crate::page::{Page, PageEvent, Watch, WatchId};
use crate::store::ProgressStore;
use crate::task::Task;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_REVEAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Pause after a same-page completion before looking for the next target.
    pub settle_delay: Duration,
    /// How long an already-satisfied instruction stays visible before it completes.
    pub reveal_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            reveal_delay: DEFAULT_REVEAL_DELAY,
        }
    }
}

/// Everything an engine reports to outside its page context.
#[derive(Clone)]
pub struct EngineLinks {
    pub store: Arc<dyn ProgressStore>,
    pub progress: mpsc::UnboundedSender<ProgressEvent>,
    pub notices: broadcast::Sender<Notice>,
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn start(
        &self,
        task_id: &str,
        task: Task,
        step_index: usize,
    ) -> Result<Ack, EngineError> {
        let (reply, ack) = oneshot::channel();
        self.commands
            .send(EngineCommand::Start {
                task_id: task_id.to_string(),
                task,
                step_index,
                reply,
            })
            .await
            .map_err(|_| EngineError::Gone)?;
        ack.await.map_err(|_| EngineError::Gone)
    }

    pub async fn stop(&self) -> Result<Ack, EngineError> {
        let (reply, ack) = oneshot::channel();
        self.commands
            .send(EngineCommand::Stop { reply })
            .await
            .map_err(|_| EngineError::Gone)?;
        ack.await.map_err(|_| EngineError::Gone)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Starts an engine for one page context on the current runtime.
pub fn spawn_engine<P: Page>(
    page: P,
    events: mpsc::UnboundedReceiver<PageEvent>,
    links: EngineLinks,
    config: EngineConfig,
) -> (EngineHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(16);
    let engine = StepEngine::new(page, links, config);
    let join = tokio::spawn(engine.run(rx, events));
    (EngineHandle { commands }, join)
}

struct ActiveTask {
    id: String,
    task: Task,
}

#[derive(Debug)]
enum Phase {
    Idle,
    AwaitingElement { step: usize, watch: WatchId },
    Monitoring { step: usize, detector: Detector },
    Settling { resume_at: Instant },
    Finished,
}

pub struct StepEngine<P: Page> {
    page: P,
    links: EngineLinks,
    config: EngineConfig,
    task: Option<ActiveTask>,
    step_index: usize,
    phase: Phase,
    guide: GuideRenderer,
}

impl<P: Page> StepEngine<P> {
    pub fn new(page: P, links: EngineLinks, config: EngineConfig) -> Self {
        Self {
            page,
            links,
            config,
            task: None,
            step_index: 0,
            phase: Phase::Idle,
            guide: GuideRenderer::default(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut events: mpsc::UnboundedReceiver<PageEvent>,
    ) {
        loop {
            let deadline = self.deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event).await,
                _ = sleep_until(deadline) => self.on_deadline().await,
            }
        }
        self.teardown();
        debug!("engine shut down");
    }

    fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start {
                task_id,
                task,
                step_index,
                reply,
            } => {
                if self.is_tracking(&task_id) {
                    debug!(%task_id, step = self.step_index, "duplicate start ignored");
                    let _ = reply.send(Ack::OK);
                    return;
                }
                info!(%task_id, step = step_index, "starting task");
                self.teardown();
                self.step_index = step_index;
                self.task = Some(ActiveTask { id: task_id, task });
                self.enter_step();
                let _ = reply.send(Ack::OK);
            }
            EngineCommand::Stop { reply } => {
                if let Some(active) = &self.task {
                    info!(task_id = %active.id, step = self.step_index, "stopping task");
                }
                self.teardown();
                self.task = None;
                let _ = reply.send(Ack::OK);
            }
        }
    }

    async fn on_event(&mut self, event: PageEvent) {
        if self.guide.owns(event.watch) {
            self.guide.on_frame(&mut self.page);
            return;
        }
        if let Phase::AwaitingElement { step, watch } = self.phase
            && watch == event.watch
        {
            trace!(step, "target tree changed, locating again");
            self.teardown_observation();
            self.enter_step();
            return;
        }
        let completion = match &mut self.phase {
            Phase::Monitoring { step, detector } if detector.owns(event.watch) => {
                trace!(step = *step, event = ?event.event, "checking completion");
                detector.handle(&mut self.page, &event)
            }
            _ => {
                trace!(watch = ?event.watch, "event for inactive watch dropped");
                None
            }
        };
        if let Some(completion) = completion {
            self.advance(completion).await;
        }
    }

    async fn on_deadline(&mut self) {
        match &mut self.phase {
            Phase::Settling { .. } => {
                // A stop would have left the engine idle; reaching here means the task is live.
                if self.task.is_some() {
                    self.enter_step();
                } else {
                    self.phase = Phase::Idle;
                }
            }
            Phase::Monitoring { detector, .. } => {
                if let Some(completion) = detector.on_reveal(&mut self.page) {
                    self.advance(completion).await;
                }
            }
            _ => {}
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Settling { resume_at } => Some(*resume_at),
            Phase::Monitoring { detector, .. } => detector.reveal_deadline(),
            _ => None,
        }
    }

    fn is_tracking(&self, task_id: &str) -> bool {
        let same_task = self.task.as_ref().is_some_and(|active| active.id == task_id);
        same_task
            && matches!(
                self.phase,
                Phase::AwaitingElement { .. } | Phase::Monitoring { .. } | Phase::Settling { .. }
            )
    }

    /// Locates the current step's target and either monitors it or waits for it.
    fn enter_step(&mut self) {
        let Some(active) = &self.task else {
            self.phase = Phase::Idle;
            return;
        };
        let Some(step) = active.task.step(self.step_index).cloned() else {
            self.finish();
            return;
        };

        match locator::resolve(&self.page, &step.selector) {
            Resolution::Missing { watch_scope } => {
                debug!(step = self.step_index, scope = ?watch_scope, "target not present yet");
                let watch = self.page.watch(Watch::Mutations {
                    scope: watch_scope,
                    character_data: false,
                });
                self.phase = Phase::AwaitingElement {
                    step: self.step_index,
                    watch,
                };
            }
            Resolution::Found(target) => {
                self.guide
                    .show(&mut self.page, step.highlight(), target, &step.instruction);
                match Detector::arm(&mut self.page, &step, target, self.config.reveal_delay) {
                    Ok(detector) => {
                        info!(step = self.step_index, step_id = %step.id, "monitoring step");
                        self.phase = Phase::Monitoring {
                            step: self.step_index,
                            detector,
                        };
                    }
                    Err(e) => {
                        error!(step = self.step_index, "cannot monitor step: {}", e);
                        self.guide.clear(&mut self.page);
                        self.phase = Phase::Idle;
                    }
                }
            }
        }
    }

    async fn advance(&mut self, completion: Completion) {
        let Some(active) = &self.task else {
            return;
        };
        let task_id = active.id.clone();
        let total_steps = active.task.total_steps();
        let completed = self.step_index;

        self.teardown();
        self.step_index += 1;
        info!(%task_id, step = completed, "step completed");

        // Must land before anything refers to the new index, navigation included.
        if let Err(e) = self.links.store.set_step_index(self.step_index).await {
            error!(%task_id, step = self.step_index, "failed to persist progress: {}", e);
        }

        let _ = self.links.progress.send(ProgressEvent {
            task_id: task_id.clone(),
            step_index: completed,
            total_steps,
        });
        if self
            .links
            .notices
            .send(Notice::StepCompleted {
                task_id: task_id.clone(),
                step_index: self.step_index,
            })
            .is_err()
        {
            debug!("no panel listening, progress was saved");
        }

        if let Some(url) = completion.navigate_to {
            info!(%url, "following guided link");
            if let Err(e) = self.page.navigate(&url) {
                warn!("{}", e);
            }
        }

        if self.step_index >= total_steps {
            info!(%task_id, "task finished on page");
            self.finish();
        } else {
            self.phase = Phase::Settling {
                resume_at: Instant::now() + self.config.settle_delay,
            };
        }
    }

    fn finish(&mut self) {
        self.teardown();
        self.task = None;
        self.phase = Phase::Finished;
    }

    fn teardown_observation(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingElement { watch, .. } => self.page.unwatch(watch),
            Phase::Monitoring { mut detector, .. } => detector.disarm(&mut self.page),
            _ => {}
        }
    }

    /// Drops every listener, observer and guide tied to the current step.
    fn teardown(&mut self) {
        self.teardown_observation();
        self.guide.clear(&mut self.page);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::memory::MemoryPage;
    use crate::store::{MemoryStore, ProgressState};
    use crate::task::{ActionType, SelectorSpec, Step};

    fn task() -> Task {
        let click = |id: &str, selector: &str| Step {
            id: id.into(),
            selector: SelectorSpec::from(selector),
            highlight_selector: None,
            action_type: ActionType::Click,
            expected: None,
            instruction: format!("Click {id}"),
        };
        Task {
            id: "lab".into(),
            title: "Lab".into(),
            start_url: None,
            steps: vec![click("first", "#first"), click("second", "#second")],
        }
    }

    fn links(store: Arc<MemoryStore>) -> (EngineLinks, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (progress, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(8);
        (
            EngineLinks {
                store,
                progress,
                notices,
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn same_page_completion_settles_then_monitors_next_step() {
        let (page, events) = MemoryPage::new("https://lab.test/");
        let first = page.append(page.document(), "button#first");
        page.append(page.document(), "button#second");
        let store = Arc::new(MemoryStore::new(ProgressState::started("lab")));
        let (links, mut progress) = links(store.clone());
        let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

        handle.start("lab", task(), 0).await.unwrap();
        assert_eq!(page.guide().unwrap().text, "Click first");

        page.click(first);
        let relayed = progress.recv().await.unwrap();
        assert_eq!(relayed.step_index, 0);
        assert_eq!(store.load().await.unwrap().step_index, 1);
        assert!(page.guide().is_none());

        tokio::time::sleep(DEFAULT_SETTLE_DELAY * 2).await;
        assert_eq!(page.guide().unwrap().text, "Click second");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_settle_never_resumes() {
        let (page, events) = MemoryPage::new("https://lab.test/");
        let first = page.append(page.document(), "button#first");
        page.append(page.document(), "button#second");
        let store = Arc::new(MemoryStore::new(ProgressState::started("lab")));
        let (links, mut progress) = links(store);
        let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

        handle.start("lab", task(), 0).await.unwrap();
        page.click(first);
        progress.recv().await.unwrap();
        handle.stop().await.unwrap();

        tokio::time::sleep(DEFAULT_SETTLE_DELAY * 2).await;
        assert!(page.guide().is_none());
        assert_eq!(page.watch_count(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_ends_the_engine() {
        let (page, events) = MemoryPage::new("https://lab.test/");
        let store = Arc::new(MemoryStore::default());
        let (links, _progress) = links(store);
        let (handle, join) = spawn_engine(page, events, links, EngineConfig::default());
        drop(handle);
        join.await.unwrap();
    }
}
