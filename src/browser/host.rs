use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Tab;
use headless_chrome::protocol::cdp::types::Event;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::agent::{EMIT_BINDING, PROBE_JS, agent_script};
use super::page::ChromePage;
use crate::coordinator::{Host, NavigationEvent, NavigationKind, TabId, TabInfo};
use crate::engine::{EngineConfig, EngineHandle, EngineLinks, spawn_engine};
use crate::error::HostError;
use crate::page::PageEvent;

/// Only ordinary web pages get an engine.
pub fn is_guidable(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// What a poll of the tab reports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Probe {
    pub url: String,
    pub context: u64,
}

/// Compares two polls of the same tab. A document that lost its agent was
/// replaced; a new URL under the same agent is a history-state change.
/// An agent appearing without a URL change is our own injection.
pub fn classify(last: Option<&Probe>, now: &Probe) -> Option<NavigationKind> {
    let Some(last) = last else {
        return Some(NavigationKind::FullLoad);
    };
    if now.context == 0 && last.context != 0 {
        return Some(NavigationKind::FullLoad);
    }
    if now.url != last.url {
        if now.context != 0 && now.context == last.context {
            return Some(NavigationKind::HistoryState);
        }
        return Some(NavigationKind::FullLoad);
    }
    None
}

/// Navigation reported by the browser for the tab's main frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationHint {
    /// A new document was committed.
    Document,
    /// History-state or fragment change inside the current document.
    SameDocument { url: String },
}

fn hint_for(main_frame: &str, event: &Event) -> Option<NavigationHint> {
    match event {
        Event::PageFrameNavigated(navigated) if navigated.params.frame.parent_id.is_none() => {
            Some(NavigationHint::Document)
        }
        Event::PageNavigatedWithinDocument(within) if within.params.frame_id == main_frame => {
            Some(NavigationHint::SameDocument {
                url: within.params.url.clone(),
            })
        }
        _ => None,
    }
}

/// Last known state of the tab, fed by polls and browser hints.
#[derive(Debug, Default)]
pub struct NavigationTracker {
    last: Option<Probe>,
}

impl NavigationTracker {
    pub fn probed(&mut self, probe: Probe) -> Option<(String, NavigationKind)> {
        let kind = classify(self.last.as_ref(), &probe);
        let url = probe.url.clone();
        self.last = Some(probe);
        kind.map(|kind| (url, kind))
    }

    /// Every in-document navigation counts, even one that lands back on the
    /// URL the last poll saw.
    pub fn same_document(&mut self, url: String) -> (String, NavigationKind) {
        match &mut self.last {
            Some(last) => last.url = url.clone(),
            None => {
                self.last = Some(Probe {
                    url: url.clone(),
                    context: 0,
                })
            }
        }
        (url, NavigationKind::HistoryState)
    }
}

#[derive(Debug, Deserialize)]
struct Emitted {
    context: u64,
    #[serde(flatten)]
    event: PageEvent,
}

/// Unpacks a binding call. Depending on how the binding is installed the
/// payload is the JSON string itself or a `{name, seq, args}` envelope.
fn decode_emitted(payload: Value) -> Option<Emitted> {
    match payload {
        Value::String(raw) => serde_json::from_str(&raw).ok(),
        Value::Object(mut envelope) => match envelope.remove("args") {
            Some(Value::Array(mut args)) if !args.is_empty() => decode_emitted(args.swap_remove(0)),
            _ => serde_json::from_value(Value::Object(envelope)).ok(),
        },
        _ => None,
    }
}

struct EventRoute {
    context: u64,
    sender: mpsc::UnboundedSender<PageEvent>,
}

struct Context {
    id: u64,
    handle: EngineHandle,
    join: JoinHandle<()>,
}

/// Hosts engines in the session tab, one per document.
pub struct ChromeHost {
    tab: Arc<Tab>,
    tab_id: TabId,
    links: EngineLinks,
    config: EngineConfig,
    next_context: AtomicU64,
    current: Mutex<Option<Context>>,
    route: Arc<Mutex<Option<EventRoute>>>,
}

impl ChromeHost {
    pub fn new(
        tab: Arc<Tab>,
        links: EngineLinks,
        config: EngineConfig,
    ) -> Result<Self, HostError> {
        let route: Arc<Mutex<Option<EventRoute>>> = Arc::new(Mutex::new(None));
        let sink = route.clone();
        tab.expose_function(
            EMIT_BINDING,
            Arc::new(move |payload: Value| {
                let Some(emitted) = decode_emitted(payload) else {
                    trace!("undecodable agent event");
                    return;
                };
                if let Some(route) = sink.lock().as_ref()
                    && route.context == emitted.context
                {
                    let _ = route.sender.send(emitted.event);
                }
            }),
        )
        .map_err(|e| HostError::Injection(e.to_string()))?;

        Ok(Self {
            tab_id: TabId(tab.get_target_id().to_string()),
            tab,
            links,
            config,
            next_context: AtomicU64::new(0),
            current: Mutex::new(None),
            route,
        })
    }

    async fn evaluate(&self, expression: String) -> Result<Option<Value>, HostError> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || tab.evaluate(&expression, false))
            .await
            .map_err(|e| HostError::Injection(e.to_string()))?
            .map(|object| object.value)
            .map_err(|e| HostError::Injection(e.to_string()))
    }

    pub async fn probe(&self) -> Result<Probe, HostError> {
        let raw = self.evaluate(PROBE_JS.to_string()).await?;
        raw.as_ref()
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| HostError::NoContext(self.tab_id.to_string()))
    }

    fn check_tab(&self, tab: &TabId) -> Result<(), HostError> {
        if *tab == self.tab_id {
            Ok(())
        } else {
            Err(HostError::NoContext(tab.to_string()))
        }
    }

    fn live_engine(&self, context: u64) -> Option<EngineHandle> {
        self.current
            .lock()
            .as_ref()
            .filter(|current| context != 0 && current.id == context && !current.handle.is_closed())
            .map(|current| current.handle.clone())
    }

    /// Ends the engine of a document that no longer exists.
    fn drop_context(&self) {
        if let Some(old) = self.current.lock().take() {
            debug!(context = old.id, "page context destroyed");
            old.join.abort();
        }
        self.route.lock().take();
    }

    async fn poll(&self, tracker: &mut NavigationTracker) -> Option<(String, NavigationKind)> {
        match self.probe().await {
            Ok(probe) => tracker.probed(probe),
            Err(e) => {
                trace!("tab not ready: {}", e);
                None
            }
        }
    }

    /// Announces navigations until the receiver goes away. Browser navigation
    /// events drive it; the poll catches whatever they miss.
    pub fn watch_navigation(
        self: Arc<Self>,
        navigations: mpsc::Sender<NavigationEvent>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let (hints_tx, mut hints) = mpsc::unbounded_channel();
        let main_frame = self.tab_id.0.clone();
        let listener = self
            .tab
            .add_event_listener(Arc::new(move |event: &Event| {
                if let Some(hint) = hint_for(&main_frame, event) {
                    let _ = hints_tx.send(hint);
                }
            }))
            .inspect_err(|e| warn!("navigation events unavailable, polling only: {}", e))
            .ok();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tracker = NavigationTracker::default();
            loop {
                let seen = tokio::select! {
                    Some(hint) = hints.recv() => match hint {
                        NavigationHint::Document => self.poll(&mut tracker).await,
                        NavigationHint::SameDocument { url } => Some(tracker.same_document(url)),
                    },
                    _ = ticker.tick() => self.poll(&mut tracker).await,
                };
                let Some((url, kind)) = seen else {
                    continue;
                };
                if kind == NavigationKind::FullLoad {
                    self.drop_context();
                }
                let event = NavigationEvent {
                    tab: self.tab_id.clone(),
                    url,
                    kind,
                };
                if navigations.send(event).await.is_err() {
                    break;
                }
            }
            if let Some(listener) = listener
                && let Err(e) = self.tab.remove_event_listener(&listener)
            {
                debug!("could not remove navigation listener: {}", e);
            }
        })
    }
}

#[async_trait]
impl Host for ChromeHost {
    async fn ensure_engine(&self, tab: &TabId) -> Result<EngineHandle, HostError> {
        self.check_tab(tab)?;
        let probe = self.probe().await?;
        if !is_guidable(&probe.url) {
            return Err(HostError::Protected(probe.url));
        }
        if let Some(handle) = self.live_engine(probe.context) {
            return Ok(handle);
        }

        let context = self.next_context.fetch_add(1, Ordering::Relaxed) + 1;
        let installed = self.evaluate(agent_script(context)).await?;
        if installed.and_then(|value| value.as_u64()) != Some(context) {
            return Err(HostError::Injection(format!(
                "agent did not initialise on {}",
                probe.url
            )));
        }

        let (sender, events) = mpsc::unbounded_channel();
        *self.route.lock() = Some(EventRoute { context, sender });
        let page = ChromePage::new(self.tab.clone(), context);
        let (handle, join) = spawn_engine(page, events, self.links.clone(), self.config);
        let previous = self.current.lock().replace(Context {
            id: context,
            handle: handle.clone(),
            join,
        });
        if let Some(previous) = previous {
            previous.join.abort();
        }
        info!(tab = %self.tab_id, context, url = %probe.url, "engine created");
        Ok(handle)
    }

    async fn engine(&self, tab: &TabId) -> Option<EngineHandle> {
        self.check_tab(tab).ok()?;
        self.current
            .lock()
            .as_ref()
            .filter(|current| !current.handle.is_closed())
            .map(|current| current.handle.clone())
    }

    async fn focused_tab(&self) -> Option<TabInfo> {
        match self.probe().await {
            Ok(probe) => Some(TabInfo {
                tab: self.tab_id.clone(),
                url: probe.url,
            }),
            Err(e) => {
                warn!(tab = %self.tab_id, "cannot read focused tab: {}", e);
                None
            }
        }
    }
}
