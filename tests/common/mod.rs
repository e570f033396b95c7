#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use stepguide::coordinator::{Host, TabId, TabInfo};
use stepguide::engine::{EngineConfig, EngineHandle, EngineLinks, spawn_engine};
use stepguide::error::{HostError, StoreError};
use stepguide::message::{Notice, ProgressEvent};
use stepguide::page::memory::MemoryPage;
use stepguide::page::{Page, PageEvent};
use stepguide::store::{MemoryStore, ProgressState, ProgressStore};

pub const LAB_URL: &str = "https://lab.test/console";

pub const CATALOG: &str = r##"{
  "clicks": {
    "title": "Two clicks",
    "start_url": "https://lab.test/",
    "steps": [
      { "selector": "#first", "action_type": "click", "instruction": "Click first" },
      { "selector": "#second", "action_type": "click", "instruction": "Click second" }
    ]
  },
  "answer": {
    "title": "Answer the question",
    "steps": [
      { "id": "q1", "selector": "input#answer", "action_type": "text_match", "expected": "yes", "instruction": "Type yes" },
      { "id": "q2", "selector": "#submit", "action_type": "click", "instruction": "Submit" }
    ]
  }
}"##;

pub fn links(
    store: Arc<dyn ProgressStore>,
) -> (
    EngineLinks,
    mpsc::UnboundedReceiver<ProgressEvent>,
    broadcast::Sender<Notice>,
) {
    let (progress, rx) = mpsc::unbounded_channel();
    let (notices, _) = broadcast::channel(32);
    (
        EngineLinks {
            store,
            progress,
            notices: notices.clone(),
        },
        rx,
        notices,
    )
}

/// Store that records each write, optionally taking its time about it.
pub struct RecordingStore {
    inner: MemoryStore,
    pub log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    page: Option<MemoryPage>,
}

impl RecordingStore {
    pub fn new(state: ProgressState, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            inner: MemoryStore::new(state),
            log,
            delay: Duration::ZERO,
            page: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Also notes how many navigations the page had seen when each write landed.
    pub fn watching(mut self, page: MemoryPage) -> Self {
        self.page = Some(page);
        self
    }
}

#[async_trait]
impl ProgressStore for RecordingStore {
    async fn load(&self) -> Result<ProgressState, StoreError> {
        self.inner.load().await
    }

    async fn save(&self, state: &ProgressState) -> Result<(), StoreError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save(state).await?;
        let navigations = self.page.as_ref().map_or(0, |page| page.navigations().len());
        self.log.lock().push(format!(
            "persist {} (navigations {})",
            state.step_index, navigations
        ));
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }
}

struct Document {
    page: MemoryPage,
    events: Option<mpsc::UnboundedReceiver<PageEvent>>,
    engine: Option<(EngineHandle, JoinHandle<()>)>,
}

/// One tab whose document is a `MemoryPage`. `load` replaces the document
/// the way a full navigation does.
pub struct MemoryHost {
    tab: TabId,
    links: EngineLinks,
    config: EngineConfig,
    document: Mutex<Document>,
    created: AtomicUsize,
}

impl MemoryHost {
    pub fn new(url: &str, links: EngineLinks, config: EngineConfig) -> Arc<Self> {
        let (page, events) = MemoryPage::new(url);
        Arc::new(Self {
            tab: TabId("tab-1".into()),
            links,
            config,
            document: Mutex::new(Document {
                page,
                events: Some(events),
                engine: None,
            }),
            created: AtomicUsize::new(0),
        })
    }

    pub fn tab(&self) -> TabId {
        self.tab.clone()
    }

    pub fn page(&self) -> MemoryPage {
        self.document.lock().page.clone()
    }

    pub fn load(&self, url: &str) -> MemoryPage {
        let (page, events) = MemoryPage::new(url);
        let mut document = self.document.lock();
        if let Some((_, join)) = document.engine.take() {
            join.abort();
        }
        *document = Document {
            page: page.clone(),
            events: Some(events),
            engine: None,
        };
        page
    }

    pub fn engines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn ensure_engine(&self, tab: &TabId) -> Result<EngineHandle, HostError> {
        if *tab != self.tab {
            return Err(HostError::NoContext(tab.to_string()));
        }
        let mut document = self.document.lock();
        if let Some((handle, _)) = &document.engine
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }
        let url = document.page.url();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(HostError::Protected(url));
        }
        let events = document
            .events
            .take()
            .ok_or_else(|| HostError::NoContext(tab.to_string()))?;
        let (handle, join) = spawn_engine(
            document.page.clone(),
            events,
            self.links.clone(),
            self.config,
        );
        document.engine = Some((handle.clone(), join));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn engine(&self, tab: &TabId) -> Option<EngineHandle> {
        if *tab != self.tab {
            return None;
        }
        self.document
            .lock()
            .engine
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }

    async fn focused_tab(&self) -> Option<TabInfo> {
        Some(TabInfo {
            tab: self.tab.clone(),
            url: self.document.lock().page.url(),
        })
    }
}

/// Lets spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
