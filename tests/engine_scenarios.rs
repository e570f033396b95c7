mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{CATALOG, RecordingStore, links, settle};
use stepguide::engine::{DEFAULT_REVEAL_DELAY, DEFAULT_SETTLE_DELAY, EngineConfig, spawn_engine};
use stepguide::message::Notice;
use stepguide::page::memory::MemoryPage;
use stepguide::page::{DomEventKind, Page, Scope, Watch};
use stepguide::store::{MemoryStore, ProgressState, ProgressStore};
use stepguide::task::{ActionType, SelectorSpec, Step, Task};
use stepguide::TaskCatalog;

async fn catalog_task(id: &str) -> Task {
    TaskCatalog::from_json(CATALOG).get(id).await.unwrap().unwrap()
}

fn single_step(selector: SelectorSpec, action_type: ActionType, expected: Option<&str>) -> Task {
    Task {
        id: "single".into(),
        title: "Single step".into(),
        start_url: None,
        steps: vec![Step {
            id: "only".into(),
            selector,
            highlight_selector: None,
            action_type,
            expected: expected.map(str::to_string),
            instruction: "Do the thing".into(),
        }],
    }
}

fn click_page() -> (MemoryPage, tokio::sync::mpsc::UnboundedReceiver<stepguide::page::PageEvent>) {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    page.append(page.document(), "button#first");
    page.append(page.document(), "button#second");
    (page, events)
}

#[tokio::test]
async fn start_at_persisted_index_monitors_that_step() {
    let (page, events) = click_page();
    let first = page.query(Scope::Document, "#first").unwrap();
    let second = page.query(Scope::Document, "#second").unwrap();
    let store = Arc::new(MemoryStore::new(ProgressState {
        active_task_id: Some("clicks".into()),
        step_index: 1,
    }));
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("clicks", catalog_task("clicks").await, 1).await.unwrap();

    assert_eq!(page.guide().unwrap().text, "Click second");
    assert!(page.watches().contains(&Watch::Events {
        node: second,
        kinds: vec![DomEventKind::Click],
        suppress_navigation: false,
    }));

    page.click(first);
    settle().await;
    assert!(progress.try_recv().is_err());
    assert_eq!(store.load().await.unwrap().step_index, 1);
}

#[tokio::test(start_paused = true)]
async fn completion_persists_before_relaying() {
    let (page, events) = click_page();
    let first = page.query(Scope::Document, "#first").unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(
        RecordingStore::new(ProgressState::started("clicks"), log.clone())
            .with_delay(Duration::from_millis(50)),
    );
    let (links, mut progress, notices) = links(store.clone());
    let mut observer = notices.subscribe();
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("clicks", catalog_task("clicks").await, 0).await.unwrap();
    page.click(first);

    let relayed = progress.recv().await.unwrap();
    log.lock().push(format!("relay {}", relayed.step_index));
    assert_eq!(
        *log.lock(),
        vec!["persist 1 (navigations 0)".to_string(), "relay 0".to_string()]
    );
    assert_eq!(relayed.total_steps, 2);
    assert_eq!(
        observer.recv().await.unwrap(),
        Notice::StepCompleted {
            task_id: "clicks".into(),
            step_index: 1
        }
    );
}

#[tokio::test]
async fn duplicate_start_keeps_step_and_watchers() {
    let (page, events) = click_page();
    let store = Arc::new(MemoryStore::new(ProgressState {
        active_task_id: Some("clicks".into()),
        step_index: 1,
    }));
    let (links, _progress, _notices) = links(store);
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());
    let task = catalog_task("clicks").await;

    handle.start("clicks", task.clone(), 1).await.unwrap();
    let watches = page.watch_count();
    let draws = page.guide_draws();

    // A stale snapshot arriving from a second coordination round.
    let ack = handle.start("clicks", task, 0).await.unwrap();
    assert!(ack.success);
    assert_eq!(page.watch_count(), watches);
    assert_eq!(page.guide_draws(), draws);
    assert_eq!(page.guide().unwrap().text, "Click second");
}

#[tokio::test]
async fn stop_beats_a_click_already_queued() {
    let (page, events) = click_page();
    let first = page.query(Scope::Document, "#first").unwrap();
    let store = Arc::new(MemoryStore::new(ProgressState::started("clicks")));
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("clicks", catalog_task("clicks").await, 0).await.unwrap();
    page.click(first);
    handle.stop().await.unwrap();
    settle().await;

    assert!(progress.try_recv().is_err());
    assert_eq!(store.load().await.unwrap().step_index, 0);
    assert_eq!(page.watch_count(), 0);
    assert!(page.guide().is_none());
}

#[tokio::test]
async fn link_click_persists_before_navigating() {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    let link = page.append(page.document(), "a#first");
    page.set_attr(link, "href", "https://lab.test/next");
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(
        RecordingStore::new(ProgressState::started("clicks"), log.clone()).watching(page.clone()),
    );
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("clicks", catalog_task("clicks").await, 0).await.unwrap();
    page.click(link);
    progress.recv().await.unwrap();
    settle().await;

    assert_eq!(*log.lock(), vec!["persist 1 (navigations 0)".to_string()]);
    assert_eq!(page.navigations(), vec!["https://lab.test/next".to_string()]);
    assert_eq!(store.load().await.unwrap().step_index, 1);
}

#[tokio::test]
async fn nested_shadow_target_is_found_when_it_appears() {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    let store = Arc::new(MemoryStore::new(ProgressState::started("single")));
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());
    let chain = SelectorSpec::Chain(vec![
        "app-shell".into(),
        "lab-panel".into(),
        "button#deep".into(),
    ]);

    handle
        .start("single", single_step(chain, ActionType::Click, None), 0)
        .await
        .unwrap();
    assert_eq!(
        page.watches(),
        vec![Watch::Mutations {
            scope: Scope::Document,
            character_data: false
        }]
    );

    let shell = page.create("app-shell");
    let outer = page.attach_shadow(shell);
    page.insert(page.document(), shell);
    settle().await;
    assert_eq!(
        page.watches(),
        vec![Watch::Mutations {
            scope: Scope::Node(outer),
            character_data: false
        }]
    );

    let panel = page.create("lab-panel");
    let inner = page.attach_shadow(panel);
    let deep = page.append(inner, "button#deep");
    page.insert(outer, panel);
    settle().await;
    assert!(page.guide_visible());
    assert_eq!(page.guide().unwrap().text, "Do the thing");

    page.click(deep);
    let relayed = progress.recv().await.unwrap();
    assert_eq!(relayed.step_index, 0);
    assert_eq!(store.load().await.unwrap().step_index, 1);
}

#[tokio::test]
async fn shadow_root_attached_after_the_host_is_watched() {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    let store = Arc::new(MemoryStore::new(ProgressState::started("single")));
    let (links, _progress, _notices) = links(store);
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());
    let chain = SelectorSpec::Chain(vec!["app-shell".into(), "button#deep".into()]);

    handle
        .start("single", single_step(chain, ActionType::Click, None), 0)
        .await
        .unwrap();
    let shell = page.append(page.document(), "app-shell");
    settle().await;
    assert!(!page.guide_visible());

    let root = page.attach_shadow(shell);
    settle().await;
    assert_eq!(
        page.watches(),
        vec![Watch::Mutations {
            scope: Scope::Node(root),
            character_data: false
        }]
    );

    page.append(root, "button#deep");
    settle().await;
    assert!(page.guide_visible());
    assert_eq!(page.guide().unwrap().text, "Do the thing");
}

#[tokio::test(start_paused = true)]
async fn mixed_case_answer_then_blur_advances() {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    let answer = page.append(page.document(), "input#answer");
    page.append(page.document(), "button#submit");
    let store = Arc::new(MemoryStore::new(ProgressState::started("answer")));
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("answer", catalog_task("answer").await, 0).await.unwrap();

    page.type_text(answer, "Ye");
    settle().await;
    assert!(progress.try_recv().is_err());

    page.type_text(answer, " Yes ");
    page.blur(answer);
    let relayed = progress.recv().await.unwrap();
    assert_eq!(relayed.step_index, 0);
    assert_eq!(store.load().await.unwrap().step_index, 1);

    tokio::time::sleep(DEFAULT_SETTLE_DELAY + Duration::from_millis(50)).await;
    assert_eq!(page.guide().unwrap().text, "Submit");
    assert!(progress.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn text_already_matching_fires_after_reveal_delay() {
    let (page, events) = MemoryPage::new("https://lab.test/console");
    let status = page.append(page.document(), "div#status");
    page.set_text(status, "Task done.");
    let store = Arc::new(MemoryStore::new(ProgressState::started("single")));
    let (links, mut progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());
    let task = single_step("#status".into(), ActionType::TextChangeMatch, Some("done"));

    handle.start("single", task, 0).await.unwrap();

    tokio::time::sleep(DEFAULT_REVEAL_DELAY / 2).await;
    assert!(progress.try_recv().is_err());
    assert!(page.guide_visible());

    let relayed = progress.recv().await.unwrap();
    assert_eq!(relayed.step_index, 0);
    assert_eq!(relayed.total_steps, 1);
    assert_eq!(store.load().await.unwrap().step_index, 1);
    assert!(page.guide().is_none());
}

#[tokio::test]
async fn stop_leaves_persisted_progress_alone() {
    let (page, events) = click_page();
    let persisted = ProgressState {
        active_task_id: Some("clicks".into()),
        step_index: 1,
    };
    let store = Arc::new(MemoryStore::new(persisted.clone()));
    let (links, _progress, _notices) = links(store.clone());
    let (handle, _join) = spawn_engine(page.clone(), events, links, EngineConfig::default());

    handle.start("clicks", catalog_task("clicks").await, 1).await.unwrap();
    handle.stop().await.unwrap();

    assert_eq!(store.load().await.unwrap(), persisted);
    assert_eq!(page.watch_count(), 0);
}
