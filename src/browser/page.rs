use std::sync::Arc;

use headless_chrome::Tab;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{trace, warn};

use crate::error::PageError;
use crate::page::{GuideFrame, NodeId, Page, Rect, Scope, Size, Watch, WatchId};

/// A page context in a Chrome tab, driven through the injected agent.
///
/// Calls block on the CDP round trip inside `block_in_place`, so this must run
/// on the multi-threaded runtime. A call against a document whose agent is
/// not `context` (the page navigated away) yields nothing.
pub struct ChromePage {
    tab: Arc<Tab>,
    context: u64,
    next_watch: u64,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>, context: u64) -> Self {
        Self {
            tab,
            context,
            next_watch: 0,
        }
    }

    fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Option<T> {
        let expression = format!(
            "(window.__stepguide && window.__stepguide.context === {ctx}) \
             ? window.__stepguide.call({method}, {args}) : 'null'",
            ctx = self.context,
            method = Value::from(method),
            args = args,
        );
        let result = tokio::task::block_in_place(|| self.tab.evaluate(&expression, false));
        match result {
            Ok(object) => {
                let raw = object.value?;
                let raw = raw.as_str()?;
                match serde_json::from_str(raw) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(method, "unexpected agent reply: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                trace!(method, "agent call failed: {}", e);
                None
            }
        }
    }

    fn call_void(&self, method: &str, args: Value) {
        let _: Option<Value> = self.call(method, args);
    }
}

impl Page for ChromePage {
    fn url(&self) -> String {
        self.call::<String>("url", json!([])).unwrap_or_default()
    }

    fn query(&self, scope: Scope, selector: &str) -> Option<NodeId> {
        self.call("query", json!([scope, selector]))
    }

    fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.call("shadow_root", json!([host]))
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.call("is_connected", json!([node])).unwrap_or(false)
    }

    fn value(&self, node: NodeId) -> Option<String> {
        self.call("value", json!([node]))
    }

    fn text_content(&self, node: NodeId) -> Option<String> {
        self.call("text_content", json!([node]))
    }

    fn link_target(&self, node: NodeId) -> Option<String> {
        self.call("link_target", json!([node]))
    }

    fn bounding_rect(&self, node: NodeId) -> Option<Rect> {
        self.call("bounding_rect", json!([node]))
    }

    fn viewport(&self) -> Size {
        self.call("viewport", json!([])).unwrap_or_default()
    }

    fn watch(&mut self, watch: Watch) -> WatchId {
        self.next_watch += 1;
        let id = WatchId(self.next_watch);
        self.call_void("watch", json!([id, watch]));
        id
    }

    fn unwatch(&mut self, id: WatchId) {
        self.call_void("unwatch", json!([id]));
    }

    fn measure_label(&self, text: &str) -> Size {
        self.call("measure_label", json!([text])).unwrap_or_default()
    }

    fn draw_guide(&mut self, frame: &GuideFrame) {
        self.call_void("draw_guide", json!([frame]));
    }

    fn hide_guide(&mut self) {
        self.call_void("hide_guide", json!([]));
    }

    fn remove_guide(&mut self) {
        self.call_void("remove_guide", json!([]));
    }

    fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        tokio::task::block_in_place(|| self.tab.navigate_to(url))
            .map(|_| ())
            .map_err(|e| PageError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}
