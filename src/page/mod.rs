//! The host page an engine instance drives.
//!
//! A `Page` is synchronous: every call happens inside one event handler of a
//! single page context. Observations registered with [`Page::watch`] report
//! back as [`PageEvent`]s on the context's event channel, tagged with the
//! [`WatchId`] that produced them. Once a watch is removed its id is never
//! reused, so late events for it can be recognised and dropped.

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::PageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// The tree a query or observer runs against: the document, or an open shadow root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Document,
    Node(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomEventKind {
    Click,
    Input,
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Watch {
    /// Listen for events on one node. With `suppress_navigation` a click on a
    /// hyperlink does not follow it.
    Events {
        node: NodeId,
        kinds: Vec<DomEventKind>,
        suppress_navigation: bool,
    },
    /// Structural changes inside a tree, without crossing shadow boundaries.
    Mutations {
        scope: Scope,
        character_data: bool,
    },
    /// One tick per repaint until unwatched.
    Frames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomEvent {
    Click,
    Input,
    Change,
    Mutated,
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEvent {
    pub watch: WatchId,
    pub event: DomEvent,
}

/// Geometry and content of the on-page guide, in viewport coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideFrame {
    pub highlight: Rect,
    pub label: Rect,
    pub text: String,
}

pub trait Page: Send + 'static {
    fn url(&self) -> String;

    fn query(&self, scope: Scope, selector: &str) -> Option<NodeId>;

    /// The node's open shadow root, if it has one.
    fn shadow_root(&self, host: NodeId) -> Option<NodeId>;

    fn is_connected(&self, node: NodeId) -> bool;

    /// Current form value of an input-like node.
    fn value(&self, node: NodeId) -> Option<String>;

    fn text_content(&self, node: NodeId) -> Option<String>;

    /// Destination of a hyperlink node.
    fn link_target(&self, node: NodeId) -> Option<String>;

    fn bounding_rect(&self, node: NodeId) -> Option<Rect>;

    fn viewport(&self) -> Size;

    fn watch(&mut self, watch: Watch) -> WatchId;

    fn unwatch(&mut self, id: WatchId);

    fn measure_label(&self, text: &str) -> Size;

    /// Creates the guide or updates it in place.
    fn draw_guide(&mut self, frame: &GuideFrame);

    fn hide_guide(&mut self);

    fn remove_guide(&mut self);

    fn navigate(&mut self, url: &str) -> Result<(), PageError>;
}
