//! A scriptable in-memory page.
//!
//! Models the parts of a document the engine relies on: a light tree with
//! open shadow roots, compound/descendant selectors, mutation observers that
//! stop at shadow boundaries, event dispatch with composed bubbling and
//! frame ticks. Clones share the same document, so a test can keep a handle
//! while the engine owns another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    DomEvent, DomEventKind, GuideFrame, NodeId, Page, PageEvent, Rect, Scope, Size, Watch,
    WatchId,
};
use crate::error::PageError;

const DEFAULT_RECT: Rect = Rect {
    x: 40.0,
    y: 40.0,
    width: 120.0,
    height: 32.0,
};

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attrs: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    shadow: Option<NodeId>,
    /// Set on shadow roots: the element hosting them.
    host: Option<NodeId>,
    text: String,
    value: Option<String>,
    rect: Rect,
}

impl Node {
    fn element(tag: &str) -> Self {
        let form_field = matches!(tag, "input" | "textarea" | "select");
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
            shadow: None,
            host: None,
            text: String::new(),
            value: form_field.then(String::new),
            rect: DEFAULT_RECT,
        }
    }
}

struct Dom {
    nodes: HashMap<NodeId, Node>,
    next_node: u64,
    root: NodeId,
    url: String,
    viewport: Size,
    watches: BTreeMap<WatchId, Watch>,
    next_watch: u64,
    events: mpsc::UnboundedSender<PageEvent>,
    guide: Option<GuideFrame>,
    guide_visible: bool,
    guide_draws: usize,
    navigations: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryPage {
    dom: Arc<Mutex<Dom>>,
}

impl MemoryPage {
    pub fn new(url: &str) -> (Self, mpsc::UnboundedReceiver<PageEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::element("#document"));
        let dom = Dom {
            nodes,
            next_node: 1,
            root,
            url: url.to_string(),
            viewport: Size {
                width: 1280.0,
                height: 800.0,
            },
            watches: BTreeMap::new(),
            next_watch: 1,
            events,
            guide: None,
            guide_visible: false,
            guide_draws: 0,
            navigations: Vec::new(),
        };
        (
            Self {
                dom: Arc::new(Mutex::new(dom)),
            },
            rx,
        )
    }

    pub fn document(&self) -> NodeId {
        self.dom.lock().root
    }

    /// Appends an element described as `tag#id.class` under `parent`.
    pub fn append(&self, parent: NodeId, spec: &str) -> NodeId {
        let mut dom = self.dom.lock();
        let id = NodeId(dom.next_node);
        dom.next_node += 1;
        dom.nodes.insert(id, parse_element(spec));
        dom.attach(parent, id);
        id
    }

    /// Moves an existing node (and its subtree) under `parent`.
    pub fn insert(&self, parent: NodeId, node: NodeId) {
        let mut dom = self.dom.lock();
        dom.detach(node);
        dom.attach(parent, node);
    }

    /// Creates an element that is not yet part of any tree.
    pub fn create(&self, spec: &str) -> NodeId {
        let mut dom = self.dom.lock();
        let id = NodeId(dom.next_node);
        dom.next_node += 1;
        dom.nodes.insert(id, parse_element(spec));
        id
    }

    pub fn attach_shadow(&self, host: NodeId) -> NodeId {
        let mut dom = self.dom.lock();
        let id = NodeId(dom.next_node);
        dom.next_node += 1;
        let mut root = Node::element("#shadow-root");
        root.host = Some(host);
        dom.nodes.insert(id, root);
        if let Some(node) = dom.nodes.get_mut(&host) {
            node.shadow = Some(id);
        }
        dom.notify_mutation(host, false);
        id
    }

    pub fn remove(&self, node: NodeId) {
        self.dom.lock().detach(node);
    }

    pub fn set_attr(&self, node: NodeId, name: &str, value: &str) {
        if let Some(n) = self.dom.lock().nodes.get_mut(&node) {
            n.attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_rect(&self, node: NodeId, rect: Rect) {
        if let Some(n) = self.dom.lock().nodes.get_mut(&node) {
            n.rect = rect;
        }
    }

    pub fn set_url(&self, url: &str) {
        self.dom.lock().url = url.to_string();
    }

    /// Replaces the node's own text, notifying character-data observers.
    pub fn set_text(&self, node: NodeId, text: &str) {
        let mut dom = self.dom.lock();
        if let Some(n) = dom.nodes.get_mut(&node) {
            n.text = text.to_string();
        }
        dom.notify_mutation(node, true);
    }

    /// Types into a form field: replaces its value and fires `input`.
    pub fn type_text(&self, node: NodeId, text: &str) {
        let mut dom = self.dom.lock();
        if let Some(n) = dom.nodes.get_mut(&node) {
            n.value = Some(text.to_string());
        }
        dom.dispatch(node, DomEventKind::Input);
    }

    /// Commits a form field, as blurring it would: fires `change`.
    pub fn blur(&self, node: NodeId) {
        self.dom.lock().dispatch(node, DomEventKind::Change);
    }

    pub fn click(&self, node: NodeId) {
        let mut dom = self.dom.lock();
        let suppressed = dom.dispatch(node, DomEventKind::Click);
        if !suppressed && let Some(href) = dom.link_in_path(node) {
            dom.navigations.push(href);
        }
    }

    /// Delivers one repaint tick to every frame watcher.
    pub fn tick(&self) {
        let dom = self.dom.lock();
        for (id, watch) in &dom.watches {
            if matches!(watch, Watch::Frames) {
                dom.emit(*id, DomEvent::Frame);
            }
        }
    }

    pub fn watch_count(&self) -> usize {
        self.dom.lock().watches.len()
    }

    pub fn watches(&self) -> Vec<Watch> {
        self.dom.lock().watches.values().cloned().collect()
    }

    pub fn guide(&self) -> Option<GuideFrame> {
        self.dom.lock().guide.clone()
    }

    pub fn guide_visible(&self) -> bool {
        let dom = self.dom.lock();
        dom.guide.is_some() && dom.guide_visible
    }

    pub fn guide_draws(&self) -> usize {
        self.dom.lock().guide_draws
    }

    pub fn navigations(&self) -> Vec<String> {
        self.dom.lock().navigations.clone()
    }
}

impl Dom {
    fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
        self.notify_mutation(parent, false);
    }

    fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.nodes.get_mut(&node).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != node);
        }
        self.notify_mutation(parent, false);
    }

    fn emit(&self, watch: WatchId, event: DomEvent) {
        let _ = self.events.send(PageEvent { watch, event });
    }

    /// Walks up within one tree, stopping at a shadow root or the document.
    fn tree_ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain = vec![node];
        let mut current = node;
        while let Some(parent) = self.nodes.get(&current).and_then(|n| n.parent) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Walks up across shadow boundaries, the way a composed event travels.
    fn composed_path(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            path.push(id);
            current = self
                .nodes
                .get(&id)
                .and_then(|n| n.parent.or(n.host));
        }
        path
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.composed_path(node).last() == Some(&self.root)
    }

    fn notify_mutation(&self, target: NodeId, character_data: bool) {
        let ancestors = self.tree_ancestors(target);
        for (id, watch) in &self.watches {
            let Watch::Mutations {
                scope,
                character_data: wants_text,
            } = watch
            else {
                continue;
            };
            if character_data && !wants_text {
                continue;
            }
            let observed = match scope {
                Scope::Document => ancestors.last() == Some(&self.root),
                Scope::Node(node) => ancestors.contains(node),
            };
            if observed {
                self.emit(*id, DomEvent::Mutated);
            }
        }
    }

    /// Fires `kind` along the composed path. Returns whether navigation was suppressed.
    fn dispatch(&mut self, target: NodeId, kind: DomEventKind) -> bool {
        let path = self.composed_path(target);
        let mut suppressed = false;
        for (id, watch) in &self.watches {
            let Watch::Events {
                node,
                kinds,
                suppress_navigation,
            } = watch
            else {
                continue;
            };
            if path.contains(node) && kinds.contains(&kind) {
                suppressed |= *suppress_navigation;
                let event = match kind {
                    DomEventKind::Click => DomEvent::Click,
                    DomEventKind::Input => DomEvent::Input,
                    DomEventKind::Change => DomEvent::Change,
                };
                self.emit(*id, event);
            }
        }
        suppressed
    }

    fn link_in_path(&self, node: NodeId) -> Option<String> {
        self.composed_path(node)
            .into_iter()
            .find_map(|id| self.link_target(id))
    }

    fn link_target(&self, node: NodeId) -> Option<String> {
        let n = self.nodes.get(&node)?;
        if n.tag == "a" {
            n.attrs.get("href").cloned()
        } else {
            None
        }
    }

    fn text_content(&self, node: NodeId) -> String {
        let Some(n) = self.nodes.get(&node) else {
            return String::new();
        };
        let mut text = n.text.clone();
        for child in &n.children {
            text.push_str(&self.text_content(*child));
        }
        text
    }

    fn query(&self, from: NodeId, selector: &Selector) -> Option<NodeId> {
        let children = self.nodes.get(&from)?.children.clone();
        for child in children {
            if self.matches(child, selector) {
                return Some(child);
            }
            if let Some(found) = self.query(child, selector) {
                return Some(found);
            }
        }
        None
    }

    fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        let Some((last, rest)) = selector.parts.split_last() else {
            return false;
        };
        if !self.matches_compound(node, last) {
            return false;
        }
        // Descendant combinators, matched greedily against tree ancestors.
        let mut ancestors = self.tree_ancestors(node).into_iter().skip(1);
        rest.iter()
            .rev()
            .all(|part| ancestors.any(|a| self.matches_compound(a, part)))
    }

    fn matches_compound(&self, node: NodeId, compound: &Compound) -> bool {
        let Some(n) = self.nodes.get(&node) else {
            return false;
        };
        if n.host.is_some() || node == self.root {
            return false;
        }
        if compound.tag.as_deref().is_some_and(|tag| tag != n.tag) {
            return false;
        }
        if let Some(id) = &compound.id
            && n.attrs.get("id") != Some(id)
        {
            return false;
        }
        let classes: Vec<&str> = n
            .attrs
            .get("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();
        if !compound.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
        compound.attrs.iter().all(|(name, value)| match value {
            Some(v) => n.attrs.get(name) == Some(v),
            None => n.attrs.contains_key(name),
        })
    }
}

impl Page for MemoryPage {
    fn url(&self) -> String {
        self.dom.lock().url.clone()
    }

    fn query(&self, scope: Scope, selector: &str) -> Option<NodeId> {
        let selector = Selector::parse(selector)?;
        let dom = self.dom.lock();
        let from = match scope {
            Scope::Document => dom.root,
            Scope::Node(node) => node,
        };
        dom.query(from, &selector)
    }

    fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.dom.lock().nodes.get(&host)?.shadow
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.dom.lock().is_connected(node)
    }

    fn value(&self, node: NodeId) -> Option<String> {
        self.dom.lock().nodes.get(&node)?.value.clone()
    }

    fn text_content(&self, node: NodeId) -> Option<String> {
        let dom = self.dom.lock();
        dom.nodes
            .contains_key(&node)
            .then(|| dom.text_content(node))
    }

    fn link_target(&self, node: NodeId) -> Option<String> {
        self.dom.lock().link_target(node)
    }

    fn bounding_rect(&self, node: NodeId) -> Option<Rect> {
        let dom = self.dom.lock();
        if !dom.is_connected(node) {
            return None;
        }
        dom.nodes.get(&node).map(|n| n.rect)
    }

    fn viewport(&self) -> Size {
        self.dom.lock().viewport
    }

    fn watch(&mut self, watch: Watch) -> WatchId {
        let mut dom = self.dom.lock();
        let id = WatchId(dom.next_watch);
        dom.next_watch += 1;
        dom.watches.insert(id, watch);
        id
    }

    fn unwatch(&mut self, id: WatchId) {
        self.dom.lock().watches.remove(&id);
    }

    fn measure_label(&self, text: &str) -> Size {
        let chars = text.chars().count() as f64;
        let lines = (chars * 8.0 / 230.0).ceil().max(1.0);
        Size {
            width: (chars * 8.0 + 20.0).min(250.0),
            height: lines * 18.0 + 20.0,
        }
    }

    fn draw_guide(&mut self, frame: &GuideFrame) {
        let mut dom = self.dom.lock();
        dom.guide = Some(frame.clone());
        dom.guide_visible = true;
        dom.guide_draws += 1;
    }

    fn hide_guide(&mut self) {
        self.dom.lock().guide_visible = false;
    }

    fn remove_guide(&mut self) {
        let mut dom = self.dom.lock();
        dom.guide = None;
        dom.guide_visible = false;
    }

    fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        let mut dom = self.dom.lock();
        dom.navigations.push(url.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

#[derive(Debug)]
struct Selector {
    parts: Vec<Compound>,
}

impl Selector {
    fn parse(raw: &str) -> Option<Self> {
        let parts = raw
            .split_whitespace()
            .map(parse_compound)
            .collect::<Option<Vec<_>>>()?;
        (!parts.is_empty()).then_some(Self { parts })
    }
}

fn parse_compound(raw: &str) -> Option<Compound> {
    let mut compound = Compound::default();
    let mut rest = raw;
    let tag_end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
    if tag_end > 0 {
        let tag = &rest[..tag_end];
        if tag != "*" {
            compound.tag = Some(tag.to_ascii_lowercase());
        }
    }
    rest = &rest[tag_end..];
    while let Some(first) = rest.chars().next() {
        match first {
            '#' | '.' => {
                let body = &rest[1..];
                let end = body.find(['#', '.', '[']).unwrap_or(body.len());
                let name = body[..end].to_string();
                if name.is_empty() {
                    return None;
                }
                if first == '#' {
                    compound.id = Some(name);
                } else {
                    compound.classes.push(name);
                }
                rest = &body[end..];
            }
            '[' => {
                let end = rest.find(']')?;
                let inner = &rest[1..end];
                let attr = match inner.split_once('=') {
                    Some((name, value)) => (
                        name.trim().to_string(),
                        Some(value.trim().trim_matches(['"', '\'']).to_string()),
                    ),
                    None => (inner.trim().to_string(), None),
                };
                compound.attrs.push(attr);
                rest = &rest[end + 1..];
            }
            _ => return None,
        }
    }
    Some(compound)
}

fn parse_element(spec: &str) -> Node {
    let compound = parse_compound(spec).unwrap_or_default();
    let mut node = Node::element(compound.tag.as_deref().unwrap_or("div"));
    if let Some(id) = compound.id {
        node.attrs.insert("id".into(), id);
    }
    if !compound.classes.is_empty() {
        node.attrs.insert("class".into(), compound.classes.join(" "));
    }
    for (name, value) in compound.attrs {
        node.attrs.insert(name, value.unwrap_or_default());
    }
    node
}
