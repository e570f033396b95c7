use crate::page::{NodeId, Page, Scope};
use crate::task::SelectorSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(NodeId),
    /// Not present yet. `watch_scope` is the deepest tree on the selector
    /// chain that exists, where the missing piece is expected to appear.
    Missing { watch_scope: Scope },
}

pub fn locate(page: &dyn Page, spec: &SelectorSpec) -> Option<NodeId> {
    match resolve(page, spec) {
        Resolution::Found(node) => Some(node),
        Resolution::Missing { .. } => None,
    }
}

/// Resolves a selector chain, entering one open shadow root per segment.
/// Absence at any level is the normal "not yet present" outcome.
pub fn resolve(page: &dyn Page, spec: &SelectorSpec) -> Resolution {
    let segments = spec.segments();
    let mut scope = Scope::Document;
    for (depth, selector) in segments.iter().enumerate() {
        let Some(node) = page.query(scope, selector) else {
            return Resolution::Missing { watch_scope: scope };
        };
        if depth + 1 == segments.len() {
            return Resolution::Found(node);
        }
        match page.shadow_root(node) {
            Some(root) => scope = Scope::Node(root),
            None => return Resolution::Missing { watch_scope: scope },
        }
    }
    Resolution::Missing { watch_scope: scope }
}
