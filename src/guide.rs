//! Highlight box and instruction label that follow the target's live layout.

use crate::locator;
use crate::page::{GuideFrame, NodeId, Page, Rect, Size, Watch, WatchId};
use crate::task::SelectorSpec;

/// Gap between the target and the label, and between the label and the viewport edge.
pub const LABEL_MARGIN: f64 = 10.0;
/// Extra room a side needs beyond the label's size to be chosen.
const LABEL_ROOM: f64 = 20.0;

#[derive(Debug, Default)]
pub struct GuideRenderer {
    frames: Option<WatchId>,
    highlight: Option<SelectorSpec>,
    fallback: Option<NodeId>,
    resolved: Option<NodeId>,
    text: String,
    last: Option<GuideFrame>,
    visible: bool,
}

impl GuideRenderer {
    /// Creates the guide, or updates content and position if one exists.
    pub fn show(&mut self, page: &mut dyn Page, highlight: &SelectorSpec, fallback: NodeId, text: &str) {
        self.highlight = Some(highlight.clone());
        self.fallback = Some(fallback);
        self.resolved = None;
        self.text = text.to_string();
        self.last = None;
        if self.frames.is_none() {
            self.frames = Some(page.watch(Watch::Frames));
        }
        self.render(page);
    }

    pub fn owns(&self, watch: WatchId) -> bool {
        self.frames == Some(watch)
    }

    pub fn is_active(&self) -> bool {
        self.frames.is_some()
    }

    pub fn on_frame(&mut self, page: &mut dyn Page) {
        if self.is_active() {
            self.render(page);
        }
    }

    /// Stops tracking and removes the guide from the page.
    pub fn clear(&mut self, page: &mut dyn Page) {
        if let Some(frames) = self.frames.take() {
            page.unwatch(frames);
        }
        if self.last.take().is_some() || self.visible {
            page.remove_guide();
        }
        *self = Self::default();
    }

    fn render(&mut self, page: &mut dyn Page) {
        let Some(target) = self.target_rect(page) else {
            if self.visible {
                page.hide_guide();
                self.visible = false;
            }
            return;
        };
        let label = place_label(target, page.measure_label(&self.text), page.viewport());
        let frame = GuideFrame {
            highlight: target,
            label,
            text: self.text.clone(),
        };
        if !self.visible || self.last.as_ref() != Some(&frame) {
            page.draw_guide(&frame);
            self.last = Some(frame);
            self.visible = true;
        }
    }

    fn target_rect(&mut self, page: &dyn Page) -> Option<Rect> {
        let cached = self.resolved.filter(|node| page.is_connected(*node));
        let node = match cached {
            Some(node) => node,
            None => {
                let found = self
                    .highlight
                    .as_ref()
                    .and_then(|spec| locator::locate(page, spec))
                    .or(self.fallback)
                    .filter(|node| page.is_connected(*node))?;
                self.resolved = Some(found);
                found
            }
        };
        page.bounding_rect(node).filter(|rect| !rect.is_empty())
    }
}

/// Picks the label position: right of the target, else left, else below,
/// else above, then clamps it inside the viewport.
pub fn place_label(target: Rect, label: Size, viewport: Size) -> Rect {
    let space_right = viewport.width - target.right();
    let space_left = target.x;
    let space_below = viewport.height - target.bottom();

    let (mut x, mut y) = if space_right > label.width + LABEL_ROOM {
        (target.right() + LABEL_MARGIN, target.y)
    } else if space_left > label.width + LABEL_ROOM {
        (target.x - label.width - LABEL_MARGIN, target.y)
    } else if space_below > label.height + LABEL_ROOM {
        (target.x, target.bottom() + LABEL_MARGIN)
    } else {
        (target.x, target.y - label.height - LABEL_MARGIN)
    };

    if y < LABEL_MARGIN {
        y = LABEL_MARGIN;
    }
    if y + label.height > viewport.height - LABEL_MARGIN {
        y = viewport.height - label.height - LABEL_MARGIN;
    }
    if x < LABEL_MARGIN {
        x = LABEL_MARGIN;
    }
    if x + label.width > viewport.width - LABEL_MARGIN {
        x = viewport.width - label.width - LABEL_MARGIN;
    }
    Rect::new(x, y, label.width, label.height)
}
