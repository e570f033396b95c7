use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::error::StepError;
use crate::page::{DomEvent, DomEventKind, NodeId, Page, PageEvent, Scope, Watch, WatchId};
use crate::task::{ActionType, Step};

/// What the engine must do once a step is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    /// Destination of a hyperlink whose default navigation was suppressed.
    pub navigate_to: Option<String>,
}

#[derive(Debug)]
enum Condition {
    Click { destination: Option<String> },
    /// Trimmed, lower-cased field value equals this (already lower-cased) text.
    Equals { expected: String },
    Pattern { regex: Regex },
}

/// An armed completion check for one step. Fires at most once; firing or
/// disarming releases every watch it installed.
#[derive(Debug)]
pub struct Detector {
    condition: Condition,
    target: NodeId,
    watches: Vec<WatchId>,
    reveal_at: Option<Instant>,
    fired: bool,
}

impl Detector {
    pub fn arm(
        page: &mut dyn Page,
        step: &Step,
        target: NodeId,
        reveal_delay: Duration,
    ) -> Result<Self, StepError> {
        let (condition, watch) = match step.action_type {
            ActionType::Click => {
                let destination = page.link_target(target);
                let watch = Watch::Events {
                    node: target,
                    kinds: vec![DomEventKind::Click],
                    suppress_navigation: destination.is_some(),
                };
                (Condition::Click { destination }, watch)
            }
            ActionType::TextMatch => {
                let expected = step.expected_text()?.to_lowercase();
                let watch = Watch::Events {
                    node: target,
                    kinds: vec![DomEventKind::Input, DomEventKind::Change],
                    suppress_navigation: false,
                };
                (Condition::Equals { expected }, watch)
            }
            ActionType::TextChangeMatch => {
                let regex = step.pattern()?;
                let watch = Watch::Mutations {
                    scope: Scope::Node(target),
                    character_data: true,
                };
                (Condition::Pattern { regex }, watch)
            }
        };

        let mut detector = Self {
            condition,
            target,
            watches: vec![page.watch(watch)],
            reveal_at: None,
            fired: false,
        };
        // Already satisfied: fire after the instruction has been visible a moment.
        if matches!(detector.condition, Condition::Pattern { .. }) && detector.satisfied(page) {
            detector.reveal_at = Some(Instant::now() + reveal_delay);
        }
        Ok(detector)
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn is_armed(&self) -> bool {
        !self.fired && !self.watches.is_empty()
    }

    pub fn owns(&self, watch: WatchId) -> bool {
        self.watches.contains(&watch)
    }

    pub fn reveal_deadline(&self) -> Option<Instant> {
        self.reveal_at.filter(|_| !self.fired)
    }

    pub fn handle(&mut self, page: &mut dyn Page, event: &PageEvent) -> Option<Completion> {
        if self.fired || !self.owns(event.watch) {
            return None;
        }
        let done = match (&self.condition, event.event) {
            (Condition::Click { .. }, DomEvent::Click) => true,
            (Condition::Equals { .. }, DomEvent::Input | DomEvent::Change) => self.satisfied(page),
            (Condition::Pattern { .. }, DomEvent::Mutated) => self.satisfied(page),
            _ => false,
        };
        done.then(|| self.fire(page))
    }

    pub fn on_reveal(&mut self, page: &mut dyn Page) -> Option<Completion> {
        if self.fired || self.reveal_at.take().is_none() {
            return None;
        }
        self.satisfied(page).then(|| self.fire(page))
    }

    pub fn disarm(&mut self, page: &mut dyn Page) {
        for watch in self.watches.drain(..) {
            page.unwatch(watch);
        }
        self.reveal_at = None;
    }

    fn fire(&mut self, page: &mut dyn Page) -> Completion {
        self.fired = true;
        self.disarm(page);
        match &self.condition {
            Condition::Click { destination } => Completion {
                navigate_to: destination.clone(),
            },
            _ => Completion::default(),
        }
    }

    fn satisfied(&self, page: &dyn Page) -> bool {
        match &self.condition {
            Condition::Click { .. } => false,
            Condition::Equals { expected } => page
                .value(self.target)
                .is_some_and(|value| value.trim().to_lowercase() == *expected),
            Condition::Pattern { regex } => page
                .text_content(self.target)
                .is_some_and(|text| regex.is_match(&text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::memory::MemoryPage;
    use crate::task::SelectorSpec;

    fn step(action_type: ActionType, expected: Option<&str>) -> Step {
        Step {
            id: "s".into(),
            selector: SelectorSpec::from("#t"),
            highlight_selector: None,
            action_type,
            expected: expected.map(String::from),
            instruction: "Do it".into(),
        }
    }

    #[test]
    fn text_match_ignores_case_and_whitespace() {
        let (mut page, mut rx) = MemoryPage::new("https://lab.test/");
        let input = page.append(page.document(), "input#t");
        let mut detector = Detector::arm(
            &mut page,
            &step(ActionType::TextMatch, Some("Yes")),
            input,
            Duration::ZERO,
        )
        .unwrap();

        page.type_text(input, "ye");
        let event = rx.try_recv().unwrap();
        assert_eq!(detector.handle(&mut page, &event), None);

        page.type_text(input, "  YES ");
        let event = rx.try_recv().unwrap();
        assert_eq!(detector.handle(&mut page, &event), Some(Completion::default()));
        assert!(!detector.is_armed());
        assert_eq!(page.watch_count(), 0);

        // A second satisfying event cannot fire again.
        assert_eq!(detector.handle(&mut page, &event), None);
    }

    #[test]
    fn link_click_captures_destination() {
        let (mut page, mut rx) = MemoryPage::new("https://lab.test/");
        let link = page.append(page.document(), "a#t");
        page.set_attr(link, "href", "https://lab.test/next");
        let mut detector =
            Detector::arm(&mut page, &step(ActionType::Click, None), link, Duration::ZERO).unwrap();

        page.click(link);
        assert!(page.navigations().is_empty());
        let event = rx.try_recv().unwrap();
        assert_eq!(
            detector.handle(&mut page, &event),
            Some(Completion {
                navigate_to: Some("https://lab.test/next".into())
            })
        );
    }

    #[test]
    fn pattern_fires_on_text_mutation() {
        let (mut page, mut rx) = MemoryPage::new("https://lab.test/");
        let status = page.append(page.document(), "p#t");
        let mut detector = Detector::arm(
            &mut page,
            &step(ActionType::TextChangeMatch, Some("sav(ed|ing)")),
            status,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(detector.reveal_deadline(), None);

        page.set_text(status, "Draft SAVED");
        let event = rx.try_recv().unwrap();
        assert!(detector.handle(&mut page, &event).is_some());
    }

    #[test]
    fn disconnected_target_stays_armed() {
        let (mut page, mut rx) = MemoryPage::new("https://lab.test/");
        let input = page.append(page.document(), "input#t");
        let mut detector = Detector::arm(
            &mut page,
            &step(ActionType::TextMatch, Some("yes")),
            input,
            Duration::ZERO,
        )
        .unwrap();

        page.remove(input);
        page.blur(input);
        let event = rx.try_recv().unwrap();
        assert_eq!(detector.handle(&mut page, &event), None);
        assert!(detector.is_armed());

        detector.disarm(&mut page);
        detector.disarm(&mut page);
        assert_eq!(page.watch_count(), 0);
    }
}
