use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// Where a step's element lives. A chain is resolved left to right, each
/// later selector inside the open shadow root of the previous match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorSpec {
    Single(String),
    Chain(Vec<String>),
}

impl SelectorSpec {
    pub fn segments(&self) -> &[String] {
        match self {
            SelectorSpec::Single(selector) => std::slice::from_ref(selector),
            SelectorSpec::Chain(chain) => chain,
        }
    }
}

impl From<&str> for SelectorSpec {
    fn from(selector: &str) -> Self {
        SelectorSpec::Single(selector.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    TextMatch,
    TextChangeMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub selector: SelectorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_selector: Option<SelectorSpec>,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub instruction: String,
}

impl Step {
    /// The selector used for visual targeting only.
    pub fn highlight(&self) -> &SelectorSpec {
        self.highlight_selector.as_ref().unwrap_or(&self.selector)
    }

    pub fn expected_text(&self) -> Result<&str, StepError> {
        self.expected
            .as_deref()
            .ok_or_else(|| StepError::MissingExpected {
                step: self.id.clone(),
            })
    }

    /// Case-insensitive pattern for `text_change_match` steps.
    pub fn pattern(&self) -> Result<Regex, StepError> {
        RegexBuilder::new(self.expected_text()?)
            .case_insensitive(true)
            .build()
            .map_err(|source| StepError::BadPattern {
                step: self.id.clone(),
                source,
            })
    }

    pub fn validate(&self) -> Result<(), StepError> {
        if self.selector.segments().is_empty()
            || self.selector.segments().iter().any(|s| s.trim().is_empty())
        {
            return Err(StepError::EmptySelector {
                step: self.id.clone(),
            });
        }
        match self.action_type {
            ActionType::Click => Ok(()),
            ActionType::TextMatch => self.expected_text().map(|_| ()),
            ActionType::TextChangeMatch => self.pattern().map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    pub steps: Vec<Step>,
}

impl Task {
    /// A task without a scope runs anywhere.
    pub fn matches_url(&self, url: &str) -> bool {
        self.start_url
            .as_deref()
            .is_none_or(|prefix| url.starts_with(prefix))
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}
