//! Cross-context message contract.
//!
//! Requests that need an answer (`START_TASK`, `STOP_TASK`) carry a oneshot
//! reply. Notifications (`STEP_COMPLETED`, `REFRESH_STATE`, `LOG_PROGRESS`)
//! are fire-and-forget: a closed or listener-less channel is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub const OK: Ack = Ack { success: true };
}

/// Coordinator to engine.
#[derive(Debug)]
pub enum EngineCommand {
    Start {
        task_id: String,
        task: Task,
        step_index: usize,
        reply: oneshot::Sender<Ack>,
    },
    Stop {
        reply: oneshot::Sender<Ack>,
    },
}

/// Engine (or coordinator) to observer panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    StepCompleted { task_id: String, step_index: usize },
    RefreshState,
}

impl Notice {
    pub fn event_name(&self) -> &'static str {
        match self {
            Notice::StepCompleted { .. } => "step_completed",
            Notice::RefreshState => "refresh_state",
        }
    }
}

/// Engine to coordinator: relay progress to the external sink.
/// `step_index` is the step that was just completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub step_index: usize,
    pub total_steps: usize,
}

impl ProgressEvent {
    pub fn percent_complete(&self) -> u32 {
        if self.total_steps == 0 {
            return 100;
        }
        let ratio = (self.step_index + 1) as f64 / self.total_steps as f64;
        (ratio * 100.0).round().min(100.0) as u32
    }
}

/// Observer panel to coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanelRequest {
    InitiateTask,
    StopTaskOnTab,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_use_action_tags() {
        let json = serde_json::to_value(Notice::StepCompleted {
            task_id: "lab1".into(),
            step_index: 2,
        })
        .unwrap();
        assert_eq!(json["action"], "STEP_COMPLETED");

        let req: PanelRequest = serde_json::from_str(r#"{"action":"STOP_TASK_ON_TAB"}"#).unwrap();
        assert_eq!(req, PanelRequest::StopTaskOnTab);
    }

    #[test]
    fn percent_rounds_completed_steps() {
        let event = ProgressEvent {
            task_id: "lab1".into(),
            step_index: 0,
            total_steps: 3,
        };
        assert_eq!(event.percent_complete(), 33);
        assert_eq!(
            ProgressEvent {
                step_index: 1,
                ..event.clone()
            }
            .percent_complete(),
            67
        );
        assert_eq!(
            ProgressEvent {
                step_index: 2,
                ..event
            }
            .percent_complete(),
            100
        );
    }
}
