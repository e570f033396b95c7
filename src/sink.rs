use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SinkError;
use crate::message::ProgressEvent;

pub const SOURCE_TAG: &str = "stepguide";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub identifier: String,
    pub task_id: String,
    pub percent_complete: u32,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl ProgressReport {
    pub fn new(identifier: &str, event: &ProgressEvent) -> Self {
        Self {
            identifier: identifier.to_string(),
            task_id: event.task_id.clone(),
            percent_complete: event.percent_complete(),
            timestamp: Utc::now(),
            source: SOURCE_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkAck {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outbound progress logging. One request per report, never retried.
#[derive(Clone, Default)]
pub struct ProgressSink {
    client: Client,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report(&self, url: &str, report: &ProgressReport) -> Result<SinkAck, SinkError> {
        let response = self.client.post(url).json(report).send().await?;
        let status = response.status();
        let ack: SinkAck = response.json().await?;
        debug!(%status, ?ack, "progress sink replied");

        if !status.is_success() || ack.status != "success" {
            return Err(SinkError::Rejected(
                ack.message.unwrap_or_else(|| format!("status {}", status)),
            ));
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/log", addr)
    }

    fn event() -> ProgressEvent {
        ProgressEvent {
            task_id: "lab1".into(),
            step_index: 1,
            total_steps: 4,
        }
    }

    #[tokio::test]
    async fn posts_report_and_accepts_success() {
        let seen = Arc::new(Mutex::new(None::<ProgressReport>));
        let captured = seen.clone();
        let app = Router::new().route(
            "/log",
            post(move |Json(report): Json<ProgressReport>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().await = Some(report);
                    Json(SinkAck {
                        status: "success".into(),
                        message: None,
                    })
                }
            }),
        );
        let url = serve(app).await;

        let report = ProgressReport::new("student@example.com", &event());
        ProgressSink::new().report(&url, &report).await.unwrap();

        let received = seen.lock().await.clone().unwrap();
        assert_eq!(received.identifier, "student@example.com");
        assert_eq!(received.percent_complete, 50);
        assert_eq!(received.source, SOURCE_TAG);
    }

    #[tokio::test]
    async fn error_ack_is_rejected() {
        let app = Router::new().route(
            "/log",
            post(|| async {
                Json(SinkAck {
                    status: "error".into(),
                    message: Some("sheet locked".into()),
                })
            }),
        );
        let url = serve(app).await;

        let err = ProgressSink::new()
            .report(&url, &ProgressReport::new("u", &event()))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Rejected(msg) if msg == "sheet locked"));
    }
}
