//! Destination write collaborators. The engine hands over the full source batch and
//! treats the call as fire-and-forget: no rollback links it to the fetch phase.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sheetsync_core::{Job, Row};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub rows_written: Option<usize>,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct WriteError(pub String);

#[async_trait]
pub trait RowWriter: Send + Sync {
    async fn write(&self, job: &Job, rows: &[Row]) -> Result<WriteAck, WriteError>;
}

/// Stand-in writer: waits `delay` and acknowledges every row.
#[derive(Debug, Clone)]
pub struct SimulatedWriter {
    delay: Duration,
}

impl SimulatedWriter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl RowWriter for SimulatedWriter {
    async fn write(&self, job: &Job, rows: &[Row]) -> Result<WriteAck, WriteError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(WriteAck {
            rows_written: Some(rows.len()),
            message: format!("Appended {} new rows to {}", rows.len(), job.name),
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    job_id: &'a str,
    job_name: &'a str,
    rows: &'a [Row],
}

/// POSTs the batch as JSON to an append endpoint (e.g. a spreadsheet web app).
#[derive(Debug, Clone)]
pub struct WebhookWriter {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookWriter {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RowWriter for WebhookWriter {
    async fn write(&self, job: &Job, rows: &[Row]) -> Result<WriteAck, WriteError> {
        let payload = WebhookPayload {
            job_id: &job.id,
            job_name: &job.name,
            rows,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| WriteError(format!("posting to {}: {err}", self.endpoint)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WriteError(format!(
                "write endpoint {} answered {}",
                self.endpoint,
                status.as_u16()
            )));
        }
        info!(job_id = %job.id, rows = rows.len(), "rows posted to write endpoint");
        Ok(WriteAck {
            rows_written: Some(rows.len()),
            message: format!("Posted {} rows for {} to the write endpoint", rows.len(), job.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use sheetsync_core::JobKind;
    use std::sync::{Arc, Mutex};

    fn job() -> Job {
        Job {
            id: "job-a".into(),
            name: "Quotes".into(),
            description: String::new(),
            kind: JobKind::Stock,
            source_url: "https://sheets.test/src".into(),
            destination_url: "https://sheets.test/dst".into(),
            key_column: "date".into(),
            slots: Vec::new(),
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| [("date".to_string(), format!("2026-01-0{}", i + 1))].into_iter().collect())
            .collect()
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn simulated_writer_acknowledges_row_count() {
        let ack = SimulatedWriter::new(Duration::ZERO)
            .write(&job(), &rows(3))
            .await
            .unwrap();
        assert_eq!(ack.rows_written, Some(3));
        assert_eq!(ack.message, "Appended 3 new rows to Quotes");
    }

    #[tokio::test]
    async fn webhook_writer_posts_rows_as_json() {
        let received = Arc::new(Mutex::new(None::<serde_json::Value>));
        let sink = received.clone();
        let base = spawn(Router::new().route(
            "/append",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some(body);
                    StatusCode::OK
                }
            }),
        ))
        .await;

        let writer = WebhookWriter::new(reqwest::Client::new(), format!("{base}/append"));
        let ack = writer.write(&job(), &rows(2)).await.unwrap();
        assert_eq!(ack.rows_written, Some(2));

        let body = received.lock().unwrap().clone().unwrap();
        assert_eq!(body["job_id"], "job-a");
        assert_eq!(body["rows"].as_array().unwrap().len(), 2);
        assert_eq!(body["rows"][1]["date"], "2026-01-02");
    }

    #[tokio::test]
    async fn webhook_rejection_is_a_write_error() {
        let base = spawn(Router::new().route(
            "/append",
            post(|| async { StatusCode::FORBIDDEN }),
        ))
        .await;
        let writer = WebhookWriter::new(reqwest::Client::new(), format!("{base}/append"));
        let err = writer.write(&job(), &rows(1)).await.unwrap_err();
        assert!(err.to_string().contains("403"), "{err}");
    }
}
