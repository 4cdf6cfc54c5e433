//! One job's comparison cycle: fetch source, pick its current key, look for that key at
//! the destination.

use std::sync::Arc;

use async_trait::async_trait;
use sheetsync_core::{Job, Row};
use sheetsync_fetch::{FetchChain, FetchError};

use crate::log::ExecutionLog;
use crate::SyncError;

/// Anything that can turn a feed url into decoded rows.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_rows(&self, url: &str) -> Result<Vec<Row>, FetchError>;
}

#[async_trait]
impl FeedSource for FetchChain {
    async fn fetch_rows(&self, url: &str) -> Result<Vec<Row>, FetchError> {
        self.fetch(url).await.map(|outcome| outcome.rows)
    }
}

#[derive(Debug)]
pub enum Decision {
    /// The current source key is absent at the destination; carries the whole source batch.
    NeedsSync { key: String, rows: Vec<Row> },
    UpToDate { key: String },
    Failed(SyncError),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NeedsSync { .. } => "needs-sync",
            Self::UpToDate { .. } => "up-to-date",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct Evaluator {
    feeds: Arc<dyn FeedSource>,
    log: ExecutionLog,
}

impl Evaluator {
    pub fn new(feeds: Arc<dyn FeedSource>, log: ExecutionLog) -> Self {
        Self { feeds, log }
    }

    /// Never retries; a failure ends this evaluation and is logged against the job.
    pub async fn evaluate(&self, job: &Job) -> Decision {
        match self.try_evaluate(job).await {
            Ok(decision) => decision,
            Err(err) => {
                self.log
                    .error(Some(&job.id), format!("[{}] error: {err}", job.name));
                Decision::Failed(err)
            }
        }
    }

    async fn try_evaluate(&self, job: &Job) -> Result<Decision, SyncError> {
        let job_id = Some(job.id.as_str());

        self.log
            .info(job_id, format!("[{}] reading source data...", job.name));
        let source = self.feeds.fetch_rows(&job.source_url).await?;

        // Feeds are append-ordered: the last row is the current one.
        let Some(current) = source.last() else {
            return Err(SyncError::EmptySourceData {
                url: job.source_url.clone(),
            });
        };
        let key = current_key(job, current)?;
        self.log.info(
            job_id,
            format!("[{}] source key {key} ({} rows)", job.name, source.len()),
        );

        self.log
            .info(job_id, format!("[{}] comparing against destination...", job.name));
        let destination = self.feeds.fetch_rows(&job.destination_url).await?;

        let present = destination
            .iter()
            .any(|row| row.get(&job.key_column) == Some(&key));
        if present {
            self.log.warning(
                job_id,
                format!("[{}] {key} already present at destination, nothing to write", job.name),
            );
            Ok(Decision::UpToDate { key })
        } else {
            self.log.success(
                job_id,
                format!("[{}] new data found ({key}), preparing write", job.name),
            );
            Ok(Decision::NeedsSync { key, rows: source })
        }
    }
}

/// The key-column value of `row`, which must be present and non-empty.
pub fn current_key(job: &Job, row: &Row) -> Result<String, SyncError> {
    match row.get(&job.key_column) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(SyncError::MissingKeyColumn {
            column: job.key_column.clone(),
            available: row.keys().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetsync_core::{JobKind, Severity};
    use sheetsync_fetch::{AttemptFailure, TransportFailure};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SRC: &str = "https://sheets.test/source";
    const DST: &str = "https://sheets.test/destination";

    #[derive(Default)]
    struct StaticFeeds {
        feeds: HashMap<String, Vec<Row>>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticFeeds {
        fn with(mut self, url: &str, csv: &str) -> Self {
            self.feeds
                .insert(url.to_string(), sheetsync_csv::decode(csv).unwrap());
            self
        }
    }

    #[async_trait]
    impl FeedSource for StaticFeeds {
        async fn fetch_rows(&self, url: &str) -> Result<Vec<Row>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.feeds
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::AllStrategiesExhausted {
                    attempts: vec![AttemptFailure {
                        strategy: "direct".into(),
                        error: TransportFailure::Status {
                            status: 404,
                            url: url.to_string(),
                        },
                    }],
                })
        }
    }

    fn job() -> Job {
        Job {
            id: "job-stock".into(),
            name: "Daily quotes".into(),
            description: String::new(),
            kind: JobKind::Stock,
            source_url: SRC.into(),
            destination_url: DST.into(),
            key_column: "日期".into(),
            slots: Vec::new(),
        }
    }

    fn evaluator(feeds: StaticFeeds) -> (Evaluator, Arc<StaticFeeds>, ExecutionLog) {
        let feeds = Arc::new(feeds);
        let log = ExecutionLog::default();
        (Evaluator::new(feeds.clone(), log.clone()), feeds, log)
    }

    #[tokio::test]
    async fn empty_destination_needs_full_source_batch() {
        let source = "商品分類,日期,收盤\nA,2025/12/01,10\nB,2025/12/02,11\n";
        let (eval, feeds, _log) = evaluator(StaticFeeds::default().with(SRC, source).with(DST, ""));

        match eval.evaluate(&job()).await {
            Decision::NeedsSync { key, rows } => {
                assert_eq!(key, "2025/12/02");
                assert_eq!(rows, sheetsync_csv::decode(source).unwrap());
            }
            other => panic!("expected NeedsSync, got {other:?}"),
        }
        assert_eq!(feeds.calls.lock().unwrap().as_slice(), [SRC, DST]);
    }

    #[tokio::test]
    async fn matching_key_at_destination_is_up_to_date() {
        let (eval, _feeds, log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "日期,收盤\n2025/12/01,10\n2025/12/02,11\n")
                .with(DST, "日期,收盤\n2025/11/28,9\n2025/12/02,11\n"),
        );

        let decision = eval.evaluate(&job()).await;
        assert!(matches!(decision, Decision::UpToDate { ref key } if key == "2025/12/02"));
        assert_eq!(log.recent(1)[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn key_comparison_is_exact() {
        let (eval, _feeds, _log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "日期\n2025/12/02\n")
                .with(DST, "日期\n2025/12/02 \n2025-12-02\n"),
        );
        assert!(matches!(eval.evaluate(&job()).await, Decision::NeedsSync { .. }));
    }

    #[tokio::test]
    async fn only_the_last_source_row_is_current() {
        let (eval, _feeds, _log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "日期\n2025/12/03\n2025/12/01\n")
                .with(DST, "日期\n2025/12/03\n"),
        );
        match eval.evaluate(&job()).await {
            Decision::NeedsSync { key, .. } => assert_eq!(key, "2025/12/01"),
            other => panic!("expected NeedsSync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_evaluation_is_stable() {
        let (eval, _feeds, _log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "日期\n2025/12/02\n")
                .with(DST, "日期\n2025/12/02\n"),
        );
        let first = eval.evaluate(&job()).await;
        let second = eval.evaluate(&job()).await;
        assert_eq!(first.label(), second.label());
        assert_eq!(first.label(), "up-to-date");
    }

    #[tokio::test]
    async fn empty_source_is_an_error_and_skips_destination() {
        let (eval, feeds, log) = evaluator(StaticFeeds::default().with(SRC, "日期\n").with(DST, ""));

        let decision = eval.evaluate(&job()).await;
        assert!(matches!(decision, Decision::Failed(SyncError::EmptySourceData { .. })));
        assert_eq!(feeds.calls.lock().unwrap().len(), 1);
        let last = &log.recent(1)[0];
        assert_eq!(last.severity, Severity::Error);
        assert!(last.message.contains("Daily quotes"));
    }

    #[tokio::test]
    async fn missing_key_column_lists_actual_columns() {
        let (eval, _feeds, _log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "date,close\n2025/12/01,10\n")
                .with(DST, ""),
        );
        match eval.evaluate(&job()).await {
            Decision::Failed(err @ SyncError::MissingKeyColumn { .. }) => {
                let message = err.to_string();
                assert!(message.contains("日期"), "{message}");
                assert!(message.contains("[date, close]"), "{message}");
            }
            other => panic!("expected MissingKeyColumn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_key_value_on_last_row_is_missing() {
        let (eval, _feeds, _log) = evaluator(
            StaticFeeds::default()
                .with(SRC, "日期,close\n2025/12/01,10\n,11\n")
                .with(DST, ""),
        );
        assert!(matches!(
            eval.evaluate(&job()).await,
            Decision::Failed(SyncError::MissingKeyColumn { .. })
        ));
    }

    #[tokio::test]
    async fn destination_fetch_failure_preserves_message() {
        let (eval, _feeds, _log) = evaluator(StaticFeeds::default().with(SRC, "日期\n2025/12/02\n"));
        match eval.evaluate(&job()).await {
            Decision::Failed(err @ SyncError::Fetch(_)) => {
                assert!(err.to_string().contains("404"), "{err}");
            }
            other => panic!("expected fetch failure, got {other:?}"),
        }
    }
}
