//! Sequential execution of repeated runs with cooperative cancellation.
//!
//! Runs never overlap. Cancellation is observed only before a run starts, and
//! the first failing run ends the batch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{BatchRunError, RunError, StatsError};
use crate::telemetry::{EngineEvent, EventCategory, NotificationLevel, TelemetrySink};

/// The single-run operation a batch repeats.
#[async_trait]
pub trait BatchRun: Send + Sync {
    /// `run_number` is 1-based.
    async fn run(&self, run_number: u32) -> Result<(), RunError>;
}

/// Fire-and-forget receiver of aggregate batch statistics.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record_batch(&self, runs_completed: u32) -> Result<(), StatsError>;
}

#[derive(Debug)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    Failed(BatchRunError),
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "error",
        }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: String,
    pub run_count: u32,
    pub completed_runs: u32,
    pub outcome: BatchOutcome,
    pub summary: String,
}

pub struct RunBatcher<R> {
    runner: R,
    telemetry: Arc<dyn TelemetrySink>,
    stats: Option<Arc<dyn StatsSink>>,
}

impl<R> RunBatcher<R>
where
    R: BatchRun,
{
    pub fn new(runner: R, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { runner, telemetry, stats: None }
    }

    pub fn with_stats_sink(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn run(&self, run_count: u32, cancellation: &CancellationToken) -> BatchReport {
        let batch_id = Uuid::new_v4().to_string();
        let mut completed_runs = 0_u32;
        info!(
            event_name = "core.batch.started",
            correlation_id = %batch_id,
            run_count,
            "starting batch"
        );

        let outcome = loop {
            if completed_runs == run_count {
                break BatchOutcome::Completed;
            }
            if cancellation.is_cancelled() {
                break BatchOutcome::Cancelled;
            }

            let run_number = completed_runs + 1;
            if let Err(source) = self.runner.run(run_number).await {
                warn!(
                    event_name = "core.batch.run_failed",
                    correlation_id = %batch_id,
                    run_number,
                    error = %source,
                    "run failed, stopping batch"
                );
                break BatchOutcome::Failed(BatchRunError { run_number, run_count, source });
            }

            completed_runs += 1;
            self.telemetry.emit(
                EngineEvent::new(
                    &batch_id,
                    "batch.run_completed",
                    EventCategory::Batch,
                    NotificationLevel::Progress,
                    format!("Run {completed_runs} of {run_count} finished"),
                )
                .with_metadata("completed_runs", completed_runs.to_string())
                .with_metadata("run_count", run_count.to_string()),
            );
        };

        let summary = summarize(&outcome, completed_runs, run_count);
        self.telemetry.emit(terminal_event(&batch_id, &outcome, &summary, completed_runs));
        info!(
            event_name = "core.batch.finished",
            correlation_id = %batch_id,
            outcome = outcome.as_str(),
            completed_runs,
            run_count,
            "batch finished"
        );

        let record_stats = match outcome {
            BatchOutcome::Completed | BatchOutcome::Cancelled => completed_runs > 0,
            BatchOutcome::Failed(_) => false,
        };
        if record_stats {
            self.spawn_stats(&batch_id, completed_runs);
        }

        BatchReport { batch_id, run_count, completed_runs, outcome, summary }
    }

    fn spawn_stats(&self, batch_id: &str, completed_runs: u32) {
        let Some(stats) = self.stats.clone() else {
            return;
        };
        let batch_id = batch_id.to_owned();
        tokio::spawn(async move {
            if let Err(error) = stats.record_batch(completed_runs).await {
                warn!(
                    event_name = "core.batch.stats_failed",
                    correlation_id = %batch_id,
                    error = %error,
                    "failed to record batch statistics"
                );
            }
        });
    }
}

fn summarize(outcome: &BatchOutcome, completed_runs: u32, run_count: u32) -> String {
    match outcome {
        BatchOutcome::Completed if run_count == 1 => "Run completed successfully".to_owned(),
        BatchOutcome::Completed => format!("All {run_count} runs completed successfully"),
        BatchOutcome::Cancelled => {
            format!("Batch cancelled after {completed_runs} of {run_count} runs")
        }
        BatchOutcome::Failed(error) => format!(
            "Run {} of {} failed: {}",
            error.run_number,
            error.run_count,
            error.source.user_message()
        ),
    }
}

fn terminal_event(
    batch_id: &str,
    outcome: &BatchOutcome,
    summary: &str,
    completed_runs: u32,
) -> EngineEvent {
    let (event_type, level) = match outcome {
        BatchOutcome::Completed => ("batch.completed", NotificationLevel::Success),
        BatchOutcome::Cancelled => ("batch.cancelled", NotificationLevel::Info),
        BatchOutcome::Failed(_) => ("batch.failed", NotificationLevel::Error),
    };
    let event = EngineEvent::new(batch_id, event_type, EventCategory::Batch, level, summary)
        .with_metadata("completed_runs", completed_runs.to_string());
    match outcome {
        BatchOutcome::Failed(error) => event.with_metadata("error", error.to_string()),
        _ => event,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{BatchOutcome, BatchRun, RunBatcher, StatsSink};
    use crate::errors::{RunError, StatsError};
    use crate::telemetry::{InMemoryTelemetrySink, NotificationLevel};

    #[derive(Default)]
    struct ScriptedRun {
        started: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
        cancel_after: Option<(u32, CancellationToken)>,
    }

    impl ScriptedRun {
        fn started(&self) -> Vec<u32> {
            match self.started.lock() {
                Ok(started) => started.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    #[async_trait]
    impl BatchRun for ScriptedRun {
        async fn run(&self, run_number: u32) -> Result<(), RunError> {
            if let Ok(mut started) = self.started.lock() {
                started.push(run_number);
            }
            if self.fail_on == Some(run_number) {
                return Err(RunError::Other(format!("run {run_number} broke")));
            }
            if let Some((after, token)) = &self.cancel_after {
                if *after == run_number {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    struct ChannelStats {
        sender: mpsc::UnboundedSender<u32>,
        fail: bool,
    }

    #[async_trait]
    impl StatsSink for ChannelStats {
        async fn record_batch(&self, runs_completed: u32) -> Result<(), StatsError> {
            let _ = self.sender.send(runs_completed);
            if self.fail {
                return Err(StatsError::Request("endpoint returned 503".to_owned()));
            }
            Ok(())
        }
    }

    fn stats_channel(fail: bool) -> (Arc<ChannelStats>, mpsc::UnboundedReceiver<u32>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelStats { sender, fail }), receiver)
    }

    #[tokio::test]
    async fn all_runs_complete_with_one_aggregate_notification() {
        let telemetry = InMemoryTelemetrySink::default();
        let (stats, mut recorded) = stats_channel(false);
        let batcher = RunBatcher::new(ScriptedRun::default(), Arc::new(telemetry.clone()))
            .with_stats_sink(stats);

        let report = batcher.run(3, &CancellationToken::new()).await;

        assert!(matches!(report.outcome, BatchOutcome::Completed));
        assert_eq!(report.completed_runs, 3);
        assert_eq!(batcher.runner().started(), vec![1, 2, 3]);
        assert_eq!(telemetry.events_of_type("batch.run_completed").len(), 3);
        let terminal = telemetry.events_of_type("batch.completed");
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].level, NotificationLevel::Success);

        let runs = tokio::time::timeout(Duration::from_secs(1), recorded.recv())
            .await
            .expect("stats call issued");
        assert_eq!(runs, Some(3));
    }

    #[tokio::test]
    async fn cancellation_after_second_run_stops_before_third() {
        let token = CancellationToken::new();
        let telemetry = InMemoryTelemetrySink::default();
        let (stats, mut recorded) = stats_channel(false);
        let runner =
            ScriptedRun { cancel_after: Some((2, token.clone())), ..ScriptedRun::default() };
        let batcher = RunBatcher::new(runner, Arc::new(telemetry.clone())).with_stats_sink(stats);

        let report = batcher.run(5, &token).await;

        assert!(matches!(report.outcome, BatchOutcome::Cancelled));
        assert_eq!(report.completed_runs, 2);
        assert_eq!(batcher.runner().started(), vec![1, 2]);
        let terminal = telemetry.events_of_type("batch.cancelled");
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].level, NotificationLevel::Info);
        assert!(report.summary.contains("2 of 5"));

        let runs = tokio::time::timeout(Duration::from_secs(1), recorded.recv())
            .await
            .expect("stats call issued for partial batch");
        assert_eq!(runs, Some(2));
    }

    #[tokio::test]
    async fn failing_run_stops_the_batch_fail_fast() {
        let telemetry = InMemoryTelemetrySink::default();
        let (stats, mut recorded) = stats_channel(false);
        let runner = ScriptedRun { fail_on: Some(3), ..ScriptedRun::default() };
        let batcher = RunBatcher::new(runner, Arc::new(telemetry.clone())).with_stats_sink(stats);

        let report = batcher.run(5, &CancellationToken::new()).await;

        assert!(matches!(report.outcome, BatchOutcome::Failed(ref error) if error.run_number == 3));
        assert_eq!(report.completed_runs, 2);
        assert_eq!(batcher.runner().started(), vec![1, 2, 3]);
        assert_eq!(telemetry.events_of_type("batch.failed").len(), 1);
        assert!(telemetry.events_of_type("batch.cancelled").is_empty());

        drop(batcher);
        assert_eq!(recorded.recv().await, None, "failed batches record no statistics");
    }

    #[tokio::test]
    async fn pre_cancelled_batch_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let batcher =
            RunBatcher::new(ScriptedRun::default(), Arc::new(InMemoryTelemetrySink::default()));

        let report = batcher.run(4, &token).await;

        assert!(matches!(report.outcome, BatchOutcome::Cancelled));
        assert_eq!(report.completed_runs, 0);
        assert!(batcher.runner().started().is_empty());
    }

    #[tokio::test]
    async fn stats_failure_does_not_change_outcome() {
        let (stats, mut recorded) = stats_channel(true);
        let batcher =
            RunBatcher::new(ScriptedRun::default(), Arc::new(InMemoryTelemetrySink::default()))
                .with_stats_sink(stats);

        let report = batcher.run(2, &CancellationToken::new()).await;

        assert!(matches!(report.outcome, BatchOutcome::Completed));
        assert_eq!(report.completed_runs, 2);
        let runs = tokio::time::timeout(Duration::from_secs(1), recorded.recv())
            .await
            .expect("stats call issued");
        assert_eq!(runs, Some(2));
    }
}
