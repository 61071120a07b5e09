use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::debug::plan::{Block, BlockId, BlockPlan};
use crate::errors::{DebugError, RunError};
use crate::telemetry::{EngineEvent, EventCategory, NotificationLevel, TelemetrySink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugState {
    Idle,
    Debugging,
}

/// Shared debug-mode switch. Any holder may flip it; the controller only reads
/// it when a run starts and between steps.
#[derive(Clone, Debug, Default)]
pub struct DebugMode(Arc<AtomicBool>);

impl DebugMode {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Seeds the switch from `engine.debug_mode`.
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self::new(engine.debug_mode)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockOutput {
    pub content: Value,
    /// Blocks the executed block ruled out, e.g. the branch a router did not take.
    #[serde(default)]
    pub pruned: Vec<BlockId>,
}

impl BlockOutput {
    pub fn new(content: Value) -> Self {
        Self { content, pruned: Vec::new() }
    }

    pub fn pruning(mut self, block_id: impl Into<BlockId>) -> Self {
        self.pruned.push(block_id.into());
        self
    }
}

/// Outputs of the blocks executed so far in one run, in execution order.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockContext {
    pub run_id: String,
    pub outputs: IndexMap<BlockId, BlockOutput>,
}

impl BlockContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), outputs: IndexMap::new() }
    }

    pub fn output(&self, block_id: &BlockId) -> Option<&BlockOutput> {
        self.outputs.get(block_id)
    }

    pub fn executed(&self) -> impl Iterator<Item = &BlockId> {
        self.outputs.keys()
    }
}

#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, block: &Block, context: &BlockContext)
        -> Result<BlockOutput, RunError>;
}

#[async_trait]
impl<E> BlockExecutor for Arc<E>
where
    E: BlockExecutor + ?Sized,
{
    async fn execute(
        &self,
        block: &Block,
        context: &BlockContext,
    ) -> Result<BlockOutput, RunError> {
        (**self).execute(block, context).await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StartOutcome {
    /// Debug mode is on; nothing has executed yet.
    Paused { pending: Vec<BlockId> },
    /// Debug mode is off; every block ran.
    Completed(BlockContext),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub executed: BlockId,
    pub output: BlockOutput,
    pub pending: Vec<BlockId>,
    /// Set once the session has ended, either because nothing is left or
    /// because debug mode was switched off during the step.
    pub completed: Option<BlockContext>,
}

struct Session {
    plan: BlockPlan,
    pending: IndexSet<BlockId>,
    context: BlockContext,
}

impl Session {
    fn new(plan: BlockPlan) -> Self {
        let pending = plan.execution_order().iter().cloned().collect();
        Self { plan, pending, context: BlockContext::new(Uuid::new_v4().to_string()) }
    }

    /// Drops pending blocks that were pruned, or that depend on a block which
    /// will never execute. The pending set is kept in dependency order, so a
    /// single forward pass reaches the fixpoint.
    fn recompute_pending(&mut self, pruned: &[BlockId]) {
        let pruned: HashSet<&BlockId> = pruned.iter().collect();
        let mut kept = IndexSet::with_capacity(self.pending.len());

        for block_id in &self.pending {
            if pruned.contains(block_id) {
                continue;
            }
            let reachable = self.plan.block(block_id).is_some_and(|block| {
                block.depends_on.iter().all(|dependency| {
                    self.context.outputs.contains_key(dependency) || kept.contains(dependency)
                })
            });
            if reachable {
                kept.insert(block_id.clone());
            }
        }

        debug_assert!(kept.len() <= self.pending.len());
        self.pending = kept;
    }
}

/// Gates block execution behind explicit step/resume/cancel calls when debug
/// mode is enabled.
pub struct DebugController<E> {
    executor: E,
    mode: DebugMode,
    session: Option<Session>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl<E> DebugController<E>
where
    E: BlockExecutor,
{
    pub fn new(executor: E, mode: DebugMode) -> Self {
        Self { executor, mode, session: None, telemetry: None }
    }

    /// Publishes session transitions as `debug.*` events.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn mode(&self) -> &DebugMode {
        &self.mode
    }

    pub fn state(&self) -> DebugState {
        if self.session.is_some() {
            DebugState::Debugging
        } else {
            DebugState::Idle
        }
    }

    pub fn is_debugging(&self) -> bool {
        self.session.is_some()
    }

    pub fn pending_blocks(&self) -> Vec<BlockId> {
        self.session
            .as_ref()
            .map(|session| session.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn start(&mut self, plan: BlockPlan) -> Result<StartOutcome, DebugError> {
        if self.session.is_some() {
            return Err(DebugError::AlreadyDebugging);
        }

        let mut session = Session::new(plan);
        if self.mode.is_enabled() {
            let pending: Vec<BlockId> = session.pending.iter().cloned().collect();
            info!(
                event_name = "core.debug.session_started",
                correlation_id = %session.context.run_id,
                pending = pending.len(),
                "debug session started"
            );
            publish(
                &self.telemetry,
                debug_event(
                    &session.context.run_id,
                    "debug.session_started",
                    NotificationLevel::Info,
                    format!("Paused before {} blocks", pending.len()),
                )
                .with_metadata("pending", pending.len().to_string()),
            );
            self.session = Some(session);
            return Ok(StartOutcome::Paused { pending });
        }

        drain(&self.executor, &mut session).await?;
        Ok(StartOutcome::Completed(session.context))
    }

    pub async fn step(&mut self) -> Result<StepReport, DebugError> {
        let Some(session) = self.session.as_mut() else {
            return Err(DebugError::NotDebugging);
        };

        let (executed, output) = match execute_next(&self.executor, session).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                self.session = None;
                return Err(DebugError::NotDebugging);
            }
            Err(error) => {
                publish(
                    &self.telemetry,
                    debug_event(
                        &session.context.run_id,
                        "debug.block_failed",
                        NotificationLevel::Error,
                        error.to_string(),
                    ),
                );
                self.session = None;
                return Err(error);
            }
        };
        publish(
            &self.telemetry,
            debug_event(
                &session.context.run_id,
                "debug.step_completed",
                NotificationLevel::Progress,
                format!("Executed block {executed}"),
            )
            .with_metadata("block_id", executed.to_string())
            .with_metadata("pending", session.pending.len().to_string()),
        );

        // A mode change requested during the step is honored only now.
        if !self.mode.is_enabled() && !session.pending.is_empty() {
            info!(
                event_name = "core.debug.mode_disabled",
                correlation_id = %session.context.run_id,
                remaining = session.pending.len(),
                "debug mode disabled mid-session, draining remaining blocks"
            );
            publish(
                &self.telemetry,
                debug_event(
                    &session.context.run_id,
                    "debug.mode_disabled",
                    NotificationLevel::Info,
                    "Debug mode disabled, running the remaining blocks",
                ),
            );
            if let Err(error) = drain(&self.executor, session).await {
                self.session = None;
                return Err(error);
            }
        }

        let pending: Vec<BlockId> = session.pending.iter().cloned().collect();
        let completed = if pending.is_empty() {
            self.session.take().map(|session| session.context)
        } else {
            None
        };

        Ok(StepReport { executed, output, pending, completed })
    }

    pub async fn resume(&mut self) -> Result<BlockContext, DebugError> {
        let Some(mut session) = self.session.take() else {
            return Err(DebugError::NotDebugging);
        };

        info!(
            event_name = "core.debug.resumed",
            correlation_id = %session.context.run_id,
            remaining = session.pending.len(),
            "resuming debug session"
        );
        publish(
            &self.telemetry,
            debug_event(
                &session.context.run_id,
                "debug.resumed",
                NotificationLevel::Info,
                format!("Resumed with {} blocks pending", session.pending.len()),
            ),
        );
        drain(&self.executor, &mut session).await?;
        Ok(session.context)
    }

    /// Discards every pending block; returns what was discarded.
    pub fn cancel(&mut self) -> Vec<BlockId> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };

        let discarded: Vec<BlockId> = session.pending.into_iter().collect();
        info!(
            event_name = "core.debug.cancelled",
            correlation_id = %session.context.run_id,
            discarded = discarded.len(),
            "debug session cancelled"
        );
        publish(
            &self.telemetry,
            debug_event(
                &session.context.run_id,
                "debug.cancelled",
                NotificationLevel::Info,
                format!("Cancelled with {} blocks discarded", discarded.len()),
            )
            .with_metadata("discarded", discarded.len().to_string()),
        );
        discarded
    }
}

fn debug_event(
    run_id: &str,
    event_type: &str,
    level: NotificationLevel,
    message: impl Into<String>,
) -> EngineEvent {
    EngineEvent::new(run_id, event_type, EventCategory::Debug, level, message)
}

fn publish(telemetry: &Option<Arc<dyn TelemetrySink>>, event: EngineEvent) {
    if let Some(telemetry) = telemetry {
        telemetry.emit(event);
    }
}

async fn execute_next<E>(
    executor: &E,
    session: &mut Session,
) -> Result<Option<(BlockId, BlockOutput)>, DebugError>
where
    E: BlockExecutor,
{
    let (block_id, block) = loop {
        let Some(block_id) = session.pending.first().cloned() else {
            return Ok(None);
        };
        match session.plan.block(&block_id) {
            Some(block) => break (block_id, block.clone()),
            None => {
                session.pending.shift_remove(&block_id);
            }
        }
    };

    debug!(
        event_name = "core.debug.block_started",
        correlation_id = %session.context.run_id,
        block_id = %block_id,
        "executing block"
    );
    let output = executor.execute(&block, &session.context).await.map_err(|source| {
        DebugError::BlockFailed { block_id: block_id.clone(), source: Box::new(source) }
    })?;

    session.pending.shift_remove(&block_id);
    session.context.outputs.insert(block_id.clone(), output.clone());
    session.recompute_pending(&output.pruned);

    debug!(
        event_name = "core.debug.block_completed",
        correlation_id = %session.context.run_id,
        block_id = %block_id,
        pending = session.pending.len(),
        "block executed"
    );
    Ok(Some((block_id, output)))
}

async fn drain<E>(executor: &E, session: &mut Session) -> Result<(), DebugError>
where
    E: BlockExecutor,
{
    while execute_next(executor, session).await?.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::{
        BlockContext, BlockExecutor, BlockOutput, DebugController, DebugMode, DebugState,
        StartOutcome,
    };
    use crate::config::AppConfig;
    use crate::debug::plan::{Block, BlockId, BlockPlan};
    use crate::errors::{DebugError, RunError};
    use crate::telemetry::{EventCategory, InMemoryTelemetrySink, NotificationLevel};

    #[derive(Clone, Default)]
    struct RecordingExecutor {
        executed: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        route_away_from: Option<(&'static str, &'static str)>,
        disable_mode_on: Option<(&'static str, DebugMode)>,
    }

    impl RecordingExecutor {
        fn executed(&self) -> Vec<String> {
            match self.executed.lock() {
                Ok(executed) => executed.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    #[async_trait]
    impl BlockExecutor for RecordingExecutor {
        async fn execute(
            &self,
            block: &Block,
            _context: &BlockContext,
        ) -> Result<BlockOutput, RunError> {
            if self.fail_on == Some(block.id.0.as_str()) {
                return Err(RunError::Other(format!("{} exploded", block.id)));
            }
            if let Ok(mut executed) = self.executed.lock() {
                executed.push(block.id.0.clone());
            }
            if let Some((trigger, mode)) = &self.disable_mode_on {
                if *trigger == block.id.0 {
                    mode.set_enabled(false);
                }
            }

            let output = BlockOutput::new(json!({ "block": block.id.0 }));
            Ok(match self.route_away_from {
                Some((router, skipped)) if router == block.id.0 => output.pruning(skipped),
                _ => output,
            })
        }
    }

    fn linear_plan() -> BlockPlan {
        BlockPlan::new(vec![Block::new("A", "A"), Block::new("B", "B"), Block::new("C", "C")])
            .expect("valid plan")
    }

    fn ids(values: &[&str]) -> Vec<BlockId> {
        values.iter().map(|value| BlockId::from(*value)).collect()
    }

    #[tokio::test]
    async fn start_in_debug_mode_pauses_with_full_pending_set() {
        let executor = RecordingExecutor::default();
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));

        let outcome = controller.start(linear_plan()).await.expect("start");

        assert_eq!(outcome, StartOutcome::Paused { pending: ids(&["A", "B", "C"]) });
        assert_eq!(controller.state(), DebugState::Debugging);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn step_executes_exactly_one_block() {
        let executor = RecordingExecutor::default();
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));
        controller.start(linear_plan()).await.expect("start");

        let report = controller.step().await.expect("step");

        assert_eq!(report.executed, BlockId::from("A"));
        assert_eq!(report.pending, ids(&["B", "C"]));
        assert!(report.completed.is_none());
        assert_eq!(controller.pending_blocks().len(), 2);
        assert!(!controller.pending_blocks().contains(&BlockId::from("A")));
        assert_eq!(executor.executed(), vec!["A"]);
    }

    #[tokio::test]
    async fn resume_drains_pending_and_returns_to_idle() {
        let executor = RecordingExecutor::default();
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));
        controller.start(linear_plan()).await.expect("start");
        controller.step().await.expect("step");

        let context = controller.resume().await.expect("resume");

        assert_eq!(controller.state(), DebugState::Idle);
        assert!(controller.pending_blocks().is_empty());
        assert_eq!(executor.executed(), vec!["A", "B", "C"]);
        assert_eq!(context.executed().count(), 3);
    }

    #[tokio::test]
    async fn cancel_discards_pending_without_executing() {
        let executor = RecordingExecutor::default();
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));
        controller.start(linear_plan()).await.expect("start");

        let discarded = controller.cancel();

        assert_eq!(discarded, ids(&["A", "B", "C"]));
        assert_eq!(controller.state(), DebugState::Idle);
        assert!(executor.executed().is_empty());
        assert!(matches!(controller.step().await, Err(DebugError::NotDebugging)));
    }

    #[tokio::test]
    async fn last_step_completes_the_session() {
        let mut controller =
            DebugController::new(RecordingExecutor::default(), DebugMode::new(true));
        controller
            .start(BlockPlan::new(vec![Block::new("only", "Only")]).expect("plan"))
            .await
            .expect("start");

        let report = controller.step().await.expect("step");

        assert!(report.pending.is_empty());
        assert!(report.completed.is_some());
        assert_eq!(controller.state(), DebugState::Idle);
    }

    #[tokio::test]
    async fn pruned_branch_is_removed_on_recompute() {
        let executor = RecordingExecutor {
            route_away_from: Some(("router", "left")),
            ..RecordingExecutor::default()
        };
        let plan = BlockPlan::new(vec![
            Block::new("router", "Router"),
            Block::new("left", "Left").after("router"),
            Block::new("left-report", "Left report").after("left"),
            Block::new("right", "Right").after("router"),
        ])
        .expect("plan");
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));
        controller.start(plan).await.expect("start");

        let report = controller.step().await.expect("step");

        assert_eq!(report.pending, ids(&["right"]));
        controller.resume().await.expect("resume");
        assert_eq!(executor.executed(), vec!["router", "right"]);
    }

    #[tokio::test]
    async fn disabling_mode_mid_step_drains_after_the_step() {
        let mode = DebugMode::new(true);
        let executor = RecordingExecutor {
            disable_mode_on: Some(("A", mode.clone())),
            ..RecordingExecutor::default()
        };
        let mut controller = DebugController::new(executor.clone(), mode);
        controller.start(linear_plan()).await.expect("start");

        let report = controller.step().await.expect("step");

        assert_eq!(report.executed, BlockId::from("A"));
        assert!(report.pending.is_empty());
        assert!(report.completed.is_some());
        assert_eq!(controller.state(), DebugState::Idle);
        assert_eq!(executor.executed(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn disabling_mode_while_idle_is_a_no_op() {
        let mode = DebugMode::new(true);
        let mut controller = DebugController::new(RecordingExecutor::default(), mode.clone());

        mode.set_enabled(false);

        assert_eq!(controller.state(), DebugState::Idle);
        assert!(controller.cancel().is_empty());
        assert!(matches!(controller.resume().await, Err(DebugError::NotDebugging)));
    }

    #[tokio::test]
    async fn non_debug_start_runs_every_block() {
        let executor = RecordingExecutor::default();
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(false));

        let outcome = controller.start(linear_plan()).await.expect("start");

        assert!(matches!(outcome, StartOutcome::Completed(ref context) if context.outputs.len() == 3));
        assert_eq!(controller.state(), DebugState::Idle);
        assert_eq!(executor.executed(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn block_failure_ends_the_session() {
        let executor = RecordingExecutor { fail_on: Some("B"), ..RecordingExecutor::default() };
        let mut controller = DebugController::new(executor.clone(), DebugMode::new(true));
        controller.start(linear_plan()).await.expect("start");
        controller.step().await.expect("first step");

        let error = controller.step().await.expect_err("B fails");

        assert!(matches!(error, DebugError::BlockFailed { ref block_id, .. } if block_id == &BlockId::from("B")));
        assert_eq!(controller.state(), DebugState::Idle);
        assert_eq!(executor.executed(), vec!["A"]);
    }

    #[tokio::test]
    async fn session_transitions_are_published_as_debug_events() {
        let telemetry = InMemoryTelemetrySink::default();
        let mut controller =
            DebugController::new(RecordingExecutor::default(), DebugMode::new(true))
                .with_telemetry(Arc::new(telemetry.clone()));

        controller.start(linear_plan()).await.expect("start");
        controller.step().await.expect("step");
        controller.cancel();

        let types: Vec<String> =
            telemetry.events().into_iter().map(|event| event.event_type).collect();
        assert_eq!(types, vec!["debug.session_started", "debug.step_completed", "debug.cancelled"]);
        let events = telemetry.events();
        assert!(events.iter().all(|event| event.category == EventCategory::Debug));
        assert_eq!(events[1].metadata.get("block_id").map(String::as_str), Some("A"));
        assert_eq!(events[1].level, NotificationLevel::Progress);
        assert_eq!(events[2].metadata.get("discarded").map(String::as_str), Some("2"));
    }

    #[test]
    fn mode_is_seeded_from_engine_config() {
        let mut engine = AppConfig::default().engine;
        assert!(!DebugMode::from_config(&engine).is_enabled());

        engine.debug_mode = true;
        assert!(DebugMode::from_config(&engine).is_enabled());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut controller =
            DebugController::new(RecordingExecutor::default(), DebugMode::new(true));
        controller.start(linear_plan()).await.expect("start");

        let second = controller.start(linear_plan()).await;

        assert!(matches!(second, Err(DebugError::AlreadyDebugging)));
        assert_eq!(controller.pending_blocks().len(), 3);
    }
}
