//! Sync run orchestration.
//!
//! One run: take the entity-set lock, load bookmarks, launch the extract
//! pipeline, cut its record stream into per-entity batches, then validate
//! and commit each batch on a bounded set of workers. Bookmarks advance only
//! after the batch that reached them committed. Every run ends with exactly
//! one terminal alert.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use wmsync_state::{BookmarkStore, RunLedger};
use wmsync_types::alert::Alert;
use wmsync_types::record::{Batch, Record};
use wmsync_types::run::{FailureKind, SyncRun, SyncStatus};
use wmsync_types::state::{Bookmark, CorrelationId, CursorValue, EntityName, RunId, RunStats};
use wmsync_types::validation::{IssueSeverity, RejectedRecord, ValidationResult};
use wmsync_types::wire::{PipelineMessage, SyncMode};

use crate::alert::AlertDispatcher;
use crate::checkpoint::{advance_bookmark, initial_filter, ordering_descending};
use crate::config::validator::validate_config;
use crate::config::{ModeConfig, SyncConfig};
use crate::error::{
    ConfigurationError, ConnectionError, OrchestratorError, PipelineExecutionError, PoolError,
};
use crate::lock::RunLockRegistry;
use crate::pipeline::{EntityRequest, PipelineLauncher, PipelineRequest, PipelineStream};
use crate::pool::ConnectionPool;
use crate::validator::{key_text, ChainedLookup, CommittedKeyIndex, DataValidator, ReferenceLookup};

/// Batches buffered per entity between the stream reader and its worker.
const WORKER_QUEUE_DEPTH: usize = 4;

/// Drives sync runs against one target database.
///
/// Cheap to share behind an `Arc`; concurrent runs over disjoint entity sets
/// are allowed, overlapping ones are refused with
/// [`OrchestratorError::AlreadyRunning`].
pub struct SyncOrchestrator {
    validator: Arc<DataValidator>,
    pool: ConnectionPool,
    alerts: Arc<AlertDispatcher>,
    bookmarks: Arc<dyn BookmarkStore>,
    launcher: Arc<dyn PipelineLauncher>,
    ledger: Option<Arc<dyn RunLedger>>,
    locks: Arc<RunLockRegistry>,
    references: Option<Arc<dyn ReferenceLookup>>,
    committed: Arc<CommittedKeyIndex>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(
        validator: Arc<DataValidator>,
        pool: ConnectionPool,
        alerts: Arc<AlertDispatcher>,
        bookmarks: Arc<dyn BookmarkStore>,
        launcher: Arc<dyn PipelineLauncher>,
    ) -> Self {
        Self {
            validator,
            pool,
            alerts,
            bookmarks,
            launcher,
            ledger: None,
            locks: RunLockRegistry::new(),
            references: None,
            committed: Arc::new(CommittedKeyIndex::default()),
        }
    }

    /// Record run history and rejected records in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Share run locks with other orchestrators in this process.
    #[must_use]
    pub fn with_lock_registry(mut self, locks: Arc<RunLockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Answer referential checks from `lookup` in addition to the keys this
    /// orchestrator has committed itself.
    #[must_use]
    pub fn with_reference_lookup(mut self, lookup: Arc<dyn ReferenceLookup>) -> Self {
        self.references = Some(lookup);
        self
    }

    #[must_use]
    pub fn alerts(&self) -> &Arc<AlertDispatcher> {
        &self.alerts
    }

    #[must_use]
    pub fn committed_keys(&self) -> &Arc<CommittedKeyIndex> {
        &self.committed
    }

    #[must_use]
    pub fn lock_registry(&self) -> &Arc<RunLockRegistry> {
        &self.locks
    }

    /// Run one sync of `entities` in `mode`.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Configuration`] before anything starts
    /// - [`OrchestratorError::AlreadyRunning`] when an overlapping run holds the lock
    /// - [`OrchestratorError::RunFailed`] carrying the failed run
    pub async fn run(
        &self,
        mode: SyncMode,
        entities: &[EntityName],
        config: &SyncConfig,
    ) -> Result<SyncRun, OrchestratorError> {
        self.run_with_cancel(mode, entities, config, CancellationToken::new())
            .await
    }

    /// [`run`](Self::run), stopping early once `cancel` fires. A cancelled
    /// run fails with [`FailureKind::Cancelled`].
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_with_cancel(
        &self,
        mode: SyncMode,
        entities: &[EntityName],
        config: &SyncConfig,
        cancel: CancellationToken,
    ) -> Result<SyncRun, OrchestratorError> {
        if entities.is_empty() {
            return Err(ConfigurationError::single("a sync run needs at least one entity").into());
        }
        validate_config(config)?;

        let entity_set: BTreeSet<EntityName> = entities.iter().cloned().collect();
        let lock = self.locks.acquire(&entity_set)?;

        let run = SyncRun::new(mode, entity_set);
        tracing::info!(
            run_id = %run.run_id,
            correlation_id = %run.correlation_id,
            mode = %mode,
            entities = %run.entity_set_key(),
            "Starting sync run"
        );
        self.ledger_start(&run).await;

        let ctx = Arc::new(RunContext::new(self, run, config, mode, cancel.child_token()));
        let watchdog = spawn_watchdog(
            Arc::clone(&ctx),
            config.mode(mode).total_timeout(),
            cancel,
        );
        self.execute(&ctx).await;
        watchdog.abort();

        let run = ctx.finish();
        self.report(&run);
        self.ledger_complete(&run).await;
        drop(lock);

        if run.status == SyncStatus::Failed {
            Err(OrchestratorError::RunFailed { run: Box::new(run) })
        } else {
            Ok(run)
        }
    }

    async fn execute(&self, ctx: &Arc<RunContext>) {
        let loaded = match self.load_bookmarks(&ctx.entities).await {
            Ok(loaded) => loaded,
            Err(message) => {
                ctx.fail(FailureKind::Bookmark, message);
                return;
            }
        };
        ctx.with_run(|run| run.bookmarks.clone_from(&loaded));

        if !self.check_reference_targets(ctx).await {
            return;
        }

        let request = build_request(ctx, &loaded);
        if !ctx.with_run(|run| run.transition(SyncStatus::Running)) {
            return;
        }

        let pipeline_cancel = ctx.run_cancel.child_token();
        let launched = tokio::select! {
            () = ctx.run_cancel.cancelled() => return,
            launched = self.launcher.launch(&request, pipeline_cancel.clone()) => launched,
        };
        let stream = match launched {
            Ok(stream) => stream,
            Err(e) => {
                ctx.fail(FailureKind::Pipeline, e.to_string());
                return;
            }
        };

        let mut workers = JoinSet::new();
        let mut senders = HashMap::with_capacity(ctx.entities.len());
        for entity in &ctx.entities {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            senders.insert(entity.clone(), tx);
            workers.spawn(entity_worker(Arc::clone(ctx), entity.clone(), rx));
        }

        read_stream(ctx, stream, senders).await;
        pipeline_cancel.cancel();

        while let Some(joined) = workers.join_next().await {
            if let Err(join_err) = joined {
                if !join_err.is_cancelled() {
                    ctx.fail(
                        FailureKind::Internal,
                        format!("entity worker panicked: {join_err}"),
                    );
                }
            }
        }
    }

    async fn load_bookmarks(
        &self,
        entities: &BTreeSet<EntityName>,
    ) -> Result<BTreeMap<EntityName, Bookmark>, String> {
        let store = Arc::clone(&self.bookmarks);
        let entities: Vec<EntityName> = entities.iter().cloned().collect();
        tokio::task::spawn_blocking(move || -> Result<BTreeMap<EntityName, Bookmark>, String> {
            let mut loaded = BTreeMap::new();
            for entity in entities {
                let bookmark = store
                    .get_bookmark(&entity)
                    .map_err(|e| format!("failed to load bookmark for {entity}: {e}"))?;
                if let Some(bookmark) = bookmark {
                    loaded.insert(entity, bookmark);
                }
            }
            Ok(loaded)
        })
        .await
        .map_err(|e| format!("bookmark load task panicked: {e}"))?
    }

    /// Warn about reference targets that are neither synced in this run nor
    /// checkable through the lookup, and that have no table in the target.
    /// Returns `false` if the run has already failed.
    async fn check_reference_targets(&self, ctx: &RunContext) -> bool {
        let candidates: Vec<EntityName> = ctx
            .referenced
            .iter()
            .filter(|target| !ctx.entities.contains(*target))
            .cloned()
            .collect();
        let lookup = Arc::clone(&ctx.lookup);
        let unresolved = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .filter(|target| !lookup.entity_exists(target))
                .collect::<Vec<_>>()
        })
        .await;
        let unresolved = match unresolved {
            Ok(unresolved) => unresolved,
            Err(e) => {
                ctx.fail(FailureKind::Internal, format!("reference preflight panicked: {e}"));
                return false;
            }
        };
        if unresolved.is_empty() {
            return true;
        }

        let mut lease = match self
            .pool
            .lease_for(
                ctx.lease_timeout,
                "reference-preflight",
                Some(&ctx.correlation_id),
                &ctx.run_cancel,
            )
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::Cancelled) => return false,
            Err(e) => {
                ctx.fail(
                    FailureKind::Connection,
                    format!("reference preflight: {e}"),
                );
                return false;
            }
        };

        for target in unresolved {
            match lease.table_exists(&target).await {
                Ok(true) => tracing::debug!(
                    entity = %target,
                    "Reference target exists but has no checkable keys"
                ),
                Ok(false) => {
                    tracing::warn!(entity = %target, "Reference target missing in target database");
                    ctx.alerts.emit(
                        Alert::warning(
                            "reference_target_missing",
                            "Reference target missing",
                            format!(
                                "{target} has no table in the target database; references to it are not checked"
                            ),
                        )
                        .with_context("entity", target.as_str())
                        .with_correlation(Some(ctx.correlation_id.clone())),
                    );
                }
                Err(e) => {
                    lease.report_failure(&e);
                    tracing::warn!(entity = %target, error = %e, "Reference preflight check failed");
                    break;
                }
            }
        }
        true
    }

    fn report(&self, run: &SyncRun) {
        let elapsed_secs = run.duration().to_std().map_or(0.0, |d| d.as_secs_f64());
        let alert = match &run.failure {
            Some(failure) => {
                let bookmarks: serde_json::Map<String, serde_json::Value> = run
                    .bookmarks
                    .iter()
                    .map(|(entity, bookmark)| {
                        (
                            entity.to_string(),
                            serde_json::to_value(&bookmark.replication_key_value)
                                .unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect();
                tracing::error!(
                    run_id = %run.run_id,
                    failure_kind = %failure.kind,
                    elapsed_secs,
                    records_processed = run.records_processed,
                    records_rejected = run.records_rejected,
                    "Sync run failed: {}",
                    failure.message
                );
                Alert::critical(
                    "sync_failed",
                    "Sync run failed",
                    format!(
                        "{} sync of [{}] failed: {}",
                        run.mode,
                        run.entity_set_key(),
                        failure.message
                    ),
                )
                .with_context("failure_kind", failure.kind.as_str())
                .with_context("elapsed_secs", elapsed_secs)
                .with_context("rejection_ratio", run.rejection_ratio())
                .with_context("records_processed", run.records_processed)
                .with_context("records_rejected", run.records_rejected)
                .with_context("last_bookmarks", serde_json::Value::Object(bookmarks))
            }
            None => {
                tracing::info!(
                    run_id = %run.run_id,
                    elapsed_secs,
                    records_processed = run.records_processed,
                    records_rejected = run.records_rejected,
                    batches_committed = run.batches_committed,
                    "Sync run completed"
                );
                Alert::info(
                    "sync_completed",
                    "Sync run completed",
                    format!(
                        "{} sync of [{}] processed {} records ({} rejected) in {elapsed_secs:.1}s",
                        run.mode,
                        run.entity_set_key(),
                        run.records_processed,
                        run.records_rejected
                    ),
                )
                .with_context("records_processed", run.records_processed)
                .with_context("records_rejected", run.records_rejected)
                .with_context("batches_committed", run.batches_committed)
                .with_context("elapsed_secs", elapsed_secs)
            }
        };
        self.alerts.emit(
            alert
                .with_context("run_id", run.run_id.to_string())
                .with_context("entities", run.entity_set_key())
                .with_correlation(Some(run.correlation_id.clone())),
        );
    }

    async fn ledger_start(&self, run: &SyncRun) {
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let run_id = run.run_id;
        let mode = run.mode;
        let entities: Vec<EntityName> = run.entities.iter().cloned().collect();
        match tokio::task::spawn_blocking(move || ledger.start_run(run_id, mode, &entities)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id = %run_id, error = %e, "Failed to record run start"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Run start task panicked"),
        }
    }

    async fn ledger_complete(&self, run: &SyncRun) {
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let run_id = run.run_id;
        let status = run.status;
        let stats = RunStats {
            records_processed: run.records_processed,
            records_rejected: run.records_rejected,
            batches_committed: run.batches_committed,
            error_message: run.failure.as_ref().map(|f| f.message.clone()),
        };
        match tokio::task::spawn_blocking(move || ledger.complete_run(run_id, status, &stats)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id = %run_id, error = %e, "Failed to record run completion"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Run completion task panicked"),
        }
    }
}

fn build_request(ctx: &RunContext, bookmarks: &BTreeMap<EntityName, Bookmark>) -> PipelineRequest {
    let now = Utc::now();
    PipelineRequest {
        run_id: ctx.run_id,
        mode: ctx.mode,
        ordering_key: ctx.mode_config.ordering_key.clone(),
        descending: ordering_descending(ctx.mode),
        page_size: ctx.mode_config.page_size,
        entities: ctx
            .entities
            .iter()
            .map(|entity| EntityRequest {
                entity: entity.clone(),
                filter: initial_filter(ctx.mode, &ctx.mode_config, bookmarks.get(entity), now),
            })
            .collect(),
    }
}

fn spawn_watchdog(
    ctx: Arc<RunContext>,
    total_timeout: Duration,
    external: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = external.cancelled() => {
                ctx.fail(FailureKind::Cancelled, "run cancelled by caller");
            }
            () = ctx.run_cancel.cancelled() => {}
            () = tokio::time::sleep(total_timeout) => {
                ctx.fail(
                    FailureKind::TotalTimeout,
                    format!("run exceeded its total timeout of {}s", total_timeout.as_secs()),
                );
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Per-run shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validating,
    Committing,
}

struct RunState {
    run: SyncRun,
    validating: usize,
    committing: usize,
}

struct RunContext {
    run_id: RunId,
    correlation_id: CorrelationId,
    mode: SyncMode,
    mode_config: ModeConfig,
    entities: BTreeSet<EntityName>,
    lease_timeout: Duration,
    commit_timeout: Duration,
    validator: Arc<DataValidator>,
    pool: ConnectionPool,
    alerts: Arc<AlertDispatcher>,
    bookmarks: Arc<dyn BookmarkStore>,
    ledger: Option<Arc<dyn RunLedger>>,
    committed: Arc<CommittedKeyIndex>,
    /// Entities whose committed keys are kept for reference checks.
    referenced: BTreeSet<EntityName>,
    lookup: Arc<dyn ReferenceLookup>,
    permits: Semaphore,
    run_cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl RunContext {
    fn new(
        orchestrator: &SyncOrchestrator,
        run: SyncRun,
        config: &SyncConfig,
        mode: SyncMode,
        run_cancel: CancellationToken,
    ) -> Self {
        let committed = Arc::clone(&orchestrator.committed);
        let lookup: Arc<dyn ReferenceLookup> = match &orchestrator.references {
            Some(external) => Arc::new(ChainedLookup::new(
                Arc::clone(&committed) as Arc<dyn ReferenceLookup>,
                Arc::clone(external),
            )),
            None => Arc::clone(&committed) as Arc<dyn ReferenceLookup>,
        };
        Self {
            run_id: run.run_id,
            correlation_id: run.correlation_id.clone(),
            mode,
            mode_config: config.mode(mode).clone(),
            entities: run.entities.clone(),
            lease_timeout: config.pool.lease_timeout(),
            commit_timeout: config.target.commit_timeout(),
            validator: Arc::clone(&orchestrator.validator),
            pool: orchestrator.pool.clone(),
            alerts: Arc::clone(&orchestrator.alerts),
            bookmarks: Arc::clone(&orchestrator.bookmarks),
            ledger: orchestrator.ledger.clone(),
            committed,
            referenced: orchestrator.validator.referenced_entities(),
            lookup,
            permits: Semaphore::new(config.parallel_threads.max(1)),
            run_cancel,
            state: Mutex::new(RunState {
                run,
                validating: 0,
                committing: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut SyncRun) -> T) -> T {
        f(&mut self.state().run)
    }

    /// Record the first failure cause and stop all run work.
    fn fail(&self, kind: FailureKind, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = self.state();
            if state.run.failure.is_none() {
                tracing::error!(
                    run_id = %self.run_id,
                    failure_kind = %kind,
                    "{message}"
                );
            }
            state.run.fail(kind, message);
        }
        self.run_cancel.cancel();
    }

    /// Move one worker between phases and recompute the aggregate status:
    /// any batch committing wins, then any validating, else running.
    fn shift_phase(&self, leave: Option<Phase>, enter: Option<Phase>) {
        let mut state = self.state();
        match leave {
            Some(Phase::Validating) => state.validating = state.validating.saturating_sub(1),
            Some(Phase::Committing) => state.committing = state.committing.saturating_sub(1),
            None => {}
        }
        match enter {
            Some(Phase::Validating) => state.validating += 1,
            Some(Phase::Committing) => state.committing += 1,
            None => {}
        }
        if state.run.status.is_terminal() {
            return;
        }
        let target = if state.committing > 0 {
            SyncStatus::Committing
        } else if state.validating > 0 {
            SyncStatus::Validating
        } else {
            SyncStatus::Running
        };
        let from = state.run.status;
        if !state.run.transition(target) {
            tracing::warn!(from = %from, to = %target, "Ignoring illegal run status transition");
        }
    }

    fn record_validation(&self, result: &ValidationResult) {
        let mut state = self.state();
        state.run.records_processed += result.total_records() as u64;
        state.run.records_rejected += result.rejected_records as u64;
    }

    fn finish(&self) -> SyncRun {
        let mut state = self.state();
        if state.run.failure.is_none() && self.run_cancel.is_cancelled() {
            state
                .run
                .fail(FailureKind::Cancelled, "run cancelled before completion");
        }
        if state.run.failure.is_none() && !state.run.transition(SyncStatus::Completed) {
            let status = state.run.status;
            state.run.fail(
                FailureKind::Internal,
                format!("run ended in non-terminal status {status}"),
            );
        }
        state.run.clone()
    }

    async fn persist_rejected(&self, records: Vec<RejectedRecord>) {
        for record in &records {
            self.alerts.emit(
                Alert::warning(
                    "record_rejected",
                    "Record rejected",
                    format!("{} record rejected by {}: {}", record.entity, record.rule_name, record.message),
                )
                .with_context("entity", record.entity.as_str())
                .with_context("rule", record.rule_name.as_str())
                .with_correlation(Some(self.correlation_id.clone())),
            );
        }

        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let run_id = self.run_id;
        let count = records.len();
        match tokio::task::spawn_blocking(move || ledger.insert_rejected_records(run_id, &records))
            .await
        {
            Ok(Ok(inserted)) => tracing::info!(run_id = %run_id, inserted, "Persisted rejected records"),
            Ok(Err(e)) => tracing::error!(
                run_id = %run_id,
                count,
                error = %e,
                "Failed to persist rejected records"
            ),
            Err(e) => tracing::error!(run_id = %run_id, count, error = %e, "Rejected record task panicked"),
        }
    }
}

/// Holds one worker's contribution to the aggregate run status.
struct PhaseGuard<'a> {
    ctx: &'a RunContext,
    phase: Phase,
}

impl<'a> PhaseGuard<'a> {
    fn enter(ctx: &'a RunContext, phase: Phase) -> Self {
        ctx.shift_phase(None, Some(phase));
        Self { ctx, phase }
    }

    fn switch(&mut self, next: Phase) {
        self.ctx.shift_phase(Some(self.phase), Some(next));
        self.phase = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.ctx.shift_phase(Some(self.phase), None);
    }
}

// ---------------------------------------------------------------------------
// Stream reading and batching
// ---------------------------------------------------------------------------

/// Cuts the record stream into per-entity batches.
struct Batcher {
    batch_size: usize,
    ordering_key: String,
    pending: BTreeMap<EntityName, Vec<Record>>,
    sequence: HashMap<EntityName, u64>,
}

impl Batcher {
    fn new(batch_size: usize, ordering_key: String) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ordering_key,
            pending: BTreeMap::new(),
            sequence: HashMap::new(),
        }
    }

    /// Buffer `record`; returns a full batch once `batch_size` is reached.
    /// A size-cut batch checkpoints at its last record's ordering key.
    fn push(&mut self, entity: EntityName, record: Record) -> Option<Batch> {
        let pending = self.pending.entry(entity.clone()).or_default();
        pending.push(record);
        if pending.len() < self.batch_size {
            return None;
        }
        let checkpoint = pending
            .last()
            .and_then(|r| r.get(&self.ordering_key))
            .and_then(CursorValue::from_json);
        self.close(&entity, checkpoint)
    }

    fn close(&mut self, entity: &EntityName, checkpoint: Option<CursorValue>) -> Option<Batch> {
        let records = self.pending.remove(entity).filter(|r| !r.is_empty())?;
        let sequence_no = self.sequence.entry(entity.clone()).or_insert(0);
        *sequence_no += 1;
        Some(Batch {
            entity: entity.clone(),
            sequence_no: *sequence_no,
            records,
            source_checkpoint: checkpoint,
        })
    }

    fn drain(&mut self) -> Vec<Batch> {
        let entities: Vec<EntityName> = self.pending.keys().cloned().collect();
        entities
            .iter()
            .filter_map(|entity| self.close(entity, None))
            .collect()
    }
}

async fn read_stream(
    ctx: &RunContext,
    mut stream: PipelineStream,
    senders: HashMap<EntityName, mpsc::Sender<Batch>>,
) {
    let mut batcher = Batcher::new(
        ctx.mode_config.batch_size,
        ctx.mode_config.ordering_key.clone(),
    );
    let request_timeout = ctx.mode_config.request_timeout();
    let mut saw_state = false;

    loop {
        let next = tokio::select! {
            () = ctx.run_cancel.cancelled() => return,
            next = tokio::time::timeout(request_timeout, stream.next_message()) => next,
        };
        let message = match next {
            Err(_) => {
                ctx.fail(
                    FailureKind::RequestTimeout,
                    format!(
                        "no message from the extractor within {}ms",
                        request_timeout.as_millis()
                    ),
                );
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                ctx.fail(FailureKind::Pipeline, e.to_string());
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            PipelineMessage::Schema {
                stream: entity,
                schema,
                key_properties,
            } => {
                if !ensure_in_run(ctx, &entity) {
                    return;
                }
                if ctx.validator.register_derived_schema(&entity, &schema, &key_properties) {
                    tracing::debug!(entity = %entity, "Registered schema from extractor");
                }
            }
            PipelineMessage::Record {
                stream: entity,
                record,
            } => {
                if !ensure_in_run(ctx, &entity) {
                    return;
                }
                if let Some(batch) = batcher.push(entity, record) {
                    if !dispatch(ctx, &senders, batch).await {
                        return;
                    }
                }
            }
            PipelineMessage::State { value } => {
                saw_state = true;
                for (entity, bookmark) in value.bookmarks {
                    if !ctx.entities.contains(&entity) {
                        tracing::debug!(entity = %entity, "Ignoring state for entity outside the run");
                        continue;
                    }
                    let checkpoint = Some(bookmark.replication_key_value);
                    if let Some(batch) = batcher.close(&entity, checkpoint) {
                        if !dispatch(ctx, &senders, batch).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    if !saw_state {
        ctx.fail(
            FailureKind::Pipeline,
            PipelineExecutionError::MissingState.to_string(),
        );
        return;
    }
    for batch in batcher.drain() {
        if !dispatch(ctx, &senders, batch).await {
            return;
        }
    }
}

fn ensure_in_run(ctx: &RunContext, entity: &EntityName) -> bool {
    if ctx.entities.contains(entity) {
        return true;
    }
    ctx.fail(
        FailureKind::Pipeline,
        PipelineExecutionError::Protocol(format!("message for entity {entity} outside the run"))
            .to_string(),
    );
    false
}

async fn dispatch(
    ctx: &RunContext,
    senders: &HashMap<EntityName, mpsc::Sender<Batch>>,
    batch: Batch,
) -> bool {
    let Some(tx) = senders.get(&batch.entity) else {
        return false;
    };
    tokio::select! {
        () = ctx.run_cancel.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn entity_worker(ctx: Arc<RunContext>, entity: EntityName, mut batches: mpsc::Receiver<Batch>) {
    loop {
        let batch = tokio::select! {
            () = ctx.run_cancel.cancelled() => return,
            next = batches.recv() => match next {
                Some(batch) => batch,
                None => break,
            },
        };
        let permit = tokio::select! {
            () = ctx.run_cancel.cancelled() => return,
            permit = ctx.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let keep_going = process_batch(&ctx, batch).await;
        drop(permit);
        if !keep_going {
            return;
        }
    }

    if !ctx.run_cancel.is_cancelled() {
        ctx.committed.mark_known(entity.clone());
        tracing::debug!(
            entity = %entity,
            committed_keys = ctx.committed.committed_count(&entity),
            "Entity stream committed"
        );
    }
}

/// Validate and commit one batch. Returns `false` once the run must stop.
#[allow(clippy::too_many_lines)]
async fn process_batch(ctx: &RunContext, batch: Batch) -> bool {
    let batch_ref = batch.reference();
    let entity = batch.entity.clone();
    let mut phase = PhaseGuard::enter(ctx, Phase::Validating);

    let validator = Arc::clone(&ctx.validator);
    let lookup = Arc::clone(&ctx.lookup);
    let validated = tokio::task::spawn_blocking(move || {
        let result = validator.validate(&batch, lookup.as_ref());
        (batch, result)
    })
    .await;
    let (batch, result) = match validated {
        Ok(validated) => validated,
        Err(e) => {
            ctx.fail(
                FailureKind::Internal,
                format!("{batch_ref}: validation task panicked: {e}"),
            );
            return false;
        }
    };

    ctx.record_validation(&result);
    tracing::info!(
        batch = %batch_ref,
        accepted = result.accepted_records,
        rejected = result.rejected_records,
        score = result.overall_score,
        grade = %result.grade,
        "Batch validated"
    );

    let rejected = rejected_records(&batch, &result);
    if !rejected.is_empty() {
        ctx.persist_rejected(rejected).await;
    }

    let ratio = result.rejection_ratio();
    let tolerance = ctx.mode_config.error_tolerance_ratio;
    if ratio > tolerance {
        ctx.fail(
            FailureKind::RejectionThreshold,
            format!(
                "{batch_ref}: {} of {} records rejected ({:.1}%), tolerance {:.1}%",
                result.rejected_records,
                result.total_records(),
                ratio * 100.0,
                tolerance * 100.0
            ),
        );
        return false;
    }
    if result.accepted_records == 0 || ctx.run_cancel.is_cancelled() {
        return !ctx.run_cancel.is_cancelled();
    }

    phase.switch(Phase::Committing);
    let primary_key = ctx.validator.primary_key_for(&entity);
    let checkpoint = batch.source_checkpoint.clone();
    let accepted = accepted_records(batch, &result.accepted_indices);
    let keys: Option<Vec<String>> = ctx.referenced.contains(&entity).then(|| {
        accepted
            .iter()
            .filter_map(|record| record.get(&primary_key).and_then(key_text))
            .collect()
    });

    let owner = batch_ref.to_string();
    let mut lease = match ctx
        .pool
        .lease_for(ctx.lease_timeout, &owner, Some(&ctx.correlation_id), &ctx.run_cancel)
        .await
    {
        Ok(lease) => lease,
        Err(PoolError::Cancelled) => return false,
        Err(e) => {
            ctx.fail(FailureKind::Connection, format!("{batch_ref}: {e}"));
            return false;
        }
    };
    if ctx.run_cancel.is_cancelled() {
        return false;
    }

    // Not raced against cancellation: a started commit runs to its own end.
    let committed = tokio::time::timeout(
        ctx.commit_timeout,
        lease.commit_batch(&entity, &primary_key, accepted),
    )
    .await;
    match committed {
        Ok(Ok(rows)) => tracing::debug!(batch = %batch_ref, rows, "Batch committed"),
        Ok(Err(e)) => {
            lease.report_failure(&e);
            ctx.fail(FailureKind::Commit, format!("{batch_ref}: {e}"));
            return false;
        }
        Err(_) => {
            let e = ConnectionError::Transient(format!(
                "commit timed out after {}ms",
                ctx.commit_timeout.as_millis()
            ));
            lease.report_failure(&e);
            ctx.fail(FailureKind::Commit, format!("{batch_ref}: {e}"));
            return false;
        }
    }
    ctx.pool.release(lease);
    if let Some(keys) = keys {
        ctx.committed.record_committed(&entity, keys);
    }
    ctx.with_run(|run| run.batches_committed += 1);

    let Some(checkpoint) = checkpoint else {
        return true;
    };
    let store = Arc::clone(&ctx.bookmarks);
    let mode = ctx.mode;
    let bookmark_entity = entity.clone();
    let advanced = tokio::task::spawn_blocking(move || {
        advance_bookmark(store.as_ref(), &bookmark_entity, mode, &checkpoint)
    })
    .await;
    match advanced {
        Ok(Ok(Some(bookmark))) => {
            ctx.with_run(|run| {
                run.bookmarks.insert(entity, bookmark);
            });
            true
        }
        Ok(Ok(None)) => true,
        Ok(Err(e)) => {
            ctx.fail(
                FailureKind::Bookmark,
                format!("{batch_ref}: bookmark not advanced: {e}"),
            );
            false
        }
        Err(e) => {
            ctx.fail(
                FailureKind::Bookmark,
                format!("{batch_ref}: bookmark task panicked: {e}"),
            );
            false
        }
    }
}

/// Rejected records of `batch`, each attributed to its first rejecting
/// finding. Records rejected as a whole batch fall back to the batch-level
/// finding.
fn rejected_records(batch: &Batch, result: &ValidationResult) -> Vec<RejectedRecord> {
    let accepted: HashSet<usize> = result.accepted_indices.iter().copied().collect();
    let batch_cause = result
        .errors
        .iter()
        .find(|e| e.record_ref.is_none() && e.severity == IssueSeverity::Reject);
    let now = Utc::now();

    batch
        .records
        .iter()
        .enumerate()
        .filter(|(idx, _)| !accepted.contains(idx))
        .map(|(idx, record)| {
            let cause = result
                .errors
                .iter()
                .find(|e| e.record_ref == Some(idx) && e.severity == IssueSeverity::Reject)
                .or(batch_cause);
            RejectedRecord {
                entity: batch.entity.clone(),
                record_json: serde_json::to_string(record).unwrap_or_default(),
                rule_name: cause.map_or_else(|| "rejected".to_string(), |e| e.rule_name.clone()),
                message: cause.map_or_else(|| "record rejected".to_string(), |e| e.message.clone()),
                rejected_at: now,
            }
        })
        .collect()
}

fn accepted_records(batch: Batch, accepted_indices: &[usize]) -> Vec<Record> {
    let mut keep = vec![false; batch.records.len()];
    for &idx in accepted_indices {
        if let Some(slot) = keep.get_mut(idx) {
            *slot = true;
        }
    }
    batch
        .records
        .into_iter()
        .zip(keep)
        .filter_map(|(record, keep)| keep.then_some(record))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wmsync_types::record::BatchRef;
    use wmsync_types::validation::{Grade, LayerScores, ValidationError};

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn batch(records: Vec<Record>) -> Batch {
        Batch {
            entity: EntityName::from("orders"),
            sequence_no: 1,
            records,
            source_checkpoint: None,
        }
    }

    fn result_for(batch: &Batch, accepted: Vec<usize>, errors: Vec<ValidationError>) -> ValidationResult {
        ValidationResult {
            batch_ref: BatchRef {
                entity: batch.entity.clone(),
                sequence_no: batch.sequence_no,
            },
            layer_scores: LayerScores {
                schema: 1.0,
                business: 1.0,
                quality: 1.0,
                referential: 1.0,
            },
            overall_score: 1.0,
            grade: Grade::A,
            errors,
            accepted_records: accepted.len(),
            rejected_records: batch.len() - accepted.len(),
            accepted_indices: accepted,
        }
    }

    #[test]
    fn batcher_cuts_at_batch_size_with_last_key_checkpoint() {
        let mut batcher = Batcher::new(2, "id".into());
        let orders = EntityName::from("orders");
        assert!(batcher.push(orders.clone(), record(json!({"id": 9}))).is_none());
        let full = batcher.push(orders.clone(), record(json!({"id": 8}))).unwrap();
        assert_eq!(full.sequence_no, 1);
        assert_eq!(full.len(), 2);
        assert_eq!(full.source_checkpoint, Some(CursorValue::Int(8)));

        assert!(batcher.push(orders.clone(), record(json!({"id": 7}))).is_none());
        let closed = batcher
            .close(&orders, Some(CursorValue::Int(5)))
            .unwrap();
        assert_eq!(closed.sequence_no, 2);
        assert_eq!(closed.source_checkpoint, Some(CursorValue::Int(5)));
        assert!(batcher.close(&orders, Some(CursorValue::Int(4))).is_none());
    }

    #[test]
    fn batcher_drain_flushes_without_checkpoint() {
        let mut batcher = Batcher::new(10, "id".into());
        batcher.push("orders".into(), record(json!({"id": 1})));
        batcher.push("stock".into(), record(json!({"id": 2})));
        let drained = batcher.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|b| b.source_checkpoint.is_none()));
        assert!(batcher.drain().is_empty());
    }

    #[test]
    fn rejected_records_use_first_rejecting_finding() {
        let b = batch(vec![
            record(json!({"id": 1})),
            record(json!({"id": 2, "qty": -1})),
        ]);
        let errors = vec![
            ValidationError::record(1, Some("qty"), "qty_warn", "suspicious", IssueSeverity::Warn),
            ValidationError::record(1, Some("qty"), "qty_range", "below 0", IssueSeverity::Reject),
        ];
        let result = result_for(&b, vec![0], errors);
        let rejected = rejected_records(&b, &result);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].rule_name, "qty_range");
        assert!(rejected[0].record_json.contains("\"qty\":-1"));
    }

    #[test]
    fn rejected_records_fall_back_to_batch_finding() {
        let b = batch(vec![record(json!({"id": 1})), record(json!({"id": 1}))]);
        let errors = vec![ValidationError::batch(
            "quality.duplicates",
            "duplicate rate over threshold",
            IssueSeverity::Reject,
        )];
        let result = result_for(&b, vec![], errors);
        let rejected = rejected_records(&b, &result);
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|r| r.rule_name == "quality.duplicates"));
    }

    #[test]
    fn accepted_records_keep_order() {
        let b = batch(vec![
            record(json!({"id": 1})),
            record(json!({"id": 2})),
            record(json!({"id": 3})),
        ]);
        let kept = accepted_records(b, &[0, 2, 7]);
        let ids: Vec<_> = kept.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3)]);
    }
}
