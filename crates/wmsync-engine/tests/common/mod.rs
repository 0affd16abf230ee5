//! In-process fakes for the target database, the extractor and alert
//! channels, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wmsync_engine::config::parser::parse_config_str;
use wmsync_engine::config::{AlertConfig, PoolConfig, RateLimitConfig, SyncConfig, ValidationConfig};
use wmsync_engine::error::AlertDeliveryError;
use wmsync_engine::pipeline::{FilterOp, PipelineRequest, PipelineStream};
use wmsync_engine::{
    AlertChannel, AlertDispatcher, ConnectionError, ConnectionPool, Connector, DataValidator,
    DbConnection, PipelineExecutionError, PipelineLauncher, SyncOrchestrator, TargetKeyLookup,
};
use wmsync_state::{JsonFileBookmarkStore, SqliteStateBackend};
use wmsync_types::alert::{Alert, Severity};
use wmsync_types::record::Record;
use wmsync_types::state::{CursorValue, EntityName};

// ---------------------------------------------------------------------------
// Target database
// ---------------------------------------------------------------------------

/// Shared in-memory target: committed rows per entity, keyed by primary key.
#[derive(Default)]
pub struct FakeConnector {
    rows: Arc<Mutex<BTreeMap<EntityName, BTreeMap<String, Record>>>>,
    tables: Mutex<BTreeSet<EntityName>>,
    live: Mutex<Vec<Arc<AtomicBool>>>,
    refuse: AtomicBool,
    dead_on_connect: AtomicUsize,
    commits_left: Arc<AtomicUsize>,
    commit_delay: Arc<Mutex<Option<Duration>>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let connector = Self::default();
        connector.commits_left.store(usize::MAX, Ordering::SeqCst);
        Arc::new(connector)
    }

    /// Kill every connection opened so far; their next ping fails fatally.
    pub fn kill_existing(&self) {
        for alive in self.live.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// The next `n` connections open fine but fail their first ping.
    pub fn open_dead(&self, n: usize) {
        self.dead_on_connect.store(n, Ordering::SeqCst);
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Let `n` more commits succeed; later ones fail transiently.
    pub fn allow_commits(&self, n: usize) {
        self.commits_left.store(n, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = Some(delay);
    }

    /// Rows committed by some earlier process.
    pub fn seed(&self, entity: &str, records: Vec<Value>) {
        let mut rows = self.rows.lock().unwrap();
        let table = rows.entry(EntityName::from(entity)).or_default();
        for record in records {
            let key = record.get("id").and_then(wmsync_engine::validator::key_text).unwrap();
            table.insert(key, record.as_object().cloned().unwrap());
        }
    }

    pub fn add_table(&self, entity: &str) {
        self.tables.lock().unwrap().insert(EntityName::from(entity));
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .get(&EntityName::from(entity))
            .map_or(0, BTreeMap::len)
    }

    pub fn keys(&self, entity: &str) -> BTreeSet<String> {
        self.rows
            .lock()
            .unwrap()
            .get(&EntityName::from(entity))
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn DbConnection>, ConnectionError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Fatal("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let dead = self
            .dead_on_connect
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let alive = Arc::new(AtomicBool::new(!dead));
        self.live.lock().unwrap().push(Arc::clone(&alive));
        Ok(Box::new(FakeConnection {
            alive,
            rows: Arc::clone(&self.rows),
            tables: self.tables.lock().unwrap().clone(),
            commits_left: Arc::clone(&self.commits_left),
            commit_delay: Arc::clone(&self.commit_delay),
        }))
    }
}

pub struct FakeConnection {
    alive: Arc<AtomicBool>,
    rows: Arc<Mutex<BTreeMap<EntityName, BTreeMap<String, Record>>>>,
    tables: BTreeSet<EntityName>,
    commits_left: Arc<AtomicUsize>,
    commit_delay: Arc<Mutex<Option<Duration>>>,
}

impl FakeConnection {
    fn check_alive(&self) -> Result<(), ConnectionError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::Fatal("server closed the connection".into()))
        }
    }
}

impl DbConnection for FakeConnection {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        self.check_alive()
    }

    fn commit_batch(
        &mut self,
        entity: &EntityName,
        primary_key: &str,
        records: &[Record],
    ) -> Result<u64, ConnectionError> {
        self.check_alive()?;
        let delay = *self.commit_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let allowed = self
            .commits_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(ConnectionError::Transient(
                "could not serialize access due to concurrent update".into(),
            ));
        }
        let mut rows = self.rows.lock().unwrap();
        let table = rows.entry(entity.clone()).or_default();
        for record in records {
            let key = record
                .get(primary_key)
                .and_then(wmsync_engine::validator::key_text)
                .ok_or_else(|| ConnectionError::Rejected(format!("missing key {primary_key}")))?;
            table.insert(key, record.clone());
        }
        Ok(records.len() as u64)
    }

    fn table_exists(&mut self, entity: &EntityName) -> Result<bool, ConnectionError> {
        self.check_alive()?;
        Ok(self.tables.contains(entity) || self.rows.lock().unwrap().contains_key(entity))
    }

    fn key_exists(&mut self, entity: &EntityName, key: &str) -> Result<bool, ConnectionError> {
        self.check_alive()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(entity)
            .is_some_and(|rows| rows.contains_key(key)))
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Serves records per entity honouring the request's cursor filter and
/// ordering, checkpointing every `state_every` records.
pub struct FakeLauncher {
    source: Mutex<BTreeMap<EntityName, Vec<Value>>>,
    pub state_every: usize,
    /// Stop with a process failure after this many RECORD lines.
    fail_after: Mutex<Option<usize>>,
    pub line_delay: Option<Duration>,
    pub omit_state: bool,
    pub extra_lines: Vec<String>,
    requests: Mutex<Vec<PipelineRequest>>,
}

impl FakeLauncher {
    pub fn new(source: BTreeMap<EntityName, Vec<Value>>) -> Self {
        Self {
            source: Mutex::new(source),
            state_every: 10,
            fail_after: Mutex::new(None),
            line_delay: None,
            omit_state: false,
            extra_lines: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_after(&self, records: Option<usize>) {
        *self.fail_after.lock().unwrap() = records;
    }

    pub fn requests(&self) -> Vec<PipelineRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn replace_source(&self, entity: &str, records: Vec<Value>) {
        self.source
            .lock()
            .unwrap()
            .insert(EntityName::from(entity), records);
    }

    fn script(&self, request: &PipelineRequest) -> Vec<String> {
        let source = self.source.lock().unwrap();
        let mut lines = self.extra_lines.clone();
        let key = request.ordering_key.as_str();
        for entity_request in &request.entities {
            let mut records: Vec<&Value> = source
                .get(&entity_request.entity)
                .map(|r| r.iter().collect())
                .unwrap_or_default();
            if let Some(filter) = &entity_request.filter {
                records.retain(|r| {
                    let Some(value) = r.get(key).and_then(CursorValue::from_json) else {
                        return false;
                    };
                    let ordering = value.compare(&filter.value);
                    match filter.op {
                        FilterOp::Lt => ordering.is_lt(),
                        FilterOp::Gte => !ordering.is_lt(),
                    }
                });
            }
            records.sort_by(|a, b| {
                let a = a.get(key).and_then(CursorValue::from_json);
                let b = b.get(key).and_then(CursorValue::from_json);
                let ordering = match (a, b) {
                    (Some(a), Some(b)) => a.compare(&b),
                    _ => std::cmp::Ordering::Equal,
                };
                if request.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });

            let stream = entity_request.entity.as_str();
            for (i, record) in records.iter().enumerate() {
                lines.push(json!({"type": "RECORD", "stream": stream, "record": record}).to_string());
                let last = i + 1 == records.len();
                if !self.omit_state && ((i + 1) % self.state_every.max(1) == 0 || last) {
                    lines.push(
                        json!({
                            "type": "STATE",
                            "value": {"bookmarks": {stream: {"replication_key_value": record[key]}}}
                        })
                        .to_string(),
                    );
                }
            }
        }
        if !self.omit_state {
            lines.push(json!({"type": "STATE", "value": {"bookmarks": {}}}).to_string());
        }
        lines
    }
}

#[async_trait]
impl PipelineLauncher for FakeLauncher {
    async fn launch(
        &self,
        request: &PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineStream, PipelineExecutionError> {
        self.requests.lock().unwrap().push(request.clone());
        let lines = self.script(request);
        let fail_after = *self.fail_after.lock().unwrap();
        let delay = self.line_delay;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut records = 0usize;
            for line in lines {
                if line.contains("\"RECORD\"") {
                    if fail_after == Some(records) {
                        // Let in-flight batches finish before the process dies.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        let _ = tx
                            .send(Err(PipelineExecutionError::ProcessFailed {
                                status: "exit status: 1".into(),
                            }))
                            .await;
                        return;
                    }
                    records += 1;
                }
                if let Some(delay) = delay {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    sent = tx.send(Ok(line)) => if sent.is_err() { return },
                }
            }
        });
        Ok(PipelineStream::new(rx))
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

pub struct RecordingChannel {
    seen: Mutex<Vec<Alert>>,
}

impl RecordingChannel {
    pub const NAME: &'static str = "recording";

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Alert> {
        self.seen.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<Alert> {
        self.seen()
            .into_iter()
            .filter(|a| a.kind == kind)
            .collect()
    }
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError> {
        self.seen.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Every severity routed to the recording channel.
pub fn recording_alert_config(max_per_window: usize) -> AlertConfig {
    let route = vec!["log".to_string(), RecordingChannel::NAME.to_string()];
    AlertConfig {
        routing: [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ]
        .into_iter()
        .map(|s| (s, route.clone()))
        .collect(),
        rate_limit: RateLimitConfig {
            window_secs: 60,
            max_per_window,
        },
        ..AlertConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn sync_config(extra: &str) -> SyncConfig {
    let yaml = format!(
        "target:\n  connection: host=localhost\npipeline:\n  command: fake-extractor\n{extra}"
    );
    parse_config_str(&yaml).unwrap()
}

pub fn fast_pool() -> PoolConfig {
    PoolConfig {
        pool_size: 2,
        max_overflow: 1,
        lease_timeout_ms: 2_000,
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_multiplier: 2.0,
        max_wait_ms: 10,
        escalation_window_secs: 300,
    }
}

pub struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub connector: Arc<FakeConnector>,
    pub launcher: Arc<FakeLauncher>,
    pub channel: Arc<RecordingChannel>,
    pub alerts: Arc<AlertDispatcher>,
    pub bookmarks: Arc<JsonFileBookmarkStore>,
    pub pool: ConnectionPool,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(launcher: FakeLauncher, validation: ValidationConfig) -> Self {
        Self::with_pool(launcher, validation, fast_pool())
    }

    pub fn with_pool(launcher: FakeLauncher, validation: ValidationConfig, pool: PoolConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let channel = RecordingChannel::new();
        let alerts = Arc::new(AlertDispatcher::new(
            &recording_alert_config(1_000),
            vec![channel.clone()],
        ));
        let connector = FakeConnector::new();
        let pool = ConnectionPool::new(connector.clone(), pool, Some(Arc::clone(&alerts)));
        let bookmarks =
            Arc::new(JsonFileBookmarkStore::open(dir.path().join("bookmarks.json")).unwrap());
        let ledger = Arc::new(SqliteStateBackend::open(&dir.path().join("state.db")).unwrap());
        let launcher = Arc::new(launcher);
        let validator = Arc::new(DataValidator::new(validation).unwrap());
        let orchestrator = SyncOrchestrator::new(
            validator,
            pool.clone(),
            Arc::clone(&alerts),
            bookmarks.clone(),
            launcher.clone(),
        )
        .with_ledger(ledger);
        Self {
            orchestrator,
            connector,
            launcher,
            channel,
            alerts,
            bookmarks,
            pool,
            dir,
        }
    }
}

impl Harness {
    /// Check references against rows already in the fake target.
    pub fn with_target_lookup(mut self) -> Self {
        let lookup = TargetKeyLookup::new(self.connector.clone());
        self.orchestrator = self.orchestrator.with_reference_lookup(Arc::new(lookup));
        self
    }
}

pub fn orders(ids: impl IntoIterator<Item = i64>) -> Vec<Value> {
    ids.into_iter()
        .map(|id| {
            json!({
                "id": id,
                "qty": 1 + id % 7,
                "updated_at": format!("2024-05-01T10:{:02}:{:02}Z", (id / 60) % 60, id % 60),
            })
        })
        .collect()
}

pub fn source(entries: Vec<(&str, Vec<Value>)>) -> BTreeMap<EntityName, Vec<Value>> {
    entries
        .into_iter()
        .map(|(entity, records)| (EntityName::from(entity), records))
        .collect()
}
