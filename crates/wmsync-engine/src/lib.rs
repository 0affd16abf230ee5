//! Sync orchestration for wmsync.
//!
//! Drives extract runs of warehouse entities through four-layer batch
//! validation into a target Postgres database, with bookmark resume, a
//! health-checked connection pool and rate-limited alerting.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod validator;

pub use alert::{channels_from_config, AlertChannel, AlertDispatcher, DeliveryReport};
pub use error::{
    AlreadyRunning, ConfigurationError, ConnectionError, OrchestratorError, PipelineExecutionError,
    PoolError,
};
pub use lock::{RunLock, RunLockRegistry};
pub use orchestrator::SyncOrchestrator;
pub use pipeline::{PipelineLauncher, PipelineRequest, PipelineStream, ProcessPipelineLauncher};
pub use pool::{
    ConnectionLease, ConnectionPool, Connector, DbConnection, PgConnector, TargetKeyLookup,
};
pub use validator::{CommittedKeyIndex, DataValidator, ReferenceLookup};
