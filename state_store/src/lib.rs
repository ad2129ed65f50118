use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_model::{
    Execution,
    ExecutionId,
    Function,
    FunctionId,
    Job,
    JobId,
    Runtime,
    RuntimeId,
};

pub mod memory;

pub use memory::InMemoryMetadataStore;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("{kind} {id} is still referenced")]
    InUse { kind: &'static str, id: String },
    #[error("version conflict on {kind} {id}: expected {expected}, found {found}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },
    #[error("metadata store unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A record paired with the optimistic-lock version the store assigned to it.
/// Updates must present the version they read; a mismatch is a
/// [`StoreError::VersionConflict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub record: T,
    pub version: u64,
}

/// Persistence boundary for control-plane records. All writes are
/// compare-and-swap on a per-record version so concurrent writers can detect
/// each other; none of the methods block on anything but the store itself.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn create_runtime(&self, runtime: Runtime) -> StoreResult<Versioned<Runtime>>;
    async fn runtime(&self, id: &RuntimeId) -> StoreResult<Option<Versioned<Runtime>>>;
    async fn list_runtimes(&self) -> StoreResult<Vec<Versioned<Runtime>>>;
    async fn update_runtime(
        &self,
        expected_version: u64,
        runtime: Runtime,
    ) -> StoreResult<Versioned<Runtime>>;
    async fn remove_runtime(&self, id: &RuntimeId) -> StoreResult<()>;

    async fn create_function(&self, function: Function) -> StoreResult<Versioned<Function>>;
    async fn function(&self, id: &FunctionId) -> StoreResult<Option<Versioned<Function>>>;
    async fn list_functions(&self) -> StoreResult<Vec<Versioned<Function>>>;
    async fn remove_function(&self, id: &FunctionId) -> StoreResult<()>;

    async fn create_execution(&self, execution: Execution) -> StoreResult<Versioned<Execution>>;
    async fn execution(&self, id: &ExecutionId) -> StoreResult<Option<Versioned<Execution>>>;
    async fn update_execution(
        &self,
        expected_version: u64,
        execution: Execution,
    ) -> StoreResult<Versioned<Execution>>;
    async fn list_nonterminal_executions(&self) -> StoreResult<Vec<Versioned<Execution>>>;

    async fn create_job(&self, job: Job) -> StoreResult<Versioned<Job>>;
    async fn job(&self, id: &JobId) -> StoreResult<Option<Versioned<Job>>>;
    async fn list_jobs(&self) -> StoreResult<Vec<Versioned<Job>>>;
    /// Enabled jobs whose next fire time is at or before `now`, ordered by
    /// fire time, capped at `limit`.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Versioned<Job>>>;
    async fn update_job(&self, expected_version: u64, job: Job) -> StoreResult<Versioned<Job>>;
    async fn remove_job(&self, id: &JobId) -> StoreResult<()>;
}
