use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use data_model::{
    Execution,
    ExecutionError,
    ExecutionStatus,
    Function,
    Job,
    PackageRef,
    PoolPolicy,
    ResourceSpec,
    Runtime,
    RuntimeStatus,
    Schedule,
};
use processor::{
    dispatcher::DispatchError,
    pool::PoolError,
};
use serde::{Deserialize, Serialize};
use state_store::{StoreError, Versioned};
use tracing::error;

use crate::runtimes::RuntimeOpError;

#[derive(Debug, Serialize, Deserialize)]
pub struct KilnAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl KilnAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for KilnAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<serde_json::Error> for KilnAPIError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<StoreError> for KilnAPIError {
    fn from(err: StoreError) -> Self {
        let status_code = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. } |
            StoreError::InUse { .. } |
            StoreError::VersionConflict { .. } => StatusCode::CONFLICT,
            StoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status_code, &err.to_string())
    }
}

impl From<DispatchError> for KilnAPIError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::FunctionNotFound(_) => Self::not_found(&err.to_string()),
            DispatchError::Store(store_err) => store_err.into(),
            DispatchError::Invalid(_) => Self::bad_request(&err.to_string()),
        }
    }
}

impl From<PoolError> for KilnAPIError {
    fn from(err: PoolError) -> Self {
        let status_code = match &err {
            PoolError::UnknownRuntime(_) => StatusCode::NOT_FOUND,
            PoolError::NoCapacity(_) | PoolError::WaitTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PoolError::Driver(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status_code, &err.to_string())
    }
}

impl From<RuntimeOpError> for KilnAPIError {
    fn from(err: RuntimeOpError) -> Self {
        match err {
            RuntimeOpError::NotFound(_) => Self::not_found(&err.to_string()),
            RuntimeOpError::Invalid(_) => Self::bad_request(&err.to_string()),
            RuntimeOpError::Store(store_err) => store_err.into(),
            RuntimeOpError::Pool(pool_err) => pool_err.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRuntime {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub pool: PoolPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeOut {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: RuntimeStatus,
    pub pool: PoolPolicy,
    pub created_at: u64,
    pub version: u64,
}

impl From<Versioned<Runtime>> for RuntimeOut {
    fn from(versioned: Versioned<Runtime>) -> Self {
        Self {
            id: versioned.record.id.get().to_string(),
            name: versioned.record.name,
            image: versioned.record.image,
            status: versioned.record.status,
            pool: versioned.record.pool,
            created_at: versioned.record.created_at,
            version: versioned.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimesList {
    pub runtimes: Vec<RuntimeOut>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRuntimeImage {
    pub image: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleUpResponse {
    pub desired: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleDownResponse {
    pub removed: usize,
}

/// JSON manifest carried in the `function` field of the create-function
/// multipart request. The code bundle rides alongside it as `code`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionManifest {
    pub name: String,
    pub runtime_id: String,
    pub timeout_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub idempotent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionOut {
    pub id: String,
    pub name: String,
    pub runtime_id: String,
    pub code: PackageRef,
    pub resources: ResourceSpec,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub idempotent: bool,
    pub version: u32,
    pub created_at: u64,
}

impl From<Versioned<Function>> for FunctionOut {
    fn from(versioned: Versioned<Function>) -> Self {
        Self {
            id: versioned.record.id.get().to_string(),
            name: versioned.record.name,
            runtime_id: versioned.record.runtime_id.get().to_string(),
            code: versioned.record.code,
            resources: versioned.record.resources,
            timeout_ms: versioned.record.timeout_ms,
            max_concurrency: versioned.record.max_concurrency,
            idempotent: versioned.record.idempotent,
            version: versioned.record.version,
            created_at: versioned.record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionsList {
    pub functions: Vec<FunctionOut>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeParams {
    #[serde(default)]
    pub sync: bool,
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionOut {
    pub id: String,
    pub function_id: String,
    pub runtime_id: String,
    pub status: ExecutionStatus,
    pub sync: bool,
    pub instance_id: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    pub logs: String,
    pub job_id: Option<String>,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub version: u64,
}

impl From<Versioned<Execution>> for ExecutionOut {
    fn from(versioned: Versioned<Execution>) -> Self {
        Self {
            id: versioned.record.id.get().to_string(),
            function_id: versioned.record.function_id.get().to_string(),
            runtime_id: versioned.record.runtime_id.get().to_string(),
            status: versioned.record.status,
            sync: versioned.record.sync,
            instance_id: versioned.record.instance_id.map(|id| id.get().to_string()),
            output: versioned.record.output,
            error: versioned.record.error,
            logs: versioned.record.logs,
            job_id: versioned.record.job_id.map(|id| id.get().to_string()),
            queued_at: versioned.record.queued_at,
            started_at: versioned.record.started_at,
            finished_at: versioned.record.finished_at,
            version: versioned.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJob {
    pub function_id: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobOut {
    pub id: String,
    pub function_id: String,
    pub schedule: Schedule,
    pub input: serde_json::Value,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<ExecutionStatus>,
    pub created_at: u64,
    pub version: u64,
}

impl From<Versioned<Job>> for JobOut {
    fn from(versioned: Versioned<Job>) -> Self {
        Self {
            id: versioned.record.id.get().to_string(),
            function_id: versioned.record.function_id.get().to_string(),
            schedule: versioned.record.schedule,
            input: versioned.record.input,
            enabled: versioned.record.enabled,
            next_fire_at: versioned.record.next_fire_at,
            last_fire_at: versioned.record.last_fire_at,
            last_outcome: versioned.record.last_outcome,
            created_at: versioned.record.created_at,
            version: versioned.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobsList {
    pub jobs: Vec<JobOut>,
}
