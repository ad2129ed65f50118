pub mod test_objects;

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use kiln_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct RuntimeId(String);

impl RuntimeId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuntimeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for FunctionId {
    fn default() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Instance ids carry their runtime id as a prefix so operators can read
    /// driver logs without cross-referencing.
    pub fn for_runtime(runtime_id: &RuntimeId) -> Self {
        Self(format!("{}-{}", runtime_id, nanoid::nanoid!(10)))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Content-addressed reference to a code bundle in the package store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PackageRef {
    pub url: String,
    pub size: u64,
    pub sha256_hash: String,
}

fn default_min_warm() -> usize {
    0
}

fn default_max_size() -> usize {
    4
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

/// Warm-capacity bounds for one runtime's instance pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolPolicy {
    #[serde(default = "default_min_warm")]
    pub min_warm: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_warm: default_min_warm(),
            max_size: default_max_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl PoolPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(anyhow!("pool max_size must be at least 1"));
        }
        if self.min_warm > self.max_size {
            return Err(anyhow!(
                "pool min_warm {} exceeds max_size {}",
                self.min_warm,
                self.max_size
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, AsRefStr, strum::Display)]
pub enum RuntimeStatus {
    #[default]
    Creating,
    Available,
    Upgrading,
    Error,
}

/// An execution environment template. Each runtime owns one warm pool of
/// interchangeable instances booted from its image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Runtime {
    pub id: RuntimeId,
    pub name: String,
    pub image: String,
    pub status: RuntimeStatus,
    pub pool: PoolPolicy,
    pub created_at: u64,
}

impl RuntimeBuilder {
    pub fn build(&self) -> Result<Runtime> {
        let id = self.id.clone().ok_or(anyhow!("id is not present"))?;
        let name = self.name.clone().ok_or(anyhow!("name is not present"))?;
        let image = self.image.clone().ok_or(anyhow!("image is not present"))?;
        let pool = self.pool.clone().unwrap_or_default();
        pool.validate()?;
        Ok(Runtime {
            id,
            name,
            image,
            status: RuntimeStatus::Creating,
            pool,
            created_at: get_epoch_time_in_ms(),
        })
    }
}

impl Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Runtime(id: {}, image: {}, status: {})",
            self.id, self.image, self.status
        )
    }
}

fn default_cpu_request_millis() -> u64 {
    100
}

fn default_cpu_limit_millis() -> u64 {
    200
}

fn default_memory_request_bytes() -> u64 {
    33_554_432
}

fn default_memory_limit_bytes() -> u64 {
    134_217_728
}

/// CPU and memory envelope for instances running a function. Requests are
/// reserved at placement; limits cap what the instance may consume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    #[serde(default = "default_cpu_request_millis")]
    pub cpu_request_millis: u64,
    #[serde(default = "default_cpu_limit_millis")]
    pub cpu_limit_millis: u64,
    #[serde(default = "default_memory_request_bytes")]
    pub memory_request_bytes: u64,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_request_millis: default_cpu_request_millis(),
            cpu_limit_millis: default_cpu_limit_millis(),
            memory_request_bytes: default_memory_request_bytes(),
            memory_limit_bytes: default_memory_limit_bytes(),
        }
    }
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_limit_millis == 0 || self.memory_limit_bytes == 0 {
            return Err(anyhow!("resource limits must be non-zero"));
        }
        if self.cpu_request_millis > self.cpu_limit_millis {
            return Err(anyhow!(
                "cpu request {}m exceeds limit {}m",
                self.cpu_request_millis,
                self.cpu_limit_millis
            ));
        }
        if self.memory_request_bytes > self.memory_limit_bytes {
            return Err(anyhow!(
                "memory request {} exceeds limit {}",
                self.memory_request_bytes,
                self.memory_limit_bytes
            ));
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    10
}

/// A published unit of user code. Immutable once created; changes are
/// published as a new version via [`Function::new_version`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub runtime_id: RuntimeId,
    pub code: PackageRef,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub idempotent: bool,
    pub version: u32,
    pub created_at: u64,
}

impl Function {
    /// A new function record sharing this function's name and runtime, with
    /// fresh code and a bumped version. The returned record has its own id;
    /// the original is left untouched.
    pub fn new_version(&self, code: PackageRef) -> Function {
        Function {
            id: FunctionId::default(),
            name: self.name.clone(),
            runtime_id: self.runtime_id.clone(),
            code,
            resources: self.resources,
            timeout_ms: self.timeout_ms,
            max_concurrency: self.max_concurrency,
            idempotent: self.idempotent,
            version: self.version + 1,
            created_at: get_epoch_time_in_ms(),
        }
    }
}

impl FunctionBuilder {
    pub fn build(&self) -> Result<Function> {
        let name = self.name.clone().ok_or(anyhow!("name is not present"))?;
        let runtime_id = self
            .runtime_id
            .clone()
            .ok_or(anyhow!("runtime id is not present"))?;
        let code = self.code.clone().ok_or(anyhow!("code is not present"))?;
        let max_concurrency = self.max_concurrency.unwrap_or_else(default_max_concurrency);
        if max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be at least 1"));
        }
        let resources = self.resources.unwrap_or_default();
        resources.validate()?;
        Ok(Function {
            id: self.id.clone().unwrap_or_default(),
            name,
            runtime_id,
            code,
            resources,
            timeout_ms: self.timeout_ms.unwrap_or_else(default_timeout_ms),
            max_concurrency,
            idempotent: self.idempotent.unwrap_or(false),
            version: self.version.unwrap_or(1),
            created_at: get_epoch_time_in_ms(),
        })
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Function(id: {}, name: {}, version: {}, runtime: {})",
            self.id, self.name, self.version, self.runtime_id
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display)]
pub enum TerminationReason {
    ProvisionFailed,
    Crashed,
    Unhealthy,
    Evicted,
    RuntimeRemoved,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, AsRefStr, strum::Display)]
pub enum InstanceState {
    #[default]
    Provisioning,
    Ready,
    Busy,
    Draining,
    Terminated {
        reason: TerminationReason,
    },
}

impl InstanceState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, InstanceState::Terminated { .. })
    }
}

/// One provisioned copy of a runtime, addressable while Ready or Busy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub runtime_id: RuntimeId,
    pub state: InstanceState,
    pub endpoint: Option<String>,
    pub created_at: u64,
}

impl Instance {
    pub fn new(runtime_id: RuntimeId) -> Self {
        Self {
            id: InstanceId::for_runtime(&runtime_id),
            runtime_id,
            state: InstanceState::Provisioning,
            endpoint: None,
            created_at: get_epoch_time_in_ms(),
        }
    }
}

impl Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance(id: {}, state: {}, endpoint: {:?})",
            self.id, self.state, self.endpoint
        )
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
pub enum ExecutionStatus {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

/// Distinguishes who is at fault when an execution does not succeed: the
/// user's code, the platform underneath it, or a deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, strum::Display)]
pub enum FailureKind {
    Function,
    Platform,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionError {
    pub fn function(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Function,
            message: message.into(),
        }
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Platform,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }
}

/// One invocation of a function, from submission to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Execution {
    pub id: ExecutionId,
    pub function_id: FunctionId,
    pub runtime_id: RuntimeId,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    pub sync: bool,
    pub instance_id: Option<InstanceId>,
    pub output: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub logs: String,
    pub job_id: Option<JobId>,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl Execution {
    pub fn terminal_state(&self) -> bool {
        self.status.is_terminal()
    }
}

impl ExecutionBuilder {
    pub fn build(&self) -> Result<Execution> {
        let function_id = self
            .function_id
            .clone()
            .ok_or(anyhow!("function id is not present"))?;
        let runtime_id = self
            .runtime_id
            .clone()
            .ok_or(anyhow!("runtime id is not present"))?;
        let input = self.input.clone().ok_or(anyhow!("input is not present"))?;
        Ok(Execution {
            id: ExecutionId::default(),
            function_id,
            runtime_id,
            input,
            status: ExecutionStatus::Queued,
            sync: self.sync.unwrap_or(false),
            instance_id: None,
            output: None,
            error: None,
            logs: String::new(),
            job_id: self.job_id.clone().flatten(),
            queued_at: get_epoch_time_in_ms(),
            started_at: None,
            finished_at: None,
        })
    }
}

impl Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Execution(id: {}, function: {}, status: {})",
            self.id, self.function_id, self.status
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("one-shot fire time {time} is not in the future")]
    FireTimeNotFuture { time: DateTime<Utc> },
}

/// When a job fires: repeatedly on a cron expression, or once at a fixed
/// instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Cron { expr: String },
    At { time: DateTime<Utc> },
}

impl Schedule {
    /// Accepts classic five-field cron expressions by pinning seconds to
    /// zero; six- and seven-field expressions pass through untouched.
    fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        match self {
            Schedule::Cron { expr } => Self::parse_cron(expr).map(|_| ()),
            Schedule::At { time } => {
                if *time > now {
                    Ok(())
                } else {
                    Err(ScheduleError::FireTimeNotFuture { time: *time })
                }
            }
        }
    }

    /// The next fire time strictly after `after`, or None when the schedule
    /// has nothing left to fire. Missed ticks are never replayed: a cron
    /// schedule that went unserviced for an hour yields a single future time
    /// here, not sixty past ones.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Cron { expr } => Ok(Self::parse_cron(expr)?.after(&after).next()),
            Schedule::At { time } => Ok((*time > after).then_some(*time)),
        }
    }
}

impl Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron { expr } => write!(f, "cron({expr})"),
            Schedule::At { time } => write!(f, "at({time})"),
        }
    }
}

/// A trigger that submits executions of one function on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Job {
    pub id: JobId,
    pub function_id: FunctionId,
    pub schedule: Schedule,
    pub input: serde_json::Value,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<ExecutionStatus>,
    pub created_at: u64,
}

impl JobBuilder {
    pub fn build(&self) -> Result<Job> {
        let function_id = self
            .function_id
            .clone()
            .ok_or(anyhow!("function id is not present"))?;
        let schedule = self
            .schedule
            .clone()
            .ok_or(anyhow!("schedule is not present"))?;
        let now = Utc::now();
        schedule.validate(now)?;
        let next_fire_at = schedule.next_after(now)?;
        Ok(Job {
            id: JobId::default(),
            function_id,
            schedule,
            input: self.input.clone().unwrap_or(serde_json::Value::Null),
            enabled: true,
            next_fire_at,
            last_fire_at: None,
            last_outcome: None,
            created_at: get_epoch_time_in_ms(),
        })
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job(id: {}, function: {}, schedule: {}, enabled: {})",
            self.id, self.function_id, self.schedule, self.enabled
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_objects::tests::{mock_function, mock_runtime};

    #[test]
    fn test_five_field_cron_is_normalized() {
        let schedule = Schedule::Cron {
            expr: "*/5 * * * *".to_string(),
        };
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 30).unwrap();
        let next = schedule.next_after(after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_cron_next_is_strictly_future() {
        let schedule = Schedule::Cron {
            expr: "* * * * *".to_string(),
        };
        // `after` lands exactly on a minute boundary; the next fire must not
        // be the boundary itself.
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = schedule.next_after(after).unwrap().unwrap();
        assert!(next > after);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let schedule = Schedule::Cron {
            expr: "not a cron".to_string(),
        };
        assert!(matches!(
            schedule.validate(Utc::now()),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_one_shot_in_past_is_rejected() {
        let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let schedule = Schedule::At { time };
        assert_eq!(
            schedule.validate(Utc::now()),
            Err(ScheduleError::FireTimeNotFuture { time })
        );
    }

    #[test]
    fn test_one_shot_next_after_exhausts() {
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let schedule = Schedule::At { time };
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        assert_eq!(schedule.next_after(before).unwrap(), Some(time));
        assert_eq!(schedule.next_after(time).unwrap(), None);
    }

    #[test]
    fn test_function_new_version_bumps_and_reidentifies() {
        let function = mock_function("resize", 1, false);
        let new_code = PackageRef {
            url: "file:///packages/abc".to_string(),
            size: 64,
            sha256_hash: "abc123".to_string(),
        };
        let next = function.new_version(new_code.clone());
        assert_ne!(next.id, function.id);
        assert_eq!(next.version, function.version + 1);
        assert_eq!(next.name, function.name);
        assert_eq!(next.code, new_code);
        assert_eq!(function.version, 1);
    }

    #[test]
    fn test_pool_policy_validation() {
        let mut runtime = mock_runtime("python311");
        runtime.pool.min_warm = 5;
        runtime.pool.max_size = 2;
        assert!(runtime.pool.validate().is_err());
        runtime.pool.min_warm = 0;
        runtime.pool.max_size = 0;
        assert!(runtime.pool.validate().is_err());
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let err = FunctionBuilder::default()
            .name("f".to_string())
            .runtime_id(RuntimeId::from("rt"))
            .code(PackageRef::default())
            .max_concurrency(0)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_builder_rejects_requests_above_limits() {
        let err = FunctionBuilder::default()
            .name("f".to_string())
            .runtime_id(RuntimeId::from("rt"))
            .code(PackageRef::default())
            .resources(ResourceSpec {
                cpu_request_millis: 500,
                cpu_limit_millis: 200,
                ..Default::default()
            })
            .build();
        assert!(err.is_err());

        let function = mock_function("resize", 1, false);
        assert!(function.resources.validate().is_ok());
        assert!(function.resources.cpu_request_millis <= function.resources.cpu_limit_millis);
    }

    #[test]
    fn test_execution_starts_queued() {
        let function = mock_function("resize", 2, true);
        let execution = ExecutionBuilder::default()
            .function_id(function.id.clone())
            .runtime_id(function.runtime_id.clone())
            .input(serde_json::json!({"k": "v"}))
            .build()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert!(!execution.terminal_state());
        assert!(execution.instance_id.is_none());
    }
}
