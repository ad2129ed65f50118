use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use data_model::{
    Execution,
    ExecutionBuilder,
    ExecutionError,
    ExecutionId,
    ExecutionStatus,
    Function,
    FunctionId,
    JobId,
};
use kiln_utils::{
    backoff::{BackoffPolicy, ExponentialBackoff},
    get_epoch_time_in_ms,
};
use metrics::{dispatch_stats, CounterGuard, Timer};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use state_store::{MetadataStore, StoreError, Versioned};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    instance_client::{InstanceClient, InvokeError, InvokeRequest},
    pool::{InstanceLease, PoolError, PoolManager},
};

const FINISHED_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    Sync,
    Async,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub function_id: FunctionId,
    pub input: serde_json::Value,
    pub mode: SubmitMode,
    /// Overall deadline for queueing, placement and the invocation itself.
    pub deadline: Option<Duration>,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    25
}

fn default_backoff_cap_ms() -> u64 {
    1000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl DispatchConfig {
    fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            ..BackoffPolicy::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("function {0} not found")]
    FunctionNotFound(FunctionId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Invalid(#[from] anyhow::Error),
}

/// Broadcast once per execution reaching a terminal status.
#[derive(Debug, Clone)]
pub struct ExecutionFinished {
    pub execution_id: ExecutionId,
    pub function_id: FunctionId,
    pub job_id: Option<JobId>,
    pub status: ExecutionStatus,
}

enum LeaseOutcome {
    Leased(InstanceLease),
    DeadlineExpired(String),
    Unavailable(String),
}

/// Drives executions from submission to a terminal status.
///
/// A per-function semaphore enforces the concurrency ceiling with FIFO
/// admission; past the gate, an instance lease is acquired with exponential
/// backoff while the pool reports no capacity. A transport failure burns the
/// leased instance and is retried exactly once on a fresh one for idempotent
/// functions. All record updates are compare-and-swap, and a terminal status
/// is never overwritten.
pub struct Dispatcher {
    store: Arc<dyn MetadataStore>,
    pool: Arc<PoolManager>,
    client: Arc<dyn InstanceClient>,
    gates: DashMap<FunctionId, Arc<Semaphore>>,
    finished_tx: broadcast::Sender<ExecutionFinished>,
    metrics: dispatch_stats::Metrics,
    config: DispatchConfig,
}

fn function_labels(function_id: &FunctionId) -> [KeyValue; 1] {
    [KeyValue::new("function", function_id.get().to_string())]
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pool: Arc<PoolManager>,
        client: Arc<dyn InstanceClient>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        let (finished_tx, _) = broadcast::channel(FINISHED_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            pool,
            client,
            gates: DashMap::new(),
            finished_tx,
            metrics: dispatch_stats::Metrics::new(),
            config,
        })
    }

    pub fn subscribe_finished(&self) -> broadcast::Receiver<ExecutionFinished> {
        self.finished_tx.subscribe()
    }

    /// Drops the concurrency gate of a deleted function. In-flight
    /// executions keep the permits they already hold.
    pub fn forget_function(&self, function_id: &FunctionId) {
        self.gates.remove(function_id);
    }

    /// Accepts an invocation. Sync submissions return the terminal record;
    /// async ones return the queued record and complete in the background.
    pub async fn submit(
        self: &Arc<Self>,
        request: SubmitRequest,
    ) -> Result<Versioned<Execution>, DispatchError> {
        let function = self
            .store
            .function(&request.function_id)
            .await?
            .ok_or_else(|| DispatchError::FunctionNotFound(request.function_id.clone()))?
            .record;
        let execution = ExecutionBuilder::default()
            .function_id(function.id.clone())
            .runtime_id(function.runtime_id.clone())
            .input(request.input)
            .sync(request.mode == SubmitMode::Sync)
            .job_id(request.job_id)
            .build()?;
        let versioned = self.store.create_execution(execution).await?;
        self.metrics
            .submissions
            .add(1, &function_labels(&function.id));
        info!(
            execution_id = versioned.record.id.get(),
            function_id = function.id.get(),
            sync = versioned.record.sync,
            "Accepted invocation"
        );

        let deadline = tokio::time::Instant::now() +
            request
                .deadline
                .unwrap_or(Duration::from_millis(self.config.default_deadline_ms));
        match request.mode {
            SubmitMode::Sync => Ok(self.drive(versioned, function, deadline).await),
            SubmitMode::Async => {
                let dispatcher = Arc::clone(self);
                let queued = versioned.clone();
                tokio::spawn(async move {
                    dispatcher.drive(versioned, function, deadline).await;
                });
                Ok(queued)
            }
        }
    }

    /// Fails over executions that were in flight when the control plane
    /// stopped. Called once at startup, before accepting traffic.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let stale = self.store.list_nonterminal_executions().await?;
        let count = stale.len();
        for versioned in stale {
            warn!(
                execution_id = versioned.record.id.get(),
                status = versioned.record.status.as_ref(),
                "Failing execution interrupted by restart"
            );
            self.finalize(
                versioned,
                ExecutionStatus::Failed,
                None,
                Some(ExecutionError::platform(
                    "interrupted by control-plane restart",
                )),
                None,
            )
            .await;
        }
        Ok(count)
    }

    fn gate(&self, function: &Function) -> Arc<Semaphore> {
        self.gates
            .entry(function.id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(function.max_concurrency)))
            .clone()
    }

    async fn drive(
        &self,
        mut versioned: Versioned<Execution>,
        function: Function,
        deadline: tokio::time::Instant,
    ) -> Versioned<Execution> {
        let labels = function_labels(&function.id);
        let _inflight = CounterGuard::new(function.id.get(), |label, delta| {
            self.metrics
                .inflight
                .add(delta, &[KeyValue::new("function", label.to_string())]);
        });

        let gate = self.gate(&function);
        let queue_timer = Timer::start(&self.metrics.queue_wait);
        let _permit = match tokio::time::timeout_at(deadline, gate.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return self
                    .finalize(
                        versioned,
                        ExecutionStatus::Failed,
                        None,
                        Some(ExecutionError::platform("concurrency gate closed")),
                        None,
                    )
                    .await;
            }
            Err(_) => {
                debug!(
                    execution_id = versioned.record.id.get(),
                    function_id = function.id.get(),
                    "Deadline expired while queued"
                );
                return self
                    .finalize(
                        versioned,
                        ExecutionStatus::TimedOut,
                        None,
                        Some(ExecutionError::timeout("deadline expired while queued")),
                        None,
                    )
                    .await;
            }
        };
        drop(queue_timer);

        let mut backoff = ExponentialBackoff::new(self.config.backoff_policy());
        let mut lease = match self.lease_instance(&function, deadline, &mut backoff).await {
            LeaseOutcome::Leased(lease) => lease,
            LeaseOutcome::DeadlineExpired(message) => {
                return self
                    .finalize(
                        versioned,
                        ExecutionStatus::TimedOut,
                        None,
                        Some(ExecutionError::timeout(message)),
                        None,
                    )
                    .await;
            }
            LeaseOutcome::Unavailable(message) => {
                return self
                    .finalize(
                        versioned,
                        ExecutionStatus::Failed,
                        None,
                        Some(ExecutionError::platform(message)),
                        None,
                    )
                    .await;
            }
        };

        versioned = match self
            .advance(versioned, |execution| {
                execution.status = ExecutionStatus::Dispatched;
                execution.instance_id = Some(lease.instance.id.clone());
            })
            .await
        {
            Ok(updated) => updated,
            Err(terminal) => {
                self.pool.release(lease).await;
                return terminal;
            }
        };
        versioned = match self
            .advance(versioned, |execution| {
                execution.status = ExecutionStatus::Running;
                execution.started_at = Some(get_epoch_time_in_ms());
            })
            .await
        {
            Ok(updated) => updated,
            Err(terminal) => {
                self.pool.release(lease).await;
                return terminal;
            }
        };

        let function_timeout = Duration::from_millis(function.timeout_ms);
        let mut attempt = 1;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let terminal = self
                    .finalize(
                        versioned,
                        ExecutionStatus::TimedOut,
                        None,
                        Some(ExecutionError::timeout("deadline expired before invocation")),
                        None,
                    )
                    .await;
                self.pool.release(lease).await;
                return terminal;
            }
            let invoke_timeout = remaining.min(function_timeout);
            let Some(endpoint) = lease.instance.endpoint.clone() else {
                let terminal = self
                    .finalize(
                        versioned,
                        ExecutionStatus::Failed,
                        None,
                        Some(ExecutionError::platform("leased instance has no endpoint")),
                        None,
                    )
                    .await;
                self.pool.report_failed(lease).await;
                return terminal;
            };
            let request = InvokeRequest {
                execution_id: versioned.record.id.clone(),
                function_id: function.id.clone(),
                code_url: function.code.url.clone(),
                resources: function.resources,
                input: versioned.record.input.clone(),
            };
            let invoke_timer = Timer::start(&self.metrics.invoke_latency);
            let result = self.client.invoke(&endpoint, request, invoke_timeout).await;
            drop(invoke_timer);

            match result {
                Ok(response) if response.success => {
                    let terminal = self
                        .finalize(
                            versioned,
                            ExecutionStatus::Succeeded,
                            Some(response.output),
                            None,
                            Some(response.logs),
                        )
                        .await;
                    self.pool.release(lease).await;
                    return terminal;
                }
                Ok(response) => {
                    let terminal = self
                        .finalize(
                            versioned,
                            ExecutionStatus::Failed,
                            Some(response.output),
                            Some(ExecutionError::function("function returned an error")),
                            Some(response.logs),
                        )
                        .await;
                    self.pool.release(lease).await;
                    return terminal;
                }
                Err(InvokeError::Timeout) => {
                    let message = if function_timeout <= remaining {
                        format!("function execution exceeded {}ms", function.timeout_ms)
                    } else {
                        "execution deadline expired mid-invoke".to_string()
                    };
                    let terminal = self
                        .finalize(
                            versioned,
                            ExecutionStatus::TimedOut,
                            None,
                            Some(ExecutionError::timeout(message)),
                            None,
                        )
                        .await;
                    // A handler that blew its budget may still be running;
                    // the instance cannot go back in the free list.
                    self.pool.report_failed(lease).await;
                    return terminal;
                }
                Err(InvokeError::Transport(message)) => {
                    if function.idempotent && attempt == 1 {
                        self.pool.report_failed(lease).await;
                        attempt += 1;
                        self.metrics.transport_retries.add(1, &labels);
                        warn!(
                            execution_id = versioned.record.id.get(),
                            "Transport failure, retrying on a fresh instance: {message}"
                        );
                        match self.lease_instance(&function, deadline, &mut backoff).await {
                            LeaseOutcome::Leased(next) => {
                                versioned = match self
                                    .advance(versioned, |execution| {
                                        execution.instance_id = Some(next.instance.id.clone());
                                    })
                                    .await
                                {
                                    Ok(updated) => updated,
                                    Err(terminal) => {
                                        self.pool.release(next).await;
                                        return terminal;
                                    }
                                };
                                lease = next;
                                continue;
                            }
                            LeaseOutcome::DeadlineExpired(message) => {
                                return self
                                    .finalize(
                                        versioned,
                                        ExecutionStatus::TimedOut,
                                        None,
                                        Some(ExecutionError::timeout(message)),
                                        None,
                                    )
                                    .await;
                            }
                            LeaseOutcome::Unavailable(message) => {
                                return self
                                    .finalize(
                                        versioned,
                                        ExecutionStatus::Failed,
                                        None,
                                        Some(ExecutionError::platform(message)),
                                        None,
                                    )
                                    .await;
                            }
                        }
                    }
                    let terminal = self
                        .finalize(
                            versioned,
                            ExecutionStatus::Failed,
                            None,
                            Some(ExecutionError::platform(format!(
                                "transport failure: {message}"
                            ))),
                            None,
                        )
                        .await;
                    self.pool.report_failed(lease).await;
                    return terminal;
                }
            }
        }
    }

    /// Leases an instance, backing off while the pool is at capacity.
    async fn lease_instance(
        &self,
        function: &Function,
        deadline: tokio::time::Instant,
        backoff: &mut ExponentialBackoff,
    ) -> LeaseOutcome {
        loop {
            match self.pool.acquire(&function.runtime_id, deadline).await {
                Ok(lease) => return LeaseOutcome::Leased(lease),
                Err(PoolError::NoCapacity(_)) => {
                    let delay = backoff.next_delay();
                    if tokio::time::Instant::now() + delay >= deadline {
                        return LeaseOutcome::DeadlineExpired(
                            "pool at capacity until the deadline".to_string(),
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(PoolError::WaitTimeout(_)) => {
                    return LeaseOutcome::DeadlineExpired(
                        "timed out waiting for an instance".to_string(),
                    );
                }
                Err(err) => return LeaseOutcome::Unavailable(err.to_string()),
            }
        }
    }

    /// Compare-and-swap progress update. If another writer got the record to
    /// a terminal status first, that record is returned as `Err` and must
    /// stand.
    async fn advance(
        &self,
        versioned: Versioned<Execution>,
        apply: impl FnOnce(&mut Execution),
    ) -> Result<Versioned<Execution>, Versioned<Execution>> {
        let mut record = versioned.record.clone();
        apply(&mut record);
        let mut expected = versioned.version;
        for _ in 0..3 {
            match self.store.update_execution(expected, record.clone()).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict { .. }) => {
                    match self.store.execution(&record.id).await {
                        Ok(Some(fresh)) if fresh.record.terminal_state() => return Err(fresh),
                        Ok(Some(fresh)) => expected = fresh.version,
                        Ok(None) | Err(_) => break,
                    }
                }
                Err(StoreError::Unavailable { .. }) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => break,
            }
        }
        // Progress markers are cosmetic; the terminal write self-corrects.
        warn!(
            execution_id = record.id.get(),
            "Could not record execution progress"
        );
        Ok(Versioned {
            record,
            version: expected,
        })
    }

    /// Writes the terminal status, broadcasts completion and returns the
    /// stored record. Losing a terminal race means adopting the winner's
    /// record.
    async fn finalize(
        &self,
        versioned: Versioned<Execution>,
        status: ExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<ExecutionError>,
        logs: Option<String>,
    ) -> Versioned<Execution> {
        if versioned.record.terminal_state() {
            return versioned;
        }
        let mut record = versioned.record.clone();
        record.status = status;
        if let Some(output) = output {
            record.output = Some(output);
        }
        if let Some(error) = error {
            record.error = Some(error);
        }
        if let Some(logs) = logs {
            record.logs = logs;
        }
        record.finished_at = Some(get_epoch_time_in_ms());

        let mut expected = versioned.version;
        let mut stored = None;
        for round in 0..5 {
            if round > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            match self.store.update_execution(expected, record.clone()).await {
                Ok(updated) => {
                    stored = Some(updated);
                    break;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    match self.store.execution(&record.id).await {
                        Ok(Some(fresh)) if fresh.record.terminal_state() => {
                            debug!(
                                execution_id = record.id.get(),
                                status = fresh.record.status.as_ref(),
                                "Already finalized elsewhere"
                            );
                            stored = Some(fresh);
                            break;
                        }
                        Ok(Some(fresh)) => expected = fresh.version,
                        Ok(None) => {
                            warn!(execution_id = record.id.get(), "Execution vanished");
                            break;
                        }
                        Err(_) => {}
                    }
                }
                Err(StoreError::Unavailable { reason }) => {
                    warn!(
                        execution_id = record.id.get(),
                        "Store unavailable while finalizing: {reason}"
                    );
                }
                Err(err) => {
                    error!(
                        execution_id = record.id.get(),
                        "Finalizing execution: {err:#}"
                    );
                    break;
                }
            }
        }
        let finalized = stored.unwrap_or(Versioned {
            record,
            version: versioned.version,
        });

        self.metrics.completions.add(
            1,
            &[
                KeyValue::new("function", finalized.record.function_id.get().to_string()),
                KeyValue::new("status", finalized.record.status.to_string()),
            ],
        );
        info!(
            execution_id = finalized.record.id.get(),
            status = finalized.record.status.as_ref(),
            "Execution finished"
        );
        let _ = self.finished_tx.send(ExecutionFinished {
            execution_id: finalized.record.id.clone(),
            function_id: finalized.record.function_id.clone(),
            job_id: finalized.record.job_id.clone(),
            status: finalized.record.status,
        });
        finalized
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_execution, mock_function, mock_runtime, TEST_RUNTIME_ID},
        FailureKind,
        PoolPolicy,
    };
    use serde_json::json;
    use state_store::InMemoryMetadataStore;

    use super::*;
    use crate::{
        driver::{
            memory::{MemoryDriver, MemoryDriverConfig},
            ClusterDriver,
        },
        instance_client::{StubCall, StubInstanceClient},
        pool::PoolManagerConfig,
    };

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        driver: Arc<MemoryDriver>,
        client: Arc<StubInstanceClient>,
        dispatcher: Arc<Dispatcher>,
    }

    async fn fixture(min_warm: usize, max_size: usize) -> Fixture {
        let store = Arc::new(InMemoryMetadataStore::new());
        let driver = Arc::new(MemoryDriver::new(MemoryDriverConfig::default()));
        let pool = PoolManager::new(driver.clone(), PoolManagerConfig::default());
        let client = Arc::new(StubInstanceClient::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            pool.clone(),
            client.clone(),
            DispatchConfig::default(),
        );
        let mut runtime = mock_runtime(TEST_RUNTIME_ID);
        runtime.pool = PoolPolicy {
            min_warm,
            max_size,
            idle_timeout_ms: 60_000,
        };
        store.create_runtime(runtime.clone()).await.unwrap();
        pool.register_runtime(runtime).await.unwrap();
        Fixture {
            store,
            driver,
            client,
            dispatcher,
        }
    }

    async fn add_function(
        fixture: &Fixture,
        name: &str,
        max_concurrency: usize,
        idempotent: bool,
    ) -> Function {
        let function = mock_function(name, max_concurrency, idempotent);
        fixture
            .store
            .create_function(function.clone())
            .await
            .unwrap();
        function
    }

    fn request(function: &Function, mode: SubmitMode) -> SubmitRequest {
        SubmitRequest {
            function_id: function.id.clone(),
            input: json!({"n": 1}),
            mode,
            deadline: None,
            job_id: None,
        }
    }

    async fn wait_finished(
        rx: &mut broadcast::Receiver<ExecutionFinished>,
        n: usize,
    ) -> Vec<ExecutionFinished> {
        let mut events = Vec::new();
        while events.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("timed out waiting for executions")
                .expect("finished channel closed");
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn sync_invocation_runs_to_success() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_echo", 2, false).await;

        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::Succeeded);
        assert_eq!(finished.record.output, Some(json!({"n": 1})));
        assert!(finished.record.instance_id.is_some());
        assert!(finished.record.started_at.is_some());
        assert!(finished.record.finished_at.is_some());

        let stored = fx
            .store
            .execution(&finished.record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, finished.record);
    }

    #[tokio::test(start_paused = true)]
    async fn function_errors_are_not_retried() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_boom", 2, true).await;
        fx.client
            .script(&function.id, vec![StubCall::function_error("boom")]);

        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::Failed);
        let error = finished.record.error.unwrap();
        assert_eq!(error.kind, FailureKind::Function);
        assert_eq!(finished.record.logs, "boom");
        // Even an idempotent function gets no second attempt for its own error.
        assert_eq!(fx.client.calls_for(&function.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_is_never_exceeded() {
        let fx = fixture(0, 4).await;
        let function = add_function(&fx, "fn_limited", 2, false).await;
        let calls = vec![
            StubCall::success(json!(1)).with_delay(Duration::from_millis(100)),
            StubCall::success(json!(2)).with_delay(Duration::from_millis(100)),
            StubCall::success(json!(3)).with_delay(Duration::from_millis(100)),
        ];
        fx.client.script(&function.id, calls);

        let mut finished_rx = fx.dispatcher.subscribe_finished();
        for _ in 0..3 {
            fx.dispatcher
                .submit(request(&function, SubmitMode::Async))
                .await
                .unwrap();
        }
        let events = wait_finished(&mut finished_rx, 3).await;
        assert!(events.iter().all(|e| e.status == ExecutionStatus::Succeeded));
        assert!(
            fx.client.peak_concurrency() <= 2,
            "peak concurrency {} exceeded the ceiling",
            fx.client.peak_concurrency()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_of_one_serializes_submissions() {
        let fx = fixture(0, 4).await;
        let function = add_function(&fx, "fn_serial", 1, false).await;
        fx.client.script(
            &function.id,
            vec![
                StubCall::success(json!(1)).with_delay(Duration::from_millis(50)),
                StubCall::success(json!(2)).with_delay(Duration::from_millis(50)),
            ],
        );

        let mut finished_rx = fx.dispatcher.subscribe_finished();
        for _ in 0..2 {
            fx.dispatcher
                .submit(request(&function, SubmitMode::Async))
                .await
                .unwrap();
        }
        let events = wait_finished(&mut finished_rx, 2).await;
        assert!(events.iter().all(|e| e.status == ExecutionStatus::Succeeded));
        assert_eq!(fx.client.peak_concurrency(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_retries_once_on_a_fresh_instance() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_retry", 2, true).await;
        fx.client.script(
            &function.id,
            vec![
                StubCall::transport("connection reset by peer"),
                StubCall::success(json!("second try")),
            ],
        );

        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::Succeeded);
        assert_eq!(finished.record.output, Some(json!("second try")));

        let calls = fx.client.calls_for(&function.id);
        assert_eq!(calls.len(), 2);
        assert_ne!(
            calls[0].endpoint, calls[1].endpoint,
            "retry must land on a different instance"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_fatal_for_non_idempotent_functions() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_fragile", 2, false).await;
        fx.client
            .script(&function.id, vec![StubCall::transport("connection reset")]);

        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::Failed);
        assert_eq!(finished.record.error.unwrap().kind, FailureKind::Platform);
        assert_eq!(fx.client.calls_for(&function.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out_and_instance_is_recycled() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_hang", 2, false).await;
        fx.client.script(
            &function.id,
            vec![StubCall::success(json!(1)).with_delay(Duration::from_secs(60))],
        );

        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::TimedOut);
        let error = finished.record.error.unwrap();
        assert_eq!(error.kind, FailureKind::Timeout);
        assert!(error.message.contains("5000ms"), "message: {}", error.message);

        // The instance that ran the hung handler was not returned to the
        // free list; its replacement has a different id.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let instances = fx
            .driver
            .list_instances(&function.runtime_id)
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert_ne!(Some(instances[0].id.clone()), finished.record.instance_id);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_submission_times_out_at_its_deadline() {
        let fx = fixture(0, 4).await;
        let function = add_function(&fx, "fn_queueing", 1, false).await;
        fx.client.script(
            &function.id,
            vec![StubCall::success(json!(1)).with_delay(Duration::from_secs(3))],
        );

        let mut finished_rx = fx.dispatcher.subscribe_finished();
        fx.dispatcher
            .submit(request(&function, SubmitMode::Async))
            .await
            .unwrap();

        let mut second = request(&function, SubmitMode::Sync);
        second.deadline = Some(Duration::from_millis(100));
        let finished = fx.dispatcher.submit(second).await.unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::TimedOut);
        assert!(finished
            .record
            .error
            .unwrap()
            .message
            .contains("while queued"));
        // The expired execution never reached an instance.
        assert_eq!(fx.client.calls_for(&function.id).len(), 1);

        let events = wait_finished(&mut finished_rx, 2).await;
        assert!(events.iter().any(|e| e.status == ExecutionStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out_after_backoff() {
        let fx = fixture(0, 1).await;
        let blocker = add_function(&fx, "fn_blocker", 1, false).await;
        let starved = add_function(&fx, "fn_starved", 1, false).await;
        fx.client.script(
            &blocker.id,
            vec![StubCall::success(json!(1)).with_delay(Duration::from_secs(5))],
        );

        fx.dispatcher
            .submit(request(&blocker, SubmitMode::Async))
            .await
            .unwrap();
        // Let the blocker claim the only instance before contending.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut contended = request(&starved, SubmitMode::Sync);
        contended.deadline = Some(Duration::from_millis(400));
        let finished = fx.dispatcher.submit(contended).await.unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::TimedOut);
        assert!(fx.client.calls_for(&starved.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_fails_interrupted_executions() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_orphan", 2, false).await;
        let execution = mock_execution(&function);
        let stored = fx.store.create_execution(execution).await.unwrap();

        let recovered = fx.dispatcher.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let after = fx
            .store
            .execution(&stored.record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.record.status, ExecutionStatus::Failed);
        assert_eq!(after.record.error.unwrap().kind, FailureKind::Platform);

        // A second pass finds nothing left to fail.
        assert_eq!(fx.dispatcher.recover().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_executions_stay_finished() {
        let fx = fixture(0, 2).await;
        let function = add_function(&fx, "fn_done", 2, false).await;
        let finished = fx
            .dispatcher
            .submit(request(&function, SubmitMode::Sync))
            .await
            .unwrap();
        assert_eq!(finished.record.status, ExecutionStatus::Succeeded);

        // Recovery scans must not touch records that already finished.
        fx.dispatcher.recover().await.unwrap();
        let after = fx
            .store
            .execution(&finished.record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.record.status, ExecutionStatus::Succeeded);
        assert_eq!(after.version, finished.version);
    }
}
