pub mod feed;
pub mod memory;
pub mod process;

use std::pin::Pin;

use async_trait::async_trait;
use data_model::{Instance, InstanceId, InstanceState, Runtime, RuntimeId};
use futures::Stream;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("runtime {0} has no registered pool")]
    UnknownRuntime(RuntimeId),

    #[error("instance {0} is not managed by this driver")]
    UnknownInstance(InstanceId),

    #[error("provisioning failed: {reason}")]
    ProvisionFailure { reason: String },

    #[error("health events before seq {oldest} were discarded, resubscribe from {latest}")]
    ResumeWindowExceeded { oldest: u64, latest: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A single observation of an instance changing state. Events for one pool
/// carry strictly increasing sequence numbers so a consumer can resume a
/// watch without missing transitions. Provisioning failures arrive as
/// `Terminated` events with `failure` set, never as errors from scale calls.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatusEvent {
    pub seq: u64,
    pub runtime_id: RuntimeId,
    pub instance_id: InstanceId,
    pub state: InstanceState,
    pub endpoint: Option<String>,
    pub failure: Option<String>,
}

pub type HealthStream = Pin<Box<dyn Stream<Item = InstanceStatusEvent> + Send>>;

/// Returned by [`ClusterDriver::ensure_pool`]. `resume_from` is the latest
/// sequence number already assigned for the pool; a watch started with it
/// sees every event published after the registration.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    pub runtime_id: RuntimeId,
    pub resume_from: u64,
}

/// Where instances actually run. Drivers own process or container lifecycles
/// and report every state change on the pool's health feed. They never decide
/// *when* capacity changes: scaling up happens via [`scale`](Self::scale) and
/// scaling down only via explicit [`terminate_instance`](Self::terminate_instance)
/// calls from the pool layer.
#[async_trait]
pub trait ClusterDriver: Send + Sync + 'static {
    /// Registers a pool for `runtime`, or updates the template of an existing
    /// one. Idempotent. Instances already running keep their original image
    /// until they are recycled.
    async fn ensure_pool(&self, runtime: &Runtime) -> Result<PoolHandle, DriverError>;

    /// Raises the pool toward `desired` total live instances by provisioning
    /// the difference. A `desired` at or below the current live count is a
    /// no-op. Boots are asynchronous; progress arrives on the health feed.
    async fn scale(&self, runtime_id: &RuntimeId, desired: usize) -> Result<(), DriverError>;

    /// Tears down one instance. The terminal event carries `reason`.
    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        reason: data_model::TerminationReason,
    ) -> Result<(), DriverError>;

    /// The instance's invocation address, or None while it is still booting.
    async fn instance_endpoint(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<String>, DriverError>;

    /// Instances the driver currently manages for the pool, terminated ones
    /// excluded. Used to reconcile after a watch falls behind.
    async fn list_instances(&self, runtime_id: &RuntimeId) -> Result<Vec<Instance>, DriverError>;

    /// Streams state changes with `seq` greater than `after_seq`. Fails with
    /// [`DriverError::ResumeWindowExceeded`] when those events are no longer
    /// retained; the stream ends early if the watcher falls behind later, and
    /// the caller is expected to re-list and resubscribe.
    fn watch_health(
        &self,
        runtime_id: &RuntimeId,
        after_seq: u64,
    ) -> Result<HealthStream, DriverError>;

    /// Terminates every instance in the pool and forgets it.
    async fn remove_pool(&self, runtime_id: &RuntimeId) -> Result<(), DriverError>;
}
