use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use data_model::{Instance, InstanceId, InstanceState, RuntimeId, TerminationReason};
use futures::StreamExt;
use kiln_utils::get_epoch_time_in_ms;
use metrics::{pool_stats, Timer};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{ClusterDriver, DriverError, HealthStream, InstanceStatusEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolManagerConfig {
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_reconcile_interval_ms() -> u64 {
    2000
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool for runtime {0} is at capacity")]
    NoCapacity(RuntimeId),

    #[error("timed out waiting for an instance of runtime {0}")]
    WaitTimeout(RuntimeId),

    #[error("runtime {0} has no registered pool")]
    UnknownRuntime(RuntimeId),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Exclusive use of one Ready instance. Must be handed back with
/// [`PoolManager::release`] or [`PoolManager::report_failed`].
#[derive(Debug)]
pub struct InstanceLease {
    pub instance: Instance,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub runtime_id: RuntimeId,
    pub free: usize,
    pub busy: usize,
    pub provisioning: usize,
    pub desired: usize,
    pub min_warm: usize,
    pub max_size: usize,
}

struct IdleInstance {
    instance: Instance,
    idle_since: tokio::time::Instant,
}

struct PoolState {
    runtime: data_model::Runtime,
    free: VecDeque<IdleInstance>,
    busy: HashMap<InstanceId, Instance>,
    provisioning: HashSet<InstanceId>,
    desired: usize,
}

impl PoolState {
    fn live(&self) -> usize {
        self.free.len() + self.busy.len() + self.provisioning.len()
    }
}

struct PoolEntry {
    state: Mutex<PoolState>,
    ready: Notify,
    stop: CancellationToken,
    waiting: AtomicUsize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Warm-capacity bookkeeping over a [`ClusterDriver`].
///
/// One entry per runtime tracks free, busy and provisioning instances plus a
/// desired size. Acquire hands out the longest-idle free instance first and
/// cold-boots when the pool can still grow; a per-pool watcher folds driver
/// health events back into the books and periodically evicts instances idle
/// past the policy timeout. All scale-down goes through explicit instance
/// termination here; drivers only ever grow.
pub struct PoolManager {
    driver: Arc<dyn ClusterDriver>,
    pools: DashMap<RuntimeId, Arc<PoolEntry>>,
    metrics: pool_stats::Metrics,
    reconcile_interval: Duration,
}

fn runtime_labels(runtime_id: &RuntimeId) -> [KeyValue; 1] {
    [KeyValue::new("runtime", runtime_id.get().to_string())]
}

impl PoolManager {
    pub fn new(driver: Arc<dyn ClusterDriver>, config: PoolManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            driver,
            pools: DashMap::new(),
            metrics: pool_stats::Metrics::new(),
            reconcile_interval: Duration::from_millis(config.reconcile_interval_ms),
        })
    }

    fn entry(&self, runtime_id: &RuntimeId) -> Result<Arc<PoolEntry>, PoolError> {
        self.pools
            .get(runtime_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PoolError::UnknownRuntime(runtime_id.clone()))
    }

    /// Registers a pool for the runtime and pre-warms it to `min_warm`.
    /// Instances the driver already runs for this runtime are adopted.
    pub async fn register_runtime(
        self: &Arc<Self>,
        runtime: data_model::Runtime,
    ) -> Result<(), PoolError> {
        if self.pools.contains_key(&runtime.id) {
            return self.update_runtime(runtime).await;
        }
        let handle = self.driver.ensure_pool(&runtime).await?;
        let labels = runtime_labels(&runtime.id);

        let mut state = PoolState {
            runtime: runtime.clone(),
            free: VecDeque::new(),
            busy: HashMap::new(),
            provisioning: HashSet::new(),
            desired: runtime.pool.min_warm,
        };
        for instance in self.driver.list_instances(&runtime.id).await? {
            match instance.state {
                InstanceState::Ready => {
                    state.free.push_back(IdleInstance {
                        instance,
                        idle_since: tokio::time::Instant::now(),
                    });
                }
                InstanceState::Provisioning => {
                    state.provisioning.insert(instance.id.clone());
                }
                _ => {}
            }
        }
        self.metrics
            .ready_instances
            .add(state.free.len() as i64, &labels);
        state.desired = state.desired.max(state.live());
        let scale_to = (state.live() < state.desired).then_some(state.desired);

        let entry = Arc::new(PoolEntry {
            state: Mutex::new(state),
            ready: Notify::new(),
            stop: CancellationToken::new(),
            waiting: AtomicUsize::new(0),
        });
        self.pools.insert(runtime.id.clone(), entry.clone());
        if let Some(desired) = scale_to {
            self.driver.scale(&runtime.id, desired).await?;
        }
        self.spawn_watcher(runtime.id.clone(), entry, handle.resume_from);
        info!(
            runtime_id = runtime.id.get(),
            min_warm = runtime.pool.min_warm,
            max_size = runtime.pool.max_size,
            "Registered runtime pool"
        );
        Ok(())
    }

    /// Applies a new runtime template and policy. Running instances keep the
    /// old image until they are recycled; a raised `min_warm` is topped up
    /// right away.
    pub async fn update_runtime(&self, runtime: data_model::Runtime) -> Result<(), PoolError> {
        let entry = self.entry(&runtime.id)?;
        self.driver.ensure_pool(&runtime).await?;
        let scale_to = {
            let mut state = entry.state.lock().await;
            state.runtime = runtime.clone();
            if state.desired < runtime.pool.min_warm {
                state.desired = runtime.pool.min_warm;
            }
            (state.live() < state.desired).then_some(state.desired)
        };
        if let Some(desired) = scale_to {
            self.driver.scale(&runtime.id, desired).await?;
        }
        Ok(())
    }

    pub async fn deregister_runtime(&self, runtime_id: &RuntimeId) -> Result<(), PoolError> {
        let Some((_, entry)) = self.pools.remove(runtime_id) else {
            return Err(PoolError::UnknownRuntime(runtime_id.clone()));
        };
        entry.stop.cancel();
        let labels = runtime_labels(runtime_id);
        {
            let state = entry.state.lock().await;
            self.metrics
                .ready_instances
                .add(-(state.free.len() as i64), &labels);
            self.metrics
                .busy_instances
                .add(-(state.busy.len() as i64), &labels);
        }
        self.driver.remove_pool(runtime_id).await?;
        info!(runtime_id = runtime_id.get(), "Deregistered runtime pool");
        Ok(())
    }

    /// Leases an instance, preferring the longest-idle free one. Cold-boots
    /// when the pool can still grow and blocks until an instance is Ready or
    /// `deadline` passes. Fails fast with [`PoolError::NoCapacity`] when the
    /// pool is at `max_size` with every instance busy.
    pub async fn acquire(
        &self,
        runtime_id: &RuntimeId,
        deadline: tokio::time::Instant,
    ) -> Result<InstanceLease, PoolError> {
        let entry = self.entry(runtime_id)?;
        let labels = runtime_labels(runtime_id);
        let _slot_timer = Timer::start(&self.metrics.slot_wait);
        entry.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&entry.waiting);

        loop {
            let notified = entry.ready.notified();
            let scale_to = {
                let mut state = entry.state.lock().await;
                if let Some(idle) = state.free.pop_front() {
                    let mut instance = idle.instance;
                    instance.state = InstanceState::Busy;
                    state.busy.insert(instance.id.clone(), instance.clone());
                    drop(state);
                    self.metrics.ready_instances.add(-1, &labels);
                    self.metrics.busy_instances.add(1, &labels);
                    debug!(
                        runtime_id = runtime_id.get(),
                        instance_id = instance.id.get(),
                        "Leased instance"
                    );
                    return Ok(InstanceLease { instance });
                }
                let policy = state.runtime.pool.clone();
                if state.live() >= policy.max_size && state.provisioning.is_empty() {
                    debug!(
                        runtime_id = runtime_id.get(),
                        max_size = policy.max_size,
                        "Pool exhausted"
                    );
                    return Err(PoolError::NoCapacity(runtime_id.clone()));
                }
                // Every waiter needs an instance on top of the leased ones.
                let demand = state.busy.len() + entry.waiting.load(Ordering::SeqCst);
                let target = demand.min(policy.max_size);
                if target > state.desired {
                    state.desired = target;
                    Some(target)
                } else {
                    None
                }
            };
            if let Some(desired) = scale_to {
                self.driver.scale(runtime_id, desired).await?;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::WaitTimeout(runtime_id.clone()));
                }
            }
        }
    }

    /// Returns a healthy instance to the pool. Its idle clock restarts.
    pub async fn release(&self, lease: InstanceLease) {
        let runtime_id = lease.instance.runtime_id.clone();
        let Ok(entry) = self.entry(&runtime_id) else {
            // Pool deregistered while the lease was out; the driver already
            // tore the instance down.
            return;
        };
        let labels = runtime_labels(&runtime_id);
        {
            let mut state = entry.state.lock().await;
            let Some(mut instance) = state.busy.remove(&lease.instance.id) else {
                // Died mid-lease; the health event already settled the books.
                return;
            };
            instance.state = InstanceState::Ready;
            state.free.push_back(IdleInstance {
                instance,
                idle_since: tokio::time::Instant::now(),
            });
        }
        self.metrics.busy_instances.add(-1, &labels);
        self.metrics.ready_instances.add(1, &labels);
        entry.ready.notify_one();
    }

    /// Reports a leased instance as broken. It is terminated and replaced
    /// rather than returned to the free list.
    pub async fn report_failed(&self, lease: InstanceLease) {
        let runtime_id = lease.instance.runtime_id.clone();
        let instance_id = lease.instance.id.clone();
        warn!(
            runtime_id = runtime_id.get(),
            instance_id = instance_id.get(),
            "Leased instance reported failed, replacing"
        );
        let labels = runtime_labels(&runtime_id);
        let Ok(entry) = self.entry(&runtime_id) else {
            let _ = self
                .driver
                .terminate_instance(&instance_id, TerminationReason::Unhealthy)
                .await;
            return;
        };
        let was_busy = {
            let mut state = entry.state.lock().await;
            state.busy.remove(&instance_id).is_some()
        };
        if was_busy {
            self.metrics.busy_instances.add(-1, &labels);
        }
        match self
            .driver
            .terminate_instance(&instance_id, TerminationReason::Unhealthy)
            .await
        {
            Ok(()) | Err(DriverError::UnknownInstance(_)) => {}
            Err(err) => warn!(
                instance_id = instance_id.get(),
                "Terminating failed instance: {err:#}"
            ),
        }
        self.metrics.failures_replaced.add(1, &labels);
        let scale_to = {
            let state = entry.state.lock().await;
            (state.live() < state.desired).then_some(state.desired)
        };
        if let Some(desired) = scale_to {
            if let Err(err) = self.driver.scale(&runtime_id, desired).await {
                warn!(
                    runtime_id = runtime_id.get(),
                    "Replacing failed instance: {err:#}"
                );
            }
        }
    }

    /// Raises the desired pool size by `count`, clamped to `max_size`.
    pub async fn scale_up(&self, runtime_id: &RuntimeId, count: usize) -> Result<usize, PoolError> {
        let entry = self.entry(runtime_id)?;
        let (desired, scale_to) = {
            let mut state = entry.state.lock().await;
            let max_size = state.runtime.pool.max_size;
            let live = state.live();
            state.desired = state.desired.max(live).saturating_add(count).min(max_size);
            (
                state.desired,
                (live < state.desired).then_some(state.desired),
            )
        };
        if let Some(target) = scale_to {
            self.driver.scale(runtime_id, target).await?;
        }
        Ok(desired)
    }

    /// Evicts up to `count` free instances, never dropping the pool below
    /// `min_warm`. Busy instances are untouched. Returns how many went.
    pub async fn scale_down(
        &self,
        runtime_id: &RuntimeId,
        count: usize,
    ) -> Result<usize, PoolError> {
        let entry = self.entry(runtime_id)?;
        let victims = {
            let mut state = entry.state.lock().await;
            let min_warm = state.runtime.pool.min_warm;
            let mut victims = Vec::new();
            while victims.len() < count && state.live() > min_warm {
                match state.free.pop_front() {
                    Some(idle) => victims.push(idle.instance),
                    None => break,
                }
            }
            state.desired = state.live().max(min_warm);
            victims
        };
        self.evict(runtime_id, &victims).await;
        Ok(victims.len())
    }

    pub async fn snapshot(&self, runtime_id: &RuntimeId) -> Result<PoolSnapshot, PoolError> {
        let entry = self.entry(runtime_id)?;
        let state = entry.state.lock().await;
        Ok(PoolSnapshot {
            runtime_id: runtime_id.clone(),
            free: state.free.len(),
            busy: state.busy.len(),
            provisioning: state.provisioning.len(),
            desired: state.desired,
            min_warm: state.runtime.pool.min_warm,
            max_size: state.runtime.pool.max_size,
        })
    }

    /// One maintenance pass: evict instances idle past the policy timeout
    /// (down to `min_warm`) and top the pool back up toward its desired
    /// size. The pool watcher runs this on an interval.
    pub async fn reconcile(&self, runtime_id: &RuntimeId) -> Result<(), PoolError> {
        let entry = self.entry(runtime_id)?;
        let now = tokio::time::Instant::now();
        let (victims, scale_to) = {
            let mut state = entry.state.lock().await;
            let policy = state.runtime.pool.clone();
            let idle_timeout = Duration::from_millis(policy.idle_timeout_ms);
            let mut victims = Vec::new();
            loop {
                if state.live() <= policy.min_warm {
                    break;
                }
                let expired = state
                    .free
                    .front()
                    .map(|idle| now.duration_since(idle.idle_since) >= idle_timeout)
                    .unwrap_or(false);
                if !expired {
                    break;
                }
                if let Some(idle) = state.free.pop_front() {
                    victims.push(idle.instance);
                }
            }
            state.desired = state
                .desired
                .saturating_sub(victims.len())
                .max(policy.min_warm);
            let scale_to = (state.live() < state.desired).then_some(state.desired);
            (victims, scale_to)
        };
        self.evict(runtime_id, &victims).await;
        if let Some(desired) = scale_to {
            self.driver.scale(runtime_id, desired).await?;
        }
        Ok(())
    }

    async fn evict(&self, runtime_id: &RuntimeId, victims: &[Instance]) {
        if victims.is_empty() {
            return;
        }
        let labels = runtime_labels(runtime_id);
        self.metrics
            .ready_instances
            .add(-(victims.len() as i64), &labels);
        self.metrics.evictions.add(victims.len() as u64, &labels);
        for victim in victims {
            debug!(
                runtime_id = runtime_id.get(),
                instance_id = victim.id.get(),
                "Evicting idle instance"
            );
            match self
                .driver
                .terminate_instance(&victim.id, TerminationReason::Evicted)
                .await
            {
                Ok(()) | Err(DriverError::UnknownInstance(_)) => {}
                Err(err) => warn!(
                    instance_id = victim.id.get(),
                    "Evicting instance: {err:#}"
                ),
            }
        }
    }

    /// Cancels every pool watcher. Instances are left to the driver's own
    /// teardown.
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().stop.cancel();
        }
    }

    fn spawn_watcher(self: &Arc<Self>, runtime_id: RuntimeId, entry: Arc<PoolEntry>, resume: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reconcile_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut health = match manager.driver.watch_health(&runtime_id, resume) {
                Ok(stream) => stream,
                Err(err) => {
                    error!(
                        runtime_id = runtime_id.get(),
                        "Starting pool watch: {err:#}"
                    );
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = entry.stop.cancelled() => {
                        debug!(runtime_id = runtime_id.get(), "Pool watcher stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        match manager.reconcile(&runtime_id).await {
                            Ok(()) => {}
                            Err(PoolError::UnknownRuntime(_)) => return,
                            Err(err) => warn!(
                                runtime_id = runtime_id.get(),
                                "Pool reconcile failed: {err:#}"
                            ),
                        }
                    }
                    event = health.next() => match event {
                        Some(event) => manager.apply_event(&entry, event).await,
                        None => {
                            // Watch lagged out of the replay window or the
                            // feed closed. Rebuild from a fresh listing.
                            match manager.resync(&runtime_id, &entry).await {
                                Ok(stream) => health = stream,
                                Err(err) => {
                                    debug!(
                                        runtime_id = runtime_id.get(),
                                        "Pool watch ended: {err:#}"
                                    );
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    async fn apply_event(&self, entry: &PoolEntry, event: InstanceStatusEvent) {
        let runtime_id = event.runtime_id.clone();
        let labels = runtime_labels(&runtime_id);
        match event.state {
            InstanceState::Provisioning => {
                let mut state = entry.state.lock().await;
                let known = state.busy.contains_key(&event.instance_id)
                    || state
                        .free
                        .iter()
                        .any(|idle| idle.instance.id == event.instance_id);
                if !known && state.provisioning.insert(event.instance_id.clone()) {
                    drop(state);
                    self.metrics.cold_boots.add(1, &labels);
                }
            }
            InstanceState::Ready => {
                let mut state = entry.state.lock().await;
                state.provisioning.remove(&event.instance_id);
                let known = state.busy.contains_key(&event.instance_id)
                    || state
                        .free
                        .iter()
                        .any(|idle| idle.instance.id == event.instance_id);
                if known {
                    return;
                }
                let instance = Instance {
                    id: event.instance_id.clone(),
                    runtime_id: runtime_id.clone(),
                    state: InstanceState::Ready,
                    endpoint: event.endpoint.clone(),
                    created_at: get_epoch_time_in_ms(),
                };
                state.free.push_back(IdleInstance {
                    instance,
                    idle_since: tokio::time::Instant::now(),
                });
                drop(state);
                self.metrics.ready_instances.add(1, &labels);
                entry.ready.notify_one();
                debug!(
                    runtime_id = runtime_id.get(),
                    instance_id = event.instance_id.get(),
                    "Instance ready"
                );
            }
            InstanceState::Busy | InstanceState::Draining => {}
            InstanceState::Terminated { reason } => {
                let scale_to = {
                    let mut state = entry.state.lock().await;
                    let id = &event.instance_id;
                    let mut accounted = true;
                    if state.provisioning.remove(id) {
                    } else if let Some(pos) = state
                        .free
                        .iter()
                        .position(|idle| idle.instance.id == *id)
                    {
                        state.free.remove(pos);
                        self.metrics.ready_instances.add(-1, &labels);
                    } else if state.busy.remove(id).is_some() {
                        self.metrics.busy_instances.add(-1, &labels);
                    } else {
                        // An eviction or replacement this pool initiated;
                        // the books were settled when it was decided.
                        accounted = false;
                    }
                    // Provision failures are retried by the periodic
                    // reconcile pass so a broken template cannot spin.
                    let replace_now = accounted
                        && !matches!(
                            reason,
                            TerminationReason::Evicted
                                | TerminationReason::ProvisionFailed
                                | TerminationReason::RuntimeRemoved
                        );
                    (replace_now && state.live() < state.desired).then_some(state.desired)
                };
                if reason == TerminationReason::ProvisionFailed {
                    warn!(
                        runtime_id = runtime_id.get(),
                        instance_id = event.instance_id.get(),
                        failure = event.failure.as_deref().unwrap_or("unknown"),
                        "Instance failed to provision"
                    );
                }
                if let Some(desired) = scale_to {
                    debug!(
                        runtime_id = runtime_id.get(),
                        instance_id = event.instance_id.get(),
                        reason = reason.as_ref(),
                        "Replacing dead instance"
                    );
                    if let Err(err) = self.driver.scale(&runtime_id, desired).await {
                        warn!(
                            runtime_id = runtime_id.get(),
                            "Replacing dead instance: {err:#}"
                        );
                    }
                }
            }
        }
    }

    /// Rebuilds pool state from an authoritative driver listing and opens a
    /// fresh watch.
    async fn resync(
        &self,
        runtime_id: &RuntimeId,
        entry: &PoolEntry,
    ) -> Result<HealthStream, PoolError> {
        if !self.pools.contains_key(runtime_id) {
            return Err(PoolError::UnknownRuntime(runtime_id.clone()));
        }
        let runtime = entry.state.lock().await.runtime.clone();
        let handle = self.driver.ensure_pool(&runtime).await?;
        let instances = self.driver.list_instances(runtime_id).await?;
        let labels = runtime_labels(runtime_id);
        let freed = {
            let mut state = entry.state.lock().await;
            let ready_before = state.free.len() as i64;
            let busy_before = state.busy.len() as i64;
            state.free.clear();
            state.provisioning.clear();
            let listed: HashSet<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
            state.busy.retain(|id, _| listed.contains(id));
            for instance in instances {
                if state.busy.contains_key(&instance.id) {
                    continue;
                }
                match instance.state {
                    InstanceState::Ready => {
                        state.free.push_back(IdleInstance {
                            instance,
                            idle_since: tokio::time::Instant::now(),
                        });
                    }
                    InstanceState::Provisioning => {
                        state.provisioning.insert(instance.id.clone());
                    }
                    _ => {}
                }
            }
            self.metrics
                .ready_instances
                .add(state.free.len() as i64 - ready_before, &labels);
            self.metrics
                .busy_instances
                .add(state.busy.len() as i64 - busy_before, &labels);
            state.free.len()
        };
        for _ in 0..freed {
            entry.ready.notify_one();
        }
        info!(
            runtime_id = runtime_id.get(),
            resume_from = handle.resume_from,
            "Resynced pool from driver listing"
        );
        Ok(self.driver.watch_health(runtime_id, handle.resume_from)?)
    }
}
