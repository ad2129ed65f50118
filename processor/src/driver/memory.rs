use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use data_model::{Instance, InstanceId, InstanceState, Runtime, RuntimeId, TerminationReason};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{feed::HealthFeed, ClusterDriver, DriverError, HealthStream, PoolHandle};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDriverConfig {
    /// Simulated boot time for a provisioned instance.
    #[serde(default = "default_boot_delay_ms")]
    pub boot_delay_ms: u64,
}

fn default_boot_delay_ms() -> u64 {
    25
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: default_boot_delay_ms(),
        }
    }
}

struct MemoryPool {
    feed: HealthFeed,
    instances: Mutex<HashMap<InstanceId, Instance>>,
    fail_next: AtomicUsize,
}

/// Driver that fakes instances in memory. Boots complete after a configurable
/// delay and every transition flows through the same health feed the real
/// drivers use, which makes it the backend for tests and local development.
pub struct MemoryDriver {
    pools: DashMap<RuntimeId, Arc<MemoryPool>>,
    boot_delay: Duration,
}

impl MemoryDriver {
    pub fn new(config: MemoryDriverConfig) -> Self {
        Self {
            pools: DashMap::new(),
            boot_delay: Duration::from_millis(config.boot_delay_ms),
        }
    }

    /// The next `count` provisioning attempts for `runtime_id` fail instead
    /// of reaching Ready.
    pub fn fail_next_provisions(&self, runtime_id: &RuntimeId, count: usize) {
        if let Some(pool) = self.pools.get(runtime_id) {
            pool.fail_next.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Simulates an instance dying underneath the control plane.
    pub async fn kill_instance(&self, instance_id: &InstanceId) -> Result<(), DriverError> {
        self.terminate_instance(instance_id, TerminationReason::Crashed)
            .await
    }

    fn pool(&self, runtime_id: &RuntimeId) -> Result<Arc<MemoryPool>, DriverError> {
        self.pools
            .get(runtime_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DriverError::UnknownRuntime(runtime_id.clone()))
    }

    fn spawn_boot(&self, pool: Arc<MemoryPool>, instance_id: InstanceId, fail: bool) {
        let delay = self.boot_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut instances = pool.instances.lock().await;
            match instances.get(&instance_id) {
                Some(instance) if instance.state == InstanceState::Provisioning => {}
                // Terminated while provisioning, nothing to finish.
                _ => return,
            }
            if fail {
                instances.remove(&instance_id);
                pool.feed
                    .publish_provision_failure(instance_id, "injected provision failure".to_string());
                return;
            }
            let endpoint = format!("mem://{instance_id}");
            if let Some(instance) = instances.get_mut(&instance_id) {
                instance.state = InstanceState::Ready;
                instance.endpoint = Some(endpoint.clone());
            }
            pool.feed
                .publish(instance_id, InstanceState::Ready, Some(endpoint));
        });
    }
}

#[async_trait]
impl ClusterDriver for MemoryDriver {
    async fn ensure_pool(&self, runtime: &Runtime) -> Result<PoolHandle, DriverError> {
        let pool = self
            .pools
            .entry(runtime.id.clone())
            .or_insert_with(|| {
                Arc::new(MemoryPool {
                    feed: HealthFeed::new(runtime.id.clone()),
                    instances: Mutex::new(HashMap::new()),
                    fail_next: AtomicUsize::new(0),
                })
            })
            .clone();
        Ok(PoolHandle {
            runtime_id: runtime.id.clone(),
            resume_from: pool.feed.latest_seq(),
        })
    }

    async fn scale(&self, runtime_id: &RuntimeId, desired: usize) -> Result<(), DriverError> {
        let pool = self.pool(runtime_id)?;
        let mut boots = Vec::new();
        {
            let mut instances = pool.instances.lock().await;
            while instances.len() < desired {
                let instance = Instance::new(runtime_id.clone());
                let fail = pool
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                pool.feed
                    .publish(instance.id.clone(), InstanceState::Provisioning, None);
                boots.push((instance.id.clone(), fail));
                instances.insert(instance.id.clone(), instance);
            }
        }
        for (instance_id, fail) in boots {
            debug!(
                runtime_id = runtime_id.get(),
                instance_id = instance_id.get(),
                "Provisioning instance"
            );
            self.spawn_boot(pool.clone(), instance_id, fail);
        }
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        reason: TerminationReason,
    ) -> Result<(), DriverError> {
        for entry in self.pools.iter() {
            let mut instances = entry.value().instances.lock().await;
            if instances.remove(instance_id).is_some() {
                entry.value().feed.publish(
                    instance_id.clone(),
                    InstanceState::Terminated { reason },
                    None,
                );
                return Ok(());
            }
        }
        Err(DriverError::UnknownInstance(instance_id.clone()))
    }

    async fn instance_endpoint(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<String>, DriverError> {
        for entry in self.pools.iter() {
            let instances = entry.value().instances.lock().await;
            if let Some(instance) = instances.get(instance_id) {
                return Ok(instance.endpoint.clone());
            }
        }
        Err(DriverError::UnknownInstance(instance_id.clone()))
    }

    async fn list_instances(&self, runtime_id: &RuntimeId) -> Result<Vec<Instance>, DriverError> {
        let pool = self.pool(runtime_id)?;
        let instances = pool.instances.lock().await;
        Ok(instances.values().cloned().collect())
    }

    fn watch_health(
        &self,
        runtime_id: &RuntimeId,
        after_seq: u64,
    ) -> Result<HealthStream, DriverError> {
        let pool = self.pool(runtime_id)?;
        pool.feed.subscribe(after_seq)
    }

    async fn remove_pool(&self, runtime_id: &RuntimeId) -> Result<(), DriverError> {
        let Some((_, pool)) = self.pools.remove(runtime_id) else {
            return Err(DriverError::UnknownRuntime(runtime_id.clone()));
        };
        let mut instances = pool.instances.lock().await;
        for (instance_id, _) in instances.drain() {
            pool.feed.publish(
                instance_id,
                InstanceState::Terminated {
                    reason: TerminationReason::RuntimeRemoved,
                },
                None,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_runtime;
    use futures::StreamExt;

    use super::*;

    async fn ready_instances(driver: &MemoryDriver, runtime_id: &RuntimeId) -> usize {
        driver
            .list_instances(runtime_id)
            .await
            .unwrap()
            .iter()
            .filter(|i| i.state == InstanceState::Ready)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn scale_boots_instances_through_provisioning() {
        let runtime = mock_runtime("rt_mem");
        let driver = MemoryDriver::new(MemoryDriverConfig::default());
        let handle = driver.ensure_pool(&runtime).await.unwrap();
        let mut health = driver.watch_health(&runtime.id, handle.resume_from).unwrap();

        driver.scale(&runtime.id, 2).await.unwrap();
        assert_eq!(health.next().await.unwrap().state, InstanceState::Provisioning);
        assert_eq!(health.next().await.unwrap().state, InstanceState::Provisioning);

        let ready = health.next().await.unwrap();
        assert_eq!(ready.state, InstanceState::Ready);
        assert!(ready.endpoint.unwrap().starts_with("mem://rt_mem-"));
        assert_eq!(health.next().await.unwrap().state, InstanceState::Ready);
        assert_eq!(ready_instances(&driver, &runtime.id).await, 2);

        // Scaling to a desired at or below the live count changes nothing.
        driver.scale(&runtime.id, 1).await.unwrap();
        assert_eq!(driver.list_instances(&runtime.id).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_provision_failure_reaches_the_feed() {
        let runtime = mock_runtime("rt_mem");
        let driver = MemoryDriver::new(MemoryDriverConfig::default());
        let handle = driver.ensure_pool(&runtime).await.unwrap();
        driver.fail_next_provisions(&runtime.id, 1);
        let mut health = driver.watch_health(&runtime.id, handle.resume_from).unwrap();

        driver.scale(&runtime.id, 1).await.unwrap();
        assert_eq!(health.next().await.unwrap().state, InstanceState::Provisioning);
        let event = health.next().await.unwrap();
        assert_eq!(
            event.state,
            InstanceState::Terminated {
                reason: TerminationReason::ProvisionFailed
            }
        );
        assert!(event.failure.is_some());
        assert!(driver.list_instances(&runtime.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_is_unknown_until_the_instance_is_ready() {
        let runtime = mock_runtime("rt_mem");
        let driver = MemoryDriver::new(MemoryDriverConfig::default());
        driver.ensure_pool(&runtime).await.unwrap();
        driver.scale(&runtime.id, 1).await.unwrap();

        let booting = driver.list_instances(&runtime.id).await.unwrap().remove(0);
        assert_eq!(driver.instance_endpoint(&booting.id).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let endpoint = driver.instance_endpoint(&booting.id).await.unwrap();
        assert_eq!(endpoint, Some(format!("mem://{}", booting.id)));

        assert!(matches!(
            driver.instance_endpoint(&InstanceId::from("ghost")).await,
            Err(DriverError::UnknownInstance(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_removes_the_instance_and_reports_the_reason() {
        let runtime = mock_runtime("rt_mem");
        let driver = MemoryDriver::new(MemoryDriverConfig::default());
        let handle = driver.ensure_pool(&runtime).await.unwrap();
        driver.scale(&runtime.id, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let instance = driver.list_instances(&runtime.id).await.unwrap().remove(0);
        let mut health = driver.watch_health(&runtime.id, handle.resume_from).unwrap();
        driver.kill_instance(&instance.id).await.unwrap();

        let mut last = None;
        while let Some(event) = health.next().await {
            let done = matches!(event.state, InstanceState::Terminated { .. });
            last = Some(event);
            if done {
                break;
            }
        }
        assert_eq!(
            last.unwrap().state,
            InstanceState::Terminated {
                reason: TerminationReason::Crashed
            }
        );
        assert!(matches!(
            driver.kill_instance(&instance.id).await,
            Err(DriverError::UnknownInstance(_))
        ));
    }
}
