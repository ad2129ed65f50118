use std::sync::Arc;

use data_model::{PoolPolicy, Runtime, RuntimeBuilder, RuntimeId, RuntimeStatus};
use processor::pool::{PoolError, PoolManager, PoolSnapshot};
use state_store::{MetadataStore, StoreError, Versioned};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeOpError {
    #[error("runtime {0} not found")]
    NotFound(RuntimeId),

    #[error("invalid runtime: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Runtime lifecycle on top of the metadata store and the pool layer.
///
/// Store writes come first, so a crash between the record and the pool leaves
/// a status that says what still needs doing rather than an untracked pool.
pub struct RuntimeManager {
    store: Arc<dyn MetadataStore>,
    pool: Arc<PoolManager>,
}

impl RuntimeManager {
    pub fn new(store: Arc<dyn MetadataStore>, pool: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self { store, pool })
    }

    /// Persists the runtime, registers its pool and pre-warms it to
    /// `min_warm`. The record moves Creating -> Available, or Creating ->
    /// Error when the driver refuses the pool.
    pub async fn create_runtime(
        &self,
        name: String,
        image: String,
        pool: PoolPolicy,
    ) -> Result<Versioned<Runtime>, RuntimeOpError> {
        let runtime = RuntimeBuilder::default()
            .id(RuntimeId::new(name.clone()))
            .name(name)
            .image(image)
            .pool(pool)
            .build()
            .map_err(|e| RuntimeOpError::Invalid(e.to_string()))?;
        let stored = self.store.create_runtime(runtime).await?;
        info!(
            runtime_id = stored.record.id.get(),
            image = stored.record.image.as_str(),
            "Creating runtime"
        );

        if let Err(err) = self.pool.register_runtime(stored.record.clone()).await {
            error!(
                runtime_id = stored.record.id.get(),
                "Registering pool: {err:#}"
            );
            self.set_status(stored, RuntimeStatus::Error).await;
            return Err(err.into());
        }
        Ok(self.set_status(stored, RuntimeStatus::Available).await)
    }

    pub async fn runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Versioned<Runtime>, RuntimeOpError> {
        self.store
            .runtime(runtime_id)
            .await?
            .ok_or_else(|| RuntimeOpError::NotFound(runtime_id.clone()))
    }

    pub async fn list_runtimes(&self) -> Result<Vec<Versioned<Runtime>>, RuntimeOpError> {
        Ok(self.store.list_runtimes().await?)
    }

    /// Rolls the runtime to a new image. Existing instances keep serving;
    /// replacements boot from the new image. When the driver refuses the roll
    /// the record reverts to the previous image and stays Available.
    pub async fn update_runtime_image(
        &self,
        runtime_id: &RuntimeId,
        image: String,
    ) -> Result<Versioned<Runtime>, RuntimeOpError> {
        let current = self.runtime(runtime_id).await?;

        let mut record = current.record.clone();
        record.status = RuntimeStatus::Upgrading;
        record.image = image;
        let upgrading = self.store.update_runtime(current.version, record).await?;
        info!(
            runtime_id = runtime_id.get(),
            image = upgrading.record.image.as_str(),
            "Rolling runtime image"
        );

        if let Err(err) = self.pool.update_runtime(upgrading.record.clone()).await {
            error!(runtime_id = runtime_id.get(), "Rolling image: {err:#}");
            let mut rollback = upgrading.record.clone();
            rollback.image = current.record.image.clone();
            rollback.status = RuntimeStatus::Available;
            if let Err(store_err) = self.store.update_runtime(upgrading.version, rollback).await {
                warn!(
                    runtime_id = runtime_id.get(),
                    "Reverting image record: {store_err:#}"
                );
            }
            return Err(err.into());
        }
        Ok(self.set_status(upgrading, RuntimeStatus::Available).await)
    }

    /// Removes the runtime and tears down its pool. Refused while functions
    /// still reference it, in which case nothing is torn down.
    pub async fn delete_runtime(&self, runtime_id: &RuntimeId) -> Result<(), RuntimeOpError> {
        self.store.remove_runtime(runtime_id).await?;
        match self.pool.deregister_runtime(runtime_id).await {
            Ok(()) | Err(PoolError::UnknownRuntime(_)) => {}
            Err(err) => warn!(
                runtime_id = runtime_id.get(),
                "Tearing down pool: {err:#}"
            ),
        }
        info!(runtime_id = runtime_id.get(), "Runtime deleted");
        Ok(())
    }

    pub async fn scale_up(
        &self,
        runtime_id: &RuntimeId,
        count: usize,
    ) -> Result<usize, RuntimeOpError> {
        Ok(self.pool.scale_up(runtime_id, count).await?)
    }

    pub async fn scale_down(
        &self,
        runtime_id: &RuntimeId,
        count: usize,
    ) -> Result<usize, RuntimeOpError> {
        Ok(self.pool.scale_down(runtime_id, count).await?)
    }

    pub async fn pool_status(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<PoolSnapshot, RuntimeOpError> {
        Ok(self.pool.snapshot(runtime_id).await?)
    }

    /// Re-registers pools for every stored runtime after a restart. Instances
    /// the driver still runs are adopted rather than re-provisioned. A runtime
    /// caught mid-create is parked in Error for the operator to retry.
    pub async fn resume(&self) -> Result<usize, RuntimeOpError> {
        let runtimes = self.store.list_runtimes().await?;
        let mut restored = 0;
        for versioned in runtimes {
            match &versioned.record.status {
                RuntimeStatus::Available | RuntimeStatus::Upgrading => {
                    let was_upgrading = versioned.record.status == RuntimeStatus::Upgrading;
                    if let Err(err) = self.pool.register_runtime(versioned.record.clone()).await {
                        error!(
                            runtime_id = versioned.record.id.get(),
                            "Restoring pool: {err:#}"
                        );
                        self.set_status(versioned, RuntimeStatus::Error).await;
                        continue;
                    }
                    // An interrupted roll already persisted the new image;
                    // the re-registered pool picks it up, so the roll is done.
                    if was_upgrading {
                        self.set_status(versioned, RuntimeStatus::Available).await;
                    }
                    restored += 1;
                }
                RuntimeStatus::Creating => {
                    warn!(
                        runtime_id = versioned.record.id.get(),
                        "Runtime was mid-create at shutdown"
                    );
                    self.set_status(versioned, RuntimeStatus::Error).await;
                }
                RuntimeStatus::Error => {}
            }
        }
        Ok(restored)
    }

    /// Best-effort status write. A lost race refetches and retries; a record
    /// that vanished mid-write comes back unchanged.
    async fn set_status(
        &self,
        mut current: Versioned<Runtime>,
        status: RuntimeStatus,
    ) -> Versioned<Runtime> {
        for _ in 0..3 {
            let mut record = current.record.clone();
            record.status = status.clone();
            match self.store.update_runtime(current.version, record).await {
                Ok(stored) => return stored,
                Err(StoreError::VersionConflict { .. }) => {
                    match self.store.runtime(&current.record.id).await {
                        Ok(Some(fresh)) => current = fresh,
                        _ => break,
                    }
                }
                Err(err) => {
                    warn!(
                        runtime_id = current.record.id.get(),
                        status = status.as_ref(),
                        "Updating runtime status: {err:#}"
                    );
                    break;
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_function, TEST_RUNTIME_ID};
    use processor::{driver::memory::MemoryDriver, pool::PoolManagerConfig};
    use state_store::InMemoryMetadataStore;

    use super::*;

    fn fixture() -> (Arc<InMemoryMetadataStore>, Arc<RuntimeManager>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let driver = Arc::new(MemoryDriver::new(Default::default()));
        let pool = PoolManager::new(driver, PoolManagerConfig::default());
        let manager = RuntimeManager::new(store.clone(), pool);
        (store, manager)
    }

    fn warm_policy(min_warm: usize) -> PoolPolicy {
        PoolPolicy {
            min_warm,
            max_size: 4,
            idle_timeout_ms: 60_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_runtime_prewarns_and_goes_available() {
        let (_store, manager) = fixture();
        let stored = manager
            .create_runtime(
                "python311".to_string(),
                "python:3.11".to_string(),
                warm_policy(1),
            )
            .await
            .unwrap();
        assert_eq!(stored.record.status, RuntimeStatus::Available);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let snapshot = manager.pool_status(&stored.record.id).await.unwrap();
        assert_eq!(snapshot.free, 1);
        assert_eq!(snapshot.min_warm, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_runtime_name_is_rejected() {
        let (_store, manager) = fixture();
        manager
            .create_runtime("python311".to_string(), "python:3.11".to_string(), warm_policy(0))
            .await
            .unwrap();
        let err = manager
            .create_runtime("python311".to_string(), "python:3.12".to_string(), warm_policy(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeOpError::Store(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_refused_while_functions_reference_the_runtime() {
        let (store, manager) = fixture();
        let stored = manager
            .create_runtime(
                TEST_RUNTIME_ID.to_string(),
                "python:3.11".to_string(),
                warm_policy(0),
            )
            .await
            .unwrap();
        let function = mock_function("resize", 2, false);
        store.create_function(function.clone()).await.unwrap();

        let err = manager.delete_runtime(&stored.record.id).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeOpError::Store(StoreError::InUse { .. })
        ));
        // Nothing was torn down.
        assert!(manager.pool_status(&stored.record.id).await.is_ok());

        store.remove_function(&function.id).await.unwrap();
        manager.delete_runtime(&stored.record.id).await.unwrap();
        assert!(matches!(
            manager.pool_status(&stored.record.id).await,
            Err(RuntimeOpError::Pool(PoolError::UnknownRuntime(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn image_roll_updates_record_and_pool() {
        let (_store, manager) = fixture();
        let stored = manager
            .create_runtime(
                "python311".to_string(),
                "python:3.11".to_string(),
                warm_policy(0),
            )
            .await
            .unwrap();

        let rolled = manager
            .update_runtime_image(&stored.record.id, "python:3.12".to_string())
            .await
            .unwrap();
        assert_eq!(rolled.record.image, "python:3.12");
        assert_eq!(rolled.record.status, RuntimeStatus::Available);
        assert!(rolled.version > stored.version);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restores_pools_and_parks_interrupted_creates() {
        let (store, first) = fixture();
        first
            .create_runtime(
                "python311".to_string(),
                "python:3.11".to_string(),
                warm_policy(1),
            )
            .await
            .unwrap();

        // A record another server left mid-create.
        let interrupted = RuntimeBuilder::default()
            .id(RuntimeId::new("go121".to_string()))
            .name("go121".to_string())
            .image("golang:1.21".to_string())
            .build()
            .unwrap();
        store.create_runtime(interrupted).await.unwrap();

        let driver = Arc::new(MemoryDriver::new(Default::default()));
        let pool = PoolManager::new(driver, PoolManagerConfig::default());
        let manager = RuntimeManager::new(store.clone(), pool);
        let restored = manager.resume().await.unwrap();
        assert_eq!(restored, 1);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let snapshot = manager
            .pool_status(&RuntimeId::new("python311".to_string()))
            .await
            .unwrap();
        assert_eq!(snapshot.free, 1);

        let parked = store
            .runtime(&RuntimeId::new("go121".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.record.status, RuntimeStatus::Error);
    }
}
