use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

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
use tokio::sync::RwLock;

use crate::{MetadataStore, StoreError, StoreResult, Versioned};

/// Single-process [`MetadataStore`] backed by in-memory maps.
///
/// Versions follow the same compare-and-swap contract a durable backend
/// would enforce, so code written against this store ports to one without
/// behavioral change. The failure levers ([`set_unavailable`](Self::set_unavailable),
/// [`set_update_delay`](Self::set_update_delay)) exist to exercise outage
/// and write-race paths without a real outage.
pub struct InMemoryMetadataStore {
    runtimes: RwLock<HashMap<RuntimeId, Versioned<Runtime>>>,
    functions: RwLock<HashMap<FunctionId, Versioned<Function>>>,
    executions: RwLock<HashMap<ExecutionId, Versioned<Execution>>>,
    jobs: RwLock<HashMap<JobId, Versioned<Job>>>,
    unavailable: AtomicBool,
    update_delay: Mutex<Option<Duration>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            update_delay: Mutex::new(None),
        }
    }

    /// While set, every store operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stalls every update between its availability check and its
    /// compare-and-swap, widening the window in which two writers race.
    pub fn set_update_delay(&self, delay: Option<Duration>) {
        *self.update_delay.lock().expect("update_delay lock poisoned") = delay;
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn apply_update_delay(&self) {
        let delay = *self.update_delay.lock().expect("update_delay lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_new<K, V>(
    map: &mut HashMap<K, Versioned<V>>,
    kind: &'static str,
    key: K,
    record: V,
) -> StoreResult<Versioned<V>>
where
    K: Eq + Hash + Display,
    V: Clone,
{
    if map.contains_key(&key) {
        return Err(StoreError::AlreadyExists {
            kind,
            id: key.to_string(),
        });
    }
    let versioned = Versioned { record, version: 1 };
    map.insert(key, versioned.clone());
    Ok(versioned)
}

fn cas_replace<K, V>(
    map: &mut HashMap<K, Versioned<V>>,
    kind: &'static str,
    key: K,
    expected_version: u64,
    record: V,
) -> StoreResult<Versioned<V>>
where
    K: Eq + Hash + Display,
    V: Clone,
{
    let Some(existing) = map.get_mut(&key) else {
        return Err(StoreError::NotFound {
            kind,
            id: key.to_string(),
        });
    };
    if existing.version != expected_version {
        return Err(StoreError::VersionConflict {
            kind,
            id: key.to_string(),
            expected: expected_version,
            found: existing.version,
        });
    }
    existing.record = record;
    existing.version += 1;
    Ok(existing.clone())
}

fn remove_existing<K, V>(
    map: &mut HashMap<K, Versioned<V>>,
    kind: &'static str,
    key: &K,
) -> StoreResult<()>
where
    K: Eq + Hash + Display,
{
    if map.remove(key).is_none() {
        return Err(StoreError::NotFound {
            kind,
            id: key.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_runtime(&self, runtime: Runtime) -> StoreResult<Versioned<Runtime>> {
        self.check_available()?;
        let mut runtimes = self.runtimes.write().await;
        insert_new(&mut runtimes, "runtime", runtime.id.clone(), runtime)
    }

    async fn runtime(&self, id: &RuntimeId) -> StoreResult<Option<Versioned<Runtime>>> {
        self.check_available()?;
        Ok(self.runtimes.read().await.get(id).cloned())
    }

    async fn list_runtimes(&self) -> StoreResult<Vec<Versioned<Runtime>>> {
        self.check_available()?;
        let mut runtimes: Vec<_> = self.runtimes.read().await.values().cloned().collect();
        runtimes.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(runtimes)
    }

    async fn update_runtime(
        &self,
        expected_version: u64,
        runtime: Runtime,
    ) -> StoreResult<Versioned<Runtime>> {
        self.check_available()?;
        self.apply_update_delay().await;
        let mut runtimes = self.runtimes.write().await;
        cas_replace(
            &mut runtimes,
            "runtime",
            runtime.id.clone(),
            expected_version,
            runtime,
        )
    }

    async fn remove_runtime(&self, id: &RuntimeId) -> StoreResult<()> {
        self.check_available()?;
        let functions = self.functions.read().await;
        if functions.values().any(|f| &f.record.runtime_id == id) {
            return Err(StoreError::InUse {
                kind: "runtime",
                id: id.to_string(),
            });
        }
        drop(functions);
        let mut runtimes = self.runtimes.write().await;
        remove_existing(&mut runtimes, "runtime", id)
    }

    async fn create_function(&self, function: Function) -> StoreResult<Versioned<Function>> {
        self.check_available()?;
        let mut functions = self.functions.write().await;
        insert_new(&mut functions, "function", function.id.clone(), function)
    }

    async fn function(&self, id: &FunctionId) -> StoreResult<Option<Versioned<Function>>> {
        self.check_available()?;
        Ok(self.functions.read().await.get(id).cloned())
    }

    async fn list_functions(&self) -> StoreResult<Vec<Versioned<Function>>> {
        self.check_available()?;
        let mut functions: Vec<_> = self.functions.read().await.values().cloned().collect();
        functions.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(functions)
    }

    async fn remove_function(&self, id: &FunctionId) -> StoreResult<()> {
        self.check_available()?;
        let mut functions = self.functions.write().await;
        remove_existing(&mut functions, "function", id)
    }

    async fn create_execution(&self, execution: Execution) -> StoreResult<Versioned<Execution>> {
        self.check_available()?;
        let mut executions = self.executions.write().await;
        insert_new(&mut executions, "execution", execution.id.clone(), execution)
    }

    async fn execution(&self, id: &ExecutionId) -> StoreResult<Option<Versioned<Execution>>> {
        self.check_available()?;
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn update_execution(
        &self,
        expected_version: u64,
        execution: Execution,
    ) -> StoreResult<Versioned<Execution>> {
        self.check_available()?;
        self.apply_update_delay().await;
        let mut executions = self.executions.write().await;
        cas_replace(
            &mut executions,
            "execution",
            execution.id.clone(),
            expected_version,
            execution,
        )
    }

    async fn list_nonterminal_executions(&self) -> StoreResult<Vec<Versioned<Execution>>> {
        self.check_available()?;
        let mut executions: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.record.terminal_state())
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(executions)
    }

    async fn create_job(&self, job: Job) -> StoreResult<Versioned<Job>> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        insert_new(&mut jobs, "job", job.id.clone(), job)
    }

    async fn job(&self, id: &JobId) -> StoreResult<Option<Versioned<Job>>> {
        self.check_available()?;
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Versioned<Job>>> {
        self.check_available()?;
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(jobs)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Versioned<Job>>> {
        self.check_available()?;
        let mut due: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| {
                j.record.enabled &&
                    j.record
                        .next_fire_at
                        .map(|at| at <= now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.record.next_fire_at, &a.record.id).cmp(&(b.record.next_fire_at, &b.record.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn update_job(&self, expected_version: u64, job: Job) -> StoreResult<Versioned<Job>> {
        self.check_available()?;
        self.apply_update_delay().await;
        let mut jobs = self.jobs.write().await;
        cas_replace(&mut jobs, "job", job.id.clone(), expected_version, job)
    }

    async fn remove_job(&self, id: &JobId) -> StoreResult<()> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        remove_existing(&mut jobs, "job", id)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::{
        test_objects::tests::{mock_cron_job, mock_execution, mock_function, mock_runtime},
        ExecutionStatus,
    };

    use super::*;

    #[tokio::test]
    async fn test_create_rejects_duplicate_ids() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let runtime = mock_runtime("python311");
        store.create_runtime(runtime.clone()).await?;
        assert_eq!(
            store.create_runtime(runtime).await,
            Err(StoreError::AlreadyExists {
                kind: "runtime",
                id: "python311".to_string(),
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_rejects_stale_writers() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let function = mock_function("resize", 2, false);
        let execution = mock_execution(&function);
        let stored = store.create_execution(execution).await?;
        assert_eq!(stored.version, 1);

        let mut first = stored.record.clone();
        first.status = ExecutionStatus::Dispatched;
        let updated = store.update_execution(stored.version, first).await?;
        assert_eq!(updated.version, 2);

        // A writer still holding version 1 must lose.
        let mut stale = stored.record.clone();
        stale.status = ExecutionStatus::Failed;
        let err = store.update_execution(stored.version, stale).await;
        assert!(matches!(err, Err(StoreError::VersionConflict { .. })));

        let current = store.execution(&stored.record.id).await?.unwrap();
        assert_eq!(current.record.status, ExecutionStatus::Dispatched);
        Ok(())
    }

    #[tokio::test]
    async fn test_due_jobs_filters_and_orders() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let function = mock_function("report", 1, false);

        let mut due_late = mock_cron_job(&function, "0 * * * *");
        due_late.next_fire_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut due_early = mock_cron_job(&function, "0 * * * *");
        due_early.next_fire_at = Some(Utc::now() - chrono::Duration::seconds(60));
        let mut not_due = mock_cron_job(&function, "0 * * * *");
        not_due.next_fire_at = Some(Utc::now() + chrono::Duration::hours(1));
        let mut disabled = mock_cron_job(&function, "0 * * * *");
        disabled.enabled = false;
        disabled.next_fire_at = Some(Utc::now() - chrono::Duration::seconds(60));

        for job in [&due_late, &due_early, &not_due, &disabled] {
            store.create_job(job.clone()).await?;
        }

        let due = store.due_jobs(Utc::now(), 10).await?;
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].record.id, due_early.id);
        assert_eq!(due[1].record.id, due_late.id);

        let capped = store.due_jobs(Utc::now(), 1).await?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let runtime = mock_runtime("python311");
        store.create_runtime(runtime.clone()).await?;

        store.set_unavailable(true);
        assert!(matches!(
            store.runtime(&runtime.id).await,
            Err(StoreError::Unavailable { .. })
        ));
        assert!(matches!(
            store.update_runtime(1, runtime.clone()).await,
            Err(StoreError::Unavailable { .. })
        ));

        store.set_unavailable(false);
        assert!(store.runtime(&runtime.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_runtime_in_use() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let runtime = mock_runtime("test_runtime_1");
        store.create_runtime(runtime.clone()).await?;
        let function = mock_function("resize", 2, false);
        store.create_function(function.clone()).await?;

        assert_eq!(
            store.remove_runtime(&runtime.id).await,
            Err(StoreError::InUse {
                kind: "runtime",
                id: runtime.id.to_string(),
            })
        );

        store.remove_function(&function.id).await?;
        store.remove_runtime(&runtime.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_nonterminal_listing_skips_finished() -> Result<()> {
        let store = InMemoryMetadataStore::new();
        let function = mock_function("resize", 2, false);

        let running = store.create_execution(mock_execution(&function)).await?;
        let finished = store.create_execution(mock_execution(&function)).await?;
        let mut record = finished.record.clone();
        record.status = ExecutionStatus::Succeeded;
        store.update_execution(finished.version, record).await?;

        let nonterminal = store.list_nonterminal_executions().await?;
        assert_eq!(nonterminal.len(), 1);
        assert_eq!(nonterminal[0].record.id, running.record.id);
        Ok(())
    }
}
