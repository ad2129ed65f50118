use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use data_model::{ExecutionStatus, Job, JobId};
use metrics::{job_stats, Timer};
use serde::{Deserialize, Serialize};
use state_store::{MetadataStore, StoreError, Versioned};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, SubmitMode, SubmitRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEngineConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,

    /// Queueing and placement headroom granted on top of the function's own
    /// timeout when a job fires.
    #[serde(default = "default_dispatch_grace_ms")]
    pub dispatch_grace_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_claim_batch() -> usize {
    32
}

fn default_dispatch_grace_ms() -> u64 {
    30_000
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            claim_batch: default_claim_batch(),
            dispatch_grace_ms: default_dispatch_grace_ms(),
        }
    }
}

/// Fires scheduled jobs at most once per due time.
///
/// Each tick lists due jobs and claims them one by one: the claim writes the
/// advanced `next_fire_at` with a compare-and-swap, so of N schedulers
/// sharing a store exactly one wins the write and submits the execution.
/// Missed ticks collapse; a schedule that went unserviced fires once, not
/// once per missed slot.
pub struct JobEngine {
    store: Arc<dyn MetadataStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: job_stats::Metrics,
    config: JobEngineConfig,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        dispatcher: Arc<Dispatcher>,
        config: JobEngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            metrics: job_stats::Metrics::new(),
            config,
        })
    }

    /// Runs the scheduler loop until `shutdown` fires.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut finished_rx = self.dispatcher.subscribe_finished();
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "Job engine started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once(Utc::now()).await;
                },
                event = finished_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(job_id) = event.job_id {
                                self.record_outcome(&job_id, event.status).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Job outcome events lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!("Execution event channel closed");
                            return;
                        }
                    }
                },
                _ = shutdown.changed() => {
                    info!("Job engine shutting down");
                    return;
                },
            }
        }
    }

    /// One scheduling pass. Returns how many jobs this engine fired.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> usize {
        let _timer = Timer::start(&self.metrics.tick_duration);
        let due = match self.store.due_jobs(now, self.config.claim_batch).await {
            Ok(due) => due,
            Err(err) => {
                warn!("Listing due jobs: {err}");
                return 0;
            }
        };
        let mut fired = 0;
        for versioned in due {
            if self.claim_and_fire(versioned, now).await {
                fired += 1;
            }
        }
        fired
    }

    /// Claims one due job by advancing its schedule, then submits the
    /// execution. Losing the claim means another scheduler fired it.
    async fn claim_and_fire(&self, versioned: Versioned<Job>, now: DateTime<Utc>) -> bool {
        let mut claimed = versioned.record.clone();
        match claimed.schedule.next_after(now) {
            Ok(next) => {
                if next.is_none() {
                    claimed.enabled = false;
                }
                claimed.next_fire_at = next;
            }
            Err(err) => {
                error!(
                    job_id = claimed.id.get(),
                    "Disabling job with invalid schedule: {err}"
                );
                claimed.enabled = false;
                claimed.next_fire_at = None;
            }
        }
        claimed.last_fire_at = Some(now);

        match self.store.update_job(versioned.version, claimed.clone()).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                self.metrics.claim_conflicts.add(1, &[]);
                debug!(
                    job_id = claimed.id.get(),
                    "Job claimed by another scheduler"
                );
                return false;
            }
            Err(err) => {
                // The schedule was not advanced; the next tick retries.
                self.metrics.claim_failures.add(1, &[]);
                warn!(job_id = claimed.id.get(), "Could not claim job: {err}");
                return false;
            }
        }

        self.metrics.fires.add(1, &[]);
        info!(
            job_id = claimed.id.get(),
            function_id = claimed.function_id.get(),
            next_fire_at = ?claimed.next_fire_at,
            "Job fired"
        );
        let deadline = match self.store.function(&claimed.function_id).await {
            Ok(Some(function)) => Duration::from_millis(
                function.record.timeout_ms + self.config.dispatch_grace_ms,
            ),
            _ => Duration::from_millis(self.config.dispatch_grace_ms),
        };
        let request = SubmitRequest {
            function_id: claimed.function_id.clone(),
            input: claimed.input.clone(),
            mode: SubmitMode::Async,
            deadline: Some(deadline),
            job_id: Some(claimed.id.clone()),
        };
        if let Err(err) = self.dispatcher.submit(request).await {
            // The fire was consumed either way; the schedule stays advanced.
            warn!(job_id = claimed.id.get(), "Job submission failed: {err}");
        }
        true
    }

    async fn record_outcome(&self, job_id: &JobId, status: ExecutionStatus) {
        for _ in 0..3 {
            let fetched = match self.store.job(job_id).await {
                Ok(Some(versioned)) => versioned,
                // Deleted since it fired; nothing to record on.
                Ok(None) => return,
                Err(err) => {
                    debug!(job_id = job_id.get(), "Fetching job for outcome: {err}");
                    return;
                }
            };
            let mut record = fetched.record.clone();
            record.last_outcome = Some(status);
            match self.store.update_job(fetched.version, record).await {
                Ok(_) => return,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => {
                    debug!(job_id = job_id.get(), "Recording job outcome: {err}");
                    return;
                }
            }
        }
        debug!(job_id = job_id.get(), "Gave up recording job outcome");
    }
}
