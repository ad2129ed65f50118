use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_stream::stream;
use data_model::{InstanceId, InstanceState, RuntimeId, TerminationReason};
use tokio::sync::watch;

use super::{DriverError, HealthStream, InstanceStatusEvent};

/// How many events a pool keeps around for watchers that resume or lag.
const REPLAY_LOG_CAPACITY: usize = 1024;

struct FeedLog {
    events: VecDeque<InstanceStatusEvent>,
    next_seq: u64,
}

/// Sequenced event log for one pool. Publishing assigns the next sequence
/// number and wakes watchers; watchers replay retained events and then tail
/// the log. A watcher that falls further behind than the retention window
/// has its stream ended so it can re-list and resubscribe.
pub struct HealthFeed {
    runtime_id: RuntimeId,
    log: Arc<Mutex<FeedLog>>,
    latest: watch::Sender<u64>,
}

impl HealthFeed {
    pub fn new(runtime_id: RuntimeId) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            runtime_id,
            log: Arc::new(Mutex::new(FeedLog {
                events: VecDeque::new(),
                next_seq: 1,
            })),
            latest,
        }
    }

    pub fn publish(
        &self,
        instance_id: InstanceId,
        state: InstanceState,
        endpoint: Option<String>,
    ) -> InstanceStatusEvent {
        self.append(instance_id, state, endpoint, None)
    }

    /// Reports a boot that never reached Ready, carrying the reason on the
    /// terminal event.
    pub fn publish_provision_failure(
        &self,
        instance_id: InstanceId,
        failure: String,
    ) -> InstanceStatusEvent {
        self.append(
            instance_id,
            InstanceState::Terminated {
                reason: TerminationReason::ProvisionFailed,
            },
            None,
            Some(failure),
        )
    }

    fn append(
        &self,
        instance_id: InstanceId,
        state: InstanceState,
        endpoint: Option<String>,
        failure: Option<String>,
    ) -> InstanceStatusEvent {
        let event = {
            let mut log = self.log.lock().unwrap();
            let event = InstanceStatusEvent {
                seq: log.next_seq,
                runtime_id: self.runtime_id.clone(),
                instance_id,
                state,
                endpoint,
                failure,
            };
            log.next_seq += 1;
            log.events.push_back(event.clone());
            while log.events.len() > REPLAY_LOG_CAPACITY {
                log.events.pop_front();
            }
            event
        };
        let _ = self.latest.send(event.seq);
        event
    }

    pub fn latest_seq(&self) -> u64 {
        self.log.lock().unwrap().next_seq - 1
    }

    pub fn subscribe(&self, after_seq: u64) -> Result<HealthStream, DriverError> {
        {
            let log = self.log.lock().unwrap();
            if let Some(front) = log.events.front() {
                if after_seq + 1 < front.seq {
                    return Err(DriverError::ResumeWindowExceeded {
                        oldest: front.seq,
                        latest: log.next_seq - 1,
                    });
                }
            }
        }

        let log = self.log.clone();
        let mut latest_rx = self.latest.subscribe();
        let stream = stream! {
            let mut last_seen = after_seq;
            loop {
                let batch: Vec<InstanceStatusEvent> = {
                    let log = log.lock().unwrap();
                    if let Some(front) = log.events.front() {
                        if last_seen + 1 < front.seq {
                            // Fell out of the retention window while tailing.
                            break;
                        }
                    }
                    log.events
                        .iter()
                        .filter(|ev| ev.seq > last_seen)
                        .cloned()
                        .collect()
                };
                for event in batch {
                    last_seen = event.seq;
                    yield event;
                }
                if latest_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
