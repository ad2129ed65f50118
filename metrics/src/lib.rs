use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Installs the global meter provider and hands it back so the caller can
/// flush it at shutdown. Exporters are wired by the embedding process; a
/// provider with no readers keeps all instruments valid no-ops.
pub fn init_provider() -> SdkMeterProvider {
    let provider = SdkMeterProvider::builder().build();
    opentelemetry::global::set_meter_provider(provider.clone());
    provider
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records elapsed seconds into a metric when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self {
            start: Instant::now(),
            metric,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &[]);
    }
}

/// Applies +1 on construction and -1 on drop, so in-flight gauges stay
/// correct on every exit path.
pub struct CounterGuard<'a, F>
where
    F: Fn(&str, i64),
{
    label: &'a str,
    func: F,
}

impl<'a, F> CounterGuard<'a, F>
where
    F: Fn(&str, i64),
{
    pub fn new(label: &'a str, func: F) -> Self {
        func(label, 1);
        Self { label, func }
    }
}

impl<'a, F> Drop for CounterGuard<'a, F>
where
    F: Fn(&str, i64),
{
    fn drop(&mut self) {
        (self.func)(self.label, -1);
    }
}

pub mod dispatch_stats {
    use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};

    #[derive(Debug)]
    pub struct Metrics {
        pub submissions: Counter<u64>,
        pub completions: Counter<u64>,
        pub transport_retries: Counter<u64>,
        pub queue_wait: Histogram<f64>,
        pub invoke_latency: Histogram<f64>,
        pub inflight: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("kiln-server");
            let submissions = meter
                .u64_counter("kiln.dispatch.submissions")
                .with_description("number of executions submitted")
                .build();
            let completions = meter
                .u64_counter("kiln.dispatch.completions")
                .with_description("number of executions reaching a terminal status")
                .build();
            let transport_retries = meter
                .u64_counter("kiln.dispatch.transport_retries")
                .with_description("number of invocations retried on a fresh instance")
                .build();
            let queue_wait = meter
                .f64_histogram("kiln.dispatch.queue_wait")
                .with_description("seconds spent between submission and dispatch")
                .build();
            let invoke_latency = meter
                .f64_histogram("kiln.dispatch.invoke_latency")
                .with_description("seconds spent inside instance invocations")
                .build();
            let inflight = meter
                .i64_up_down_counter("kiln.dispatch.inflight")
                .with_description("executions currently between submission and completion")
                .build();
            Metrics {
                submissions,
                completions,
                transport_retries,
                queue_wait,
                invoke_latency,
                inflight,
            }
        }
    }
}

pub mod pool_stats {
    use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};

    #[derive(Debug)]
    pub struct Metrics {
        pub cold_boots: Counter<u64>,
        pub evictions: Counter<u64>,
        pub failures_replaced: Counter<u64>,
        pub slot_wait: Histogram<f64>,
        pub ready_instances: UpDownCounter<i64>,
        pub busy_instances: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("kiln-server");
            let cold_boots = meter
                .u64_counter("kiln.pool.cold_boots")
                .with_description("instances provisioned on demand")
                .build();
            let evictions = meter
                .u64_counter("kiln.pool.evictions")
                .with_description("idle instances reclaimed by the reconciler")
                .build();
            let failures_replaced = meter
                .u64_counter("kiln.pool.failures_replaced")
                .with_description("instances reported failed and recycled")
                .build();
            let slot_wait = meter
                .f64_histogram("kiln.pool.slot_wait")
                .with_description("seconds callers waited for a warm slot")
                .build();
            let ready_instances = meter
                .i64_up_down_counter("kiln.pool.ready_instances")
                .with_description("instances currently idle in a warm pool")
                .build();
            let busy_instances = meter
                .i64_up_down_counter("kiln.pool.busy_instances")
                .with_description("instances currently leased to executions")
                .build();
            Metrics {
                cold_boots,
                evictions,
                failures_replaced,
                slot_wait,
                ready_instances,
                busy_instances,
            }
        }
    }
}

pub mod job_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub fires: Counter<u64>,
        pub claim_conflicts: Counter<u64>,
        pub claim_failures: Counter<u64>,
        pub tick_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("kiln-server");
            let fires = meter
                .u64_counter("kiln.jobs.fires")
                .with_description("job firings that submitted an execution")
                .build();
            let claim_conflicts = meter
                .u64_counter("kiln.jobs.claim_conflicts")
                .with_description("job claims lost to a concurrent scheduler")
                .build();
            let claim_failures = meter
                .u64_counter("kiln.jobs.claim_failures")
                .with_description("job claims abandoned because the store was unavailable")
                .build();
            let tick_duration = meter
                .f64_histogram("kiln.jobs.tick_duration")
                .with_description("seconds spent per scheduler tick")
                .build();
            Metrics {
                fires,
                claim_conflicts,
                claim_failures,
                tick_duration,
            }
        }
    }
}
