pub mod tests {
    use chrono::{Duration, Utc};

    use crate::{
        Execution,
        ExecutionBuilder,
        Function,
        FunctionBuilder,
        Job,
        JobBuilder,
        PackageRef,
        PoolPolicy,
        Runtime,
        RuntimeBuilder,
        RuntimeId,
        RuntimeStatus,
        Schedule,
    };

    pub const TEST_RUNTIME_ID: &str = "test_runtime_1";
    pub const TEST_RUNTIME_IMAGE: &str = "test-image:latest";

    pub fn mock_runtime(id: &str) -> Runtime {
        let mut runtime = RuntimeBuilder::default()
            .id(RuntimeId::from(id))
            .name(id.to_string())
            .image(TEST_RUNTIME_IMAGE.to_string())
            .pool(PoolPolicy {
                min_warm: 1,
                max_size: 4,
                idle_timeout_ms: 60_000,
            })
            .build()
            .unwrap();
        runtime.status = RuntimeStatus::Available;
        runtime
    }

    pub fn mock_package_ref() -> PackageRef {
        PackageRef {
            url: "memory:///packages/sha256/feed".to_string(),
            size: 128,
            sha256_hash: "feedfacefeedface".to_string(),
        }
    }

    pub fn mock_function(name: &str, max_concurrency: usize, idempotent: bool) -> Function {
        FunctionBuilder::default()
            .name(name.to_string())
            .runtime_id(RuntimeId::from(TEST_RUNTIME_ID))
            .code(mock_package_ref())
            .timeout_ms(5_000)
            .max_concurrency(max_concurrency)
            .idempotent(idempotent)
            .build()
            .unwrap()
    }

    pub fn mock_execution(function: &Function) -> Execution {
        ExecutionBuilder::default()
            .function_id(function.id.clone())
            .runtime_id(function.runtime_id.clone())
            .input(serde_json::json!({"payload": "test"}))
            .build()
            .unwrap()
    }

    pub fn mock_cron_job(function: &Function, expr: &str) -> Job {
        JobBuilder::default()
            .function_id(function.id.clone())
            .schedule(Schedule::Cron {
                expr: expr.to_string(),
            })
            .input(serde_json::json!({"trigger": "cron"}))
            .build()
            .unwrap()
    }

    pub fn mock_one_shot_job(function: &Function) -> Job {
        JobBuilder::default()
            .function_id(function.id.clone())
            .schedule(Schedule::At {
                time: Utc::now() + Duration::minutes(5),
            })
            .input(serde_json::json!({"trigger": "once"}))
            .build()
            .unwrap()
    }
}
