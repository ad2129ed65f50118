#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;
    use chrono::Utc;
    use data_model::{
        test_objects::tests::{
            mock_cron_job, mock_execution, mock_function, mock_runtime, TEST_RUNTIME_ID,
        },
        ExecutionStatus,
        FailureKind,
        FunctionBuilder,
        FunctionId,
        PackageRef,
        PoolPolicy,
        RuntimeId,
        RuntimeStatus,
    };
    use futures::stream;
    use processor::dispatcher::{SubmitMode, SubmitRequest};
    use processor::driver::ClusterDriver;
    use processor::instance_client::StubCall;
    use serde_json::json;

    use crate::testing::TestService;

    fn warm_policy(min_warm: usize, max_size: usize) -> PoolPolicy {
        PoolPolicy {
            min_warm,
            max_size,
            idle_timeout_ms: 60_000,
        }
    }

    fn bundle(code: &'static str) -> impl futures::Stream<Item = Result<Bytes>> + Send + Unpin {
        stream::iter(vec![Ok(Bytes::from_static(code.as_bytes()))])
    }

    fn sync_request(function_id: &FunctionId, input: serde_json::Value) -> SubmitRequest {
        SubmitRequest {
            function_id: function_id.clone(),
            input,
            mode: SubmitMode::Sync,
            deadline: None,
            job_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_invoke_and_download_round_trip() -> Result<()> {
        let ts = TestService::new().await?;

        let runtime = ts
            .service
            .runtimes
            .create_runtime(
                TEST_RUNTIME_ID.to_string(),
                "kiln/python:3.11".to_string(),
                warm_policy(1, 2),
            )
            .await?;
        assert_eq!(runtime.record.status, RuntimeStatus::Available);

        // Publish: the bundle goes into the package store and the function
        // record points at the committed key.
        let put = ts
            .service
            .packages
            .put(bundle("def handler(event): return event"))
            .await?;
        let function = FunctionBuilder::default()
            .name("echo".to_string())
            .runtime_id(runtime.record.id.clone())
            .code(PackageRef {
                url: put.url.clone(),
                size: put.size_bytes,
                sha256_hash: put.sha256_hash.clone(),
            })
            .build()?;
        let function = ts.service.store.create_function(function).await?.record;

        let finished = ts
            .service
            .dispatcher
            .submit(sync_request(&function.id, json!({"name": "kiln"})))
            .await?;
        assert_eq!(finished.record.status, ExecutionStatus::Succeeded);
        assert_eq!(finished.record.output, Some(json!({"name": "kiln"})));

        // The reference stored on the function resolves back to the bundle.
        let bytes = ts.service.packages.read_bytes(&function.code.url).await?;
        assert_eq!(
            bytes,
            Bytes::from_static(b"def handler(event): return event")
        );

        let snapshot = ts
            .service
            .runtimes
            .pool_status(&function.runtime_id)
            .await?;
        assert_eq!(snapshot.min_warm, 1);
        assert!(snapshot.free + snapshot.busy >= 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn killed_warm_instance_is_replaced() -> Result<()> {
        let ts = TestService::new().await?;
        let runtime = ts
            .service
            .runtimes
            .create_runtime(
                "rt_warm".to_string(),
                "kiln/node:20".to_string(),
                warm_policy(2, 4),
            )
            .await?;
        let runtime_id = runtime.record.id.clone();

        // Let the pre-warm boots finish.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = ts.driver.list_instances(&runtime_id).await?;
        assert_eq!(before.len(), 2);

        let victim = before[0].id.clone();
        ts.driver.kill_instance(&victim).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let after = ts.driver.list_instances(&runtime_id).await?;
        assert_eq!(after.len(), 2, "pool must top back up to min_warm");
        assert!(after.iter().all(|i| i.id != victim));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn instance_lost_mid_invoke_fails_once_and_is_replaced() -> Result<()> {
        let ts = TestService::new().await?;
        let runtime = ts
            .service
            .runtimes
            .create_runtime(
                TEST_RUNTIME_ID.to_string(),
                "kiln/python:3.11".to_string(),
                warm_policy(1, 2),
            )
            .await?;
        let runtime_id = runtime.record.id.clone();

        // Let the warm floor come up so the invoke lands on a known instance.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = ts.driver.list_instances(&runtime_id).await?;
        assert_eq!(before.len(), 1);
        let doomed = before[0].id.clone();

        let function = mock_function("fn_fragile", 2, false);
        ts.service.store.create_function(function.clone()).await?;
        ts.client.script(
            &function.id,
            vec![StubCall::transport("connection reset by peer")],
        );

        let finished = ts
            .service
            .dispatcher
            .submit(sync_request(&function.id, json!({"order": 7})))
            .await?;
        assert_eq!(finished.record.status, ExecutionStatus::Failed);
        assert_eq!(finished.record.error.unwrap().kind, FailureKind::Platform);
        // Not marked idempotent, so the lost call is never silently re-run.
        assert_eq!(ts.client.calls_for(&function.id).len(), 1);

        // The instance that dropped the connection is gone and the warm
        // floor is restored with a fresh one.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = ts.driver.list_instances(&runtime_id).await?;
        assert_eq!(after.len(), 1);
        assert!(after.iter().all(|i| i.id != doomed));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_job_fires_through_the_service() -> Result<()> {
        let ts = TestService::new().await?;
        ts.service
            .runtimes
            .create_runtime(
                TEST_RUNTIME_ID.to_string(),
                "kiln/python:3.11".to_string(),
                warm_policy(0, 2),
            )
            .await?;
        let function = mock_function("fn_nightly", 2, false);
        ts.service.store.create_function(function.clone()).await?;
        let job = ts
            .service
            .store
            .create_job(mock_cron_job(&function, "* * * * *"))
            .await?;

        let mut finished_rx = ts.service.dispatcher.subscribe_finished();
        let due = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(ts.service.jobs.tick_once(due).await, 1);

        let event = tokio::time::timeout(Duration::from_secs(60), finished_rx.recv()).await??;
        assert_eq!(event.job_id, Some(job.record.id.clone()));
        assert_eq!(event.status, ExecutionStatus::Succeeded);

        // The fired execution is a real record tied back to its job.
        let execution = ts
            .service
            .store
            .execution(&event.execution_id)
            .await?
            .expect("execution record must exist");
        assert_eq!(execution.record.job_id, Some(job.record.id));
        assert_eq!(execution.record.input, json!({"trigger": "cron"}));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_instances_above_the_floor_are_culled() -> Result<()> {
        let ts = TestService::new().await?;
        let runtime = ts
            .service
            .runtimes
            .create_runtime(
                TEST_RUNTIME_ID.to_string(),
                "kiln/python:3.11".to_string(),
                PoolPolicy {
                    min_warm: 0,
                    max_size: 2,
                    idle_timeout_ms: 1_000,
                },
            )
            .await?;
        let runtime_id = runtime.record.id.clone();
        let function = mock_function("fn_cold", 2, false);
        ts.service.store.create_function(function.clone()).await?;

        let finished = ts
            .service
            .dispatcher
            .submit(sync_request(&function.id, json!(1)))
            .await?;
        assert_eq!(finished.record.status, ExecutionStatus::Succeeded);
        // The cold boot left one instance behind, now idle.
        assert_eq!(ts.driver.list_instances(&runtime_id).await?.len(), 1);

        // Sit past the idle timeout and the next maintenance pass.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(ts.driver.list_instances(&runtime_id).await?.is_empty());

        let snapshot = ts.service.runtimes.pool_status(&runtime_id).await?;
        assert_eq!(snapshot.free, 0);
        assert_eq!(snapshot.busy, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn startup_restores_pools_and_fails_interrupted_executions() -> Result<()> {
        let ts = TestService::new().await?;

        // State as a previous process would have left it: an Available
        // runtime, its function, and an execution that never finished.
        ts.service
            .store
            .create_runtime(mock_runtime(TEST_RUNTIME_ID))
            .await?;
        let function = mock_function("fn_orphan", 2, false);
        ts.service.store.create_function(function.clone()).await?;
        let stale = ts
            .service
            .store
            .create_execution(mock_execution(&function))
            .await?;

        assert_eq!(ts.service.runtimes.resume().await?, 1);
        assert_eq!(ts.service.dispatcher.recover().await?, 1);

        // The pool is live again and holds its warm floor.
        let snapshot = ts
            .service
            .runtimes
            .pool_status(&RuntimeId::from(TEST_RUNTIME_ID))
            .await?;
        assert_eq!(snapshot.min_warm, 1);

        // The orphaned execution failed instead of hanging forever.
        let after = ts
            .service
            .store
            .execution(&stale.record.id)
            .await?
            .expect("execution record must exist");
        assert_eq!(after.record.status, ExecutionStatus::Failed);
        Ok(())
    }
}
