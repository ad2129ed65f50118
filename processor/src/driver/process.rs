use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use blob_store::PackageStore;
use dashmap::DashMap;
use data_model::{Instance, InstanceId, InstanceState, Runtime, RuntimeId, TerminationReason};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{feed::HealthFeed, ClusterDriver, DriverError, HealthStream, PoolHandle};

/// Runtime images whose name starts with this prefix are packages in the
/// package store; the driver materializes them on disk before spawning.
pub const BUNDLE_IMAGE_PREFIX: &str = "pkg://";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDriverConfig {
    /// Image name to command template. Templates may reference `{port}`.
    #[serde(default)]
    pub images: HashMap<String, String>,

    /// Command template for `pkg://` images. `{bundle}` expands to the path
    /// of the materialized package, `{port}` to the listen port.
    #[serde(default)]
    pub bundle_command: Option<String>,

    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Scratch directory for materialized bundles. Defaults to the system
    /// temp directory.
    #[serde(default)]
    pub workdir: Option<String>,
}

fn default_boot_timeout_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    200
}

impl Default for ProcessDriverConfig {
    fn default() -> Self {
        Self {
            images: HashMap::new(),
            bundle_command: None,
            boot_timeout_ms: default_boot_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            workdir: None,
        }
    }
}

struct ManagedInstance {
    record: Mutex<Instance>,
    stop: CancellationToken,
    stop_reason: Mutex<Option<TerminationReason>>,
}

struct ProcessPool {
    runtime: Mutex<Runtime>,
    feed: HealthFeed,
    instances: tokio::sync::Mutex<HashMap<InstanceId, Arc<ManagedInstance>>>,
}

#[derive(Debug, Clone)]
struct CommandSpec {
    template: String,
    bundle: Option<String>,
}

struct ProcessInner {
    pools: DashMap<RuntimeId, Arc<ProcessPool>>,
    packages: Arc<PackageStore>,
    http: reqwest::Client,
    config: ProcessDriverConfig,
    workdir: PathBuf,
}

/// Runs instances as local child processes. Each instance gets a loopback
/// port, is probed on `/healthz` until it answers, and is supervised until
/// it exits or is told to stop.
pub struct ProcessDriver {
    inner: Arc<ProcessInner>,
}

impl ProcessDriver {
    pub fn new(config: ProcessDriverConfig, packages: Arc<PackageStore>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_interval_ms.max(50)))
            .build()?;
        let workdir = config
            .workdir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-instances"));
        Ok(Self {
            inner: Arc::new(ProcessInner {
                pools: DashMap::new(),
                packages,
                http,
                config,
                workdir,
            }),
        })
    }
}

impl ProcessInner {
    fn pool(&self, runtime_id: &RuntimeId) -> Result<Arc<ProcessPool>, DriverError> {
        self.pools
            .get(runtime_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DriverError::UnknownRuntime(runtime_id.clone()))
    }

    fn resolve_command(&self, image: &str) -> Result<CommandSpec, DriverError> {
        if let Some(key) = image.strip_prefix(BUNDLE_IMAGE_PREFIX) {
            let template =
                self.config
                    .bundle_command
                    .clone()
                    .ok_or(DriverError::ProvisionFailure {
                        reason: "no bundle_command configured for package images".to_string(),
                    })?;
            return Ok(CommandSpec {
                template,
                bundle: Some(key.to_string()),
            });
        }
        let template =
            self.config
                .images
                .get(image)
                .cloned()
                .ok_or_else(|| DriverError::ProvisionFailure {
                    reason: format!("image {image} is not configured"),
                })?;
        Ok(CommandSpec {
            template,
            bundle: None,
        })
    }

    /// Fetches a `pkg://` bundle out of the package store into the instance
    /// scratch directory and returns the on-disk path.
    async fn materialize_bundle(
        &self,
        instance_id: &InstanceId,
        key: &str,
    ) -> Result<PathBuf, DriverError> {
        let dir = self.workdir.join(instance_id.get());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::ProvisionFailure {
                reason: format!("creating bundle dir: {e}"),
            })?;
        let bytes =
            self.packages
                .read_bytes(key)
                .await
                .map_err(|e| DriverError::ProvisionFailure {
                    reason: format!("fetching bundle {key}: {e}"),
                })?;
        let path = dir.join("bundle");
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| DriverError::ProvisionFailure {
                reason: format!("writing bundle: {e}"),
            })?;
        debug!(
            instance_id = instance_id.get(),
            bundle = key,
            size = bytes.len(),
            "Materialized bundle"
        );
        Ok(path)
    }

    async fn allocate_port() -> Result<u16, DriverError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DriverError::ProvisionFailure {
                reason: format!("allocating port: {e}"),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| DriverError::ProvisionFailure {
                reason: format!("allocating port: {e}"),
            })?
            .port();
        drop(listener);
        Ok(port)
    }

    async fn boot_instance(
        &self,
        pool: &ProcessPool,
        managed: &ManagedInstance,
        instance_id: &InstanceId,
    ) -> Result<tokio::process::Child, DriverError> {
        let image = pool.runtime.lock().unwrap().image.clone();
        let spec = self.resolve_command(&image)?;
        let bundle_path = match &spec.bundle {
            Some(key) => Some(self.materialize_bundle(instance_id, key).await?),
            None => None,
        };
        let port = Self::allocate_port().await?;
        let argv = render_command(&spec.template, port, bundle_path.as_deref())?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env("KILN_PORT", port.to_string())
            .env("KILN_INSTANCE_ID", instance_id.get())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(bundle) = &bundle_path {
            command.env("KILN_BUNDLE", bundle);
        }
        let mut child = command.spawn().map_err(|e| DriverError::ProvisionFailure {
            reason: format!("spawning {}: {e}", argv[0]),
        })?;

        let endpoint = format!("http://127.0.0.1:{port}");
        let health_url = format!("{endpoint}/healthz");
        let boot_deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.boot_timeout_ms);
        let mut probe = tokio::time::interval(Duration::from_millis(self.config.probe_interval_ms));
        loop {
            tokio::select! {
                _ = probe.tick() => {
                    if tokio::time::Instant::now() >= boot_deadline {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(DriverError::ProvisionFailure {
                            reason: format!(
                                "instance did not answer health probes within {}ms",
                                self.config.boot_timeout_ms
                            ),
                        });
                    }
                    match self.http.get(&health_url).send().await {
                        Ok(resp) if resp.status().is_success() => break,
                        Ok(_) | Err(_) => continue,
                    }
                }
                status = child.wait() => {
                    return Err(DriverError::ProvisionFailure {
                        reason: format!("process exited during boot: {status:?}"),
                    });
                }
                _ = managed.stop.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(DriverError::ProvisionFailure {
                        reason: "terminated while provisioning".to_string(),
                    });
                }
            }
        }

        {
            let mut record = managed.record.lock().unwrap();
            record.state = InstanceState::Ready;
            record.endpoint = Some(endpoint.clone());
        }
        info!(
            instance_id = instance_id.get(),
            endpoint = endpoint.as_str(),
            "Instance ready"
        );
        pool.feed
            .publish(instance_id.clone(), InstanceState::Ready, Some(endpoint));
        Ok(child)
    }

    async fn supervise(
        &self,
        pool: &ProcessPool,
        managed: &ManagedInstance,
        instance_id: &InstanceId,
        mut child: tokio::process::Child,
    ) {
        let reason = tokio::select! {
            _ = managed.stop.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                managed
                    .stop_reason
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or(TerminationReason::Stopped)
            }
            status = child.wait() => {
                debug!(
                    instance_id = instance_id.get(),
                    "Process exited: {status:?}"
                );
                TerminationReason::Crashed
            }
        };
        pool.instances.lock().await.remove(instance_id);
        let scratch = self.workdir.join(instance_id.get());
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        pool.feed.publish(
            instance_id.clone(),
            InstanceState::Terminated { reason },
            None,
        );
    }
}

fn spawn_instance(inner: Arc<ProcessInner>, pool: Arc<ProcessPool>, managed: Arc<ManagedInstance>) {
    tokio::spawn(async move {
        let instance_id = managed.record.lock().unwrap().id.clone();
        match inner.boot_instance(&pool, &managed, &instance_id).await {
            Ok(child) => inner.supervise(&pool, &managed, &instance_id, child).await,
            Err(err) => {
                warn!(
                    instance_id = instance_id.get(),
                    "Provisioning failed: {err:#}"
                );
                pool.instances.lock().await.remove(&instance_id);
                pool.feed
                    .publish_provision_failure(instance_id, format!("{err:#}"));
            }
        }
    });
}

fn render_command(
    template: &str,
    port: u16,
    bundle: Option<&std::path::Path>,
) -> Result<Vec<String>, DriverError> {
    let bundle_arg = bundle
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rendered = template
        .replace("{port}", &port.to_string())
        .replace("{bundle}", &bundle_arg);
    // Whitespace split, no shell quoting. Templates needing a shell should
    // invoke one explicitly.
    let argv: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(DriverError::ProvisionFailure {
            reason: "command template rendered to an empty command".to_string(),
        });
    }
    Ok(argv)
}

#[async_trait]
impl ClusterDriver for ProcessDriver {
    async fn ensure_pool(&self, runtime: &Runtime) -> Result<PoolHandle, DriverError> {
        // Reject unresolvable images at registration rather than on first boot.
        self.inner.resolve_command(&runtime.image)?;
        let pool = self
            .inner
            .pools
            .entry(runtime.id.clone())
            .or_insert_with(|| {
                Arc::new(ProcessPool {
                    runtime: Mutex::new(runtime.clone()),
                    feed: HealthFeed::new(runtime.id.clone()),
                    instances: tokio::sync::Mutex::new(HashMap::new()),
                })
            })
            .clone();
        *pool.runtime.lock().unwrap() = runtime.clone();
        Ok(PoolHandle {
            runtime_id: runtime.id.clone(),
            resume_from: pool.feed.latest_seq(),
        })
    }

    async fn scale(&self, runtime_id: &RuntimeId, desired: usize) -> Result<(), DriverError> {
        let pool = self.inner.pool(runtime_id)?;
        let mut boots = Vec::new();
        {
            let mut instances = pool.instances.lock().await;
            while instances.len() < desired {
                let instance = Instance::new(runtime_id.clone());
                let managed = Arc::new(ManagedInstance {
                    record: Mutex::new(instance.clone()),
                    stop: CancellationToken::new(),
                    stop_reason: Mutex::new(None),
                });
                pool.feed
                    .publish(instance.id.clone(), InstanceState::Provisioning, None);
                instances.insert(instance.id.clone(), managed.clone());
                boots.push(managed);
            }
        }
        for managed in boots {
            spawn_instance(self.inner.clone(), pool.clone(), managed);
        }
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        reason: TerminationReason,
    ) -> Result<(), DriverError> {
        for entry in self.inner.pools.iter() {
            let instances = entry.value().instances.lock().await;
            if let Some(managed) = instances.get(instance_id) {
                *managed.stop_reason.lock().unwrap() = Some(reason);
                // A serving instance drains until the child is reaped; the
                // Terminated event follows from its supervisor.
                let draining = {
                    let mut record = managed.record.lock().unwrap();
                    if record.state == InstanceState::Ready {
                        record.state = InstanceState::Draining;
                        Some(record.endpoint.clone())
                    } else {
                        None
                    }
                };
                if let Some(endpoint) = draining {
                    entry.value().feed.publish(
                        instance_id.clone(),
                        InstanceState::Draining,
                        endpoint,
                    );
                }
                managed.stop.cancel();
                return Ok(());
            }
        }
        Err(DriverError::UnknownInstance(instance_id.clone()))
    }

    async fn instance_endpoint(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<String>, DriverError> {
        for entry in self.inner.pools.iter() {
            let instances = entry.value().instances.lock().await;
            if let Some(managed) = instances.get(instance_id) {
                return Ok(managed.record.lock().unwrap().endpoint.clone());
            }
        }
        Err(DriverError::UnknownInstance(instance_id.clone()))
    }

    async fn list_instances(&self, runtime_id: &RuntimeId) -> Result<Vec<Instance>, DriverError> {
        let pool = self.inner.pool(runtime_id)?;
        let instances = pool.instances.lock().await;
        Ok(instances
            .values()
            .map(|managed| managed.record.lock().unwrap().clone())
            .collect())
    }

    fn watch_health(
        &self,
        runtime_id: &RuntimeId,
        after_seq: u64,
    ) -> Result<HealthStream, DriverError> {
        let pool = self.inner.pool(runtime_id)?;
        pool.feed.subscribe(after_seq)
    }

    async fn remove_pool(&self, runtime_id: &RuntimeId) -> Result<(), DriverError> {
        let Some((_, pool)) = self.inner.pools.remove(runtime_id) else {
            return Err(DriverError::UnknownRuntime(runtime_id.clone()));
        };
        let instances = pool.instances.lock().await;
        for managed in instances.values() {
            *managed.stop_reason.lock().unwrap() = Some(TerminationReason::RuntimeRemoved);
            managed.stop.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_runtime;

    use super::*;

    fn driver_with_images(
        images: &[(&str, &str)],
        bundle_command: Option<&str>,
    ) -> (tempfile::TempDir, ProcessDriver) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessDriverConfig {
            images: images
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            bundle_command: bundle_command.map(str::to_string),
            ..Default::default()
        };
        let store = PackageStore::new(blob_store::PackageStoreConfig::new(
            dir.path().to_str().unwrap(),
        ))
        .unwrap();
        (dir, ProcessDriver::new(config, Arc::new(store)).unwrap())
    }

    #[test]
    fn render_substitutes_port_and_bundle() {
        let argv = render_command(
            "python3 server.py --port {port} --code {bundle}",
            8081,
            Some(std::path::Path::new("/tmp/x/bundle")),
        )
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "python3",
                "server.py",
                "--port",
                "8081",
                "--code",
                "/tmp/x/bundle"
            ]
        );
    }

    #[test]
    fn empty_command_template_is_rejected() {
        assert!(matches!(
            render_command("{bundle}", 80, None),
            Err(DriverError::ProvisionFailure { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_image_is_rejected_at_registration() {
        let (_dir, driver) = driver_with_images(&[("py39", "python3 worker.py --port {port}")], None);
        let mut runtime = mock_runtime("rt_proc");
        runtime.image = "py39".to_string();
        driver.ensure_pool(&runtime).await.unwrap();

        runtime.image = "missing".to_string();
        assert!(matches!(
            driver.ensure_pool(&runtime).await,
            Err(DriverError::ProvisionFailure { .. })
        ));
    }

    #[tokio::test]
    async fn bundle_images_require_a_bundle_command() {
        let (_dir, driver) = driver_with_images(&[], None);
        let mut runtime = mock_runtime("rt_proc");
        runtime.image = "pkg://sha256/abcdef".to_string();
        assert!(matches!(
            driver.ensure_pool(&runtime).await,
            Err(DriverError::ProvisionFailure { .. })
        ));

        let (_dir2, driver) = driver_with_images(&[], Some("python3 {bundle} --port {port}"));
        let handle = driver.ensure_pool(&runtime).await.unwrap();
        assert_eq!(handle.resume_from, 0);
    }

    #[tokio::test]
    async fn allocate_port_returns_a_usable_loopback_port() {
        let port = ProcessInner::allocate_port().await.unwrap();
        assert!(port > 0);
    }
}
