use std::sync::Arc;

use anyhow::Result;
use blob_store::{PackageStore, PackageStoreConfig};
use processor::{
    driver::memory::{MemoryDriver, MemoryDriverConfig},
    instance_client::StubInstanceClient,
};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

/// Service wired against the in-memory driver and a scriptable instance
/// client, with packages written to a tempdir that lives as long as the
/// harness.
pub struct TestService {
    pub service: Service,
    pub driver: Arc<MemoryDriver>,
    pub client: Arc<StubInstanceClient>,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(mut config: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        config.package_store =
            PackageStoreConfig::new(temp_dir.path().join("packages").to_str().unwrap());

        let packages = Arc::new(PackageStore::new(config.package_store.clone())?);
        let driver = Arc::new(MemoryDriver::new(MemoryDriverConfig::default()));
        let client = Arc::new(StubInstanceClient::new());
        let service = Service::with_backend(config, driver.clone(), client.clone(), packages)?;

        Ok(Self {
            service,
            driver,
            client,
            _temp_dir: temp_dir,
        })
    }
}
