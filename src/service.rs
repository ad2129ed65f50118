use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::PackageStore;
use metrics::init_provider;
use processor::{
    dispatcher::Dispatcher,
    driver::{memory::MemoryDriver, process::ProcessDriver, ClusterDriver},
    instance_client::{EchoClient, HttpInstanceClient, InstanceClient},
    jobs::JobEngine,
    pool::PoolManager,
};
use state_store::{InMemoryMetadataStore, MetadataStore};
use tokio::{self, signal, sync::watch};
use tracing::info;

use super::routes::RouteState;
use crate::{config::ServerConfig, routes::create_routes, runtimes::RuntimeManager};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<dyn MetadataStore>,
    pub packages: Arc<PackageStore>,
    pub pool: Arc<PoolManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub jobs: Arc<JobEngine>,
    pub runtimes: Arc<RuntimeManager>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let packages = Arc::new(
            PackageStore::new(config.package_store.clone())
                .context("error initializing PackageStore")?,
        );
        let (driver, client) = build_driver(&config, packages.clone())?;
        Self::with_backend(config, driver, client, packages)
    }

    /// Wires the service around explicit driver and client implementations.
    /// Tests use this to swap in scripted backends.
    pub fn with_backend(
        config: ServerConfig,
        driver: Arc<dyn ClusterDriver>,
        client: Arc<dyn InstanceClient>,
        packages: Arc<PackageStore>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let pool = PoolManager::new(driver, config.pool.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            pool.clone(),
            client,
            config.dispatch.clone(),
        );
        let jobs = JobEngine::new(store.clone(), dispatcher.clone(), config.jobs.clone());
        let runtimes = RuntimeManager::new(store.clone(), pool.clone());

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            packages,
            pool,
            dispatcher,
            jobs,
            runtimes,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let _provider = init_provider();

        let restored = self.runtimes.resume().await?;
        let recovered = self.dispatcher.recover().await?;
        info!(
            runtimes = restored,
            interrupted_executions = recovered,
            "State recovered"
        );

        let jobs = self.jobs.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { jobs.start(shutdown_rx).await });

        let route_state = RouteState {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            runtimes: self.runtimes.clone(),
            packages: self.packages.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        self.pool.shutdown();
        Ok(())
    }
}

fn build_driver(
    config: &ServerConfig,
    packages: Arc<PackageStore>,
) -> Result<(Arc<dyn ClusterDriver>, Arc<dyn InstanceClient>)> {
    if let Some(process) = &config.driver.process {
        let driver: Arc<dyn ClusterDriver> =
            Arc::new(ProcessDriver::new(process.clone(), packages)?);
        let client: Arc<dyn InstanceClient> = Arc::new(HttpInstanceClient::new()?);
        return Ok((driver, client));
    }
    if let Some(memory) = &config.driver.memory {
        let driver: Arc<dyn ClusterDriver> = Arc::new(MemoryDriver::new(memory.clone()));
        let client: Arc<dyn InstanceClient> = Arc::new(EchoClient);
        return Ok((driver, client));
    }
    Err(anyhow::anyhow!("no instance driver configured"))
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    shutdown_tx.send(()).unwrap();
    info!("signal received, shutting down server gracefully");
}
