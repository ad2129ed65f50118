use std::{fmt::Debug, net::SocketAddr};

use anyhow::Result;
use blob_store::PackageStoreConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use processor::{
    dispatcher::DispatchConfig,
    driver::{memory::MemoryDriverConfig, process::ProcessDriverConfig},
    jobs::JobEngineConfig,
    pool::PoolManagerConfig,
};
use serde::{Deserialize, Serialize};

/// Which backend runs instances. Exactly one must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub process: Option<ProcessDriverConfig>,
    pub memory: Option<MemoryDriverConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            process: None,
            memory: Some(MemoryDriverConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub package_store: PackageStoreConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub pool: PoolManagerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub jobs: JobEngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:8900".to_string(),
            structured_logging: false,
            package_store: Default::default(),
            driver: Default::default(),
            pool: Default::default(),
            dispatch: Default::default(),
            jobs: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a YAML config file. `KILN_`-prefixed environment variables
    /// override individual keys.
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(&config_str))
            .merge(Env::prefixed("KILN_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.process.is_some() && self.driver.memory.is_some() {
            return Err(anyhow::anyhow!(
                "cannot specify both process and memory drivers"
            ));
        }
        if self.driver.process.is_none() && self.driver.memory.is_none() {
            return Err(anyhow::anyhow!(
                "must specify one of process or memory drivers"
            ));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.driver.memory.is_some());
    }

    #[test]
    fn test_both_drivers_rejected() {
        let mut config = ServerConfig::default();
        config.driver.process = Some(ProcessDriverConfig::default());
        assert!(config.validate().is_err());

        config.driver.memory = None;
        config.driver.process = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_addr_rejected() {
        let mut config = ServerConfig::default();
        config.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_path_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr: 127.0.0.1:9700\ndispatch:\n  default_deadline_ms: 5000\ndriver:\n  memory:\n    boot_delay_ms: 1"
        )
        .unwrap();
        let config = ServerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9700");
        assert_eq!(config.dispatch.default_deadline_ms, 5000);
        assert_eq!(config.driver.memory.unwrap().boot_delay_ms, 1);
        assert!(config.driver.process.is_none());
    }
}
