//! Aggregator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `FAVE_` environment variables (`FAVE_QUEUE_CAPACITY`,
//! `FAVE_ENGINE__ENDPOINTS=/tmp/np1.socket,/tmp/np2.socket`, ...).

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use rust_fave_common::{types::DEFAULT_MAX_FRAME_SIZE, FieldMapping};
use rust_fave_rpc::EngineOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default path of the aggregator's Unix domain socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/np_aggregator.socket";

/// Default capacity of the inbound message queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Aggregator configuration options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// TCP address to listen on, if any
    pub listen: Option<String>,

    /// Unix domain socket to listen on, if any
    pub socket: Option<PathBuf>,

    /// Maximum number of queued messages before producers are slowed down
    pub queue_capacity: usize,

    /// Largest accepted frame payload (in bytes)
    pub max_frame_size: usize,

    /// Verification engine connection
    pub engine: EngineOptions,

    /// JSON file holding the initial field mapping
    pub mapping_file: Option<PathBuf>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen: None,
            socket: Some(PathBuf::from(DEFAULT_SOCKET_PATH)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            engine: EngineOptions::default(),
            mapping_file: None,
        }
    }
}

impl AggregatorConfig {
    /// Load the configuration, reading `path` if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("FAVE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.endpoints")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.is_none() && self.socket.is_none() {
            anyhow::bail!("Neither a TCP address nor a unix socket to listen on");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be positive");
        }
        if self.engine.endpoints.is_empty() {
            anyhow::bail!("No verification engine endpoint configured");
        }
        Ok(())
    }

    /// Initial field mapping: the mapping file if configured, else empty.
    pub fn initial_mapping(&self) -> Result<FieldMapping> {
        match &self.mapping_file {
            Some(path) => {
                let contents = std::fs::read(path)
                    .with_context(|| format!("Failed to read mapping file {}", path.display()))?;
                serde_json::from_slice(&contents)
                    .with_context(|| format!("Invalid mapping file {}", path.display()))
            }
            None => Ok(FieldMapping::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_fave_rpc::Endpoint;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AggregatorConfig::default();
        assert_eq!(config.socket.as_deref(), Some(Path::new(DEFAULT_SOCKET_PATH)));
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_frame_size, 64 * 1024 * 1024);
        assert!(config.initial_mapping().unwrap().is_empty());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
listen = "127.0.0.1:44000"
queue_capacity = 16

[engine]
endpoints = ["/tmp/np1.socket", "127.0.0.1:44001"]
connect_retries = 2
"#
        )
        .unwrap();

        let config = AggregatorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:44000"));
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(
            config.engine.endpoints,
            vec![
                Endpoint::Unix("/tmp/np1.socket".into()),
                Endpoint::Tcp("127.0.0.1:44001".into()),
            ]
        );
        assert_eq!(config.engine.connect_retries, 2);
        // Untouched values keep their defaults.
        assert_eq!(config.engine.retry_delay_ms, 1000);
        assert_eq!(config.socket.as_deref(), Some(Path::new(DEFAULT_SOCKET_PATH)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_rejects_empty_queue() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "queue_capacity = 0").unwrap();
        assert!(AggregatorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_mapping_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"packet.ether.vlan": 0, "length": 16}}"#).unwrap();

        let config = AggregatorConfig {
            mapping_file: Some(file.path().to_path_buf()),
            ..AggregatorConfig::default()
        };
        let mapping = config.initial_mapping().unwrap();
        assert_eq!(mapping.length(), 16);
        assert_eq!(mapping.offset_of("packet.ether.vlan").unwrap(), 0);
    }
}
