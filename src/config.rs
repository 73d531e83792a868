use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Node identifier, used in logs
    pub node_id: u64,
    pub bind_ip: String,
    pub bind_port: u16,
    /// Total configured bucket count
    pub buckets: u64,
    /// Reduction factor; keys hash into `buckets / reduce_buckets` buckets
    #[serde(default = "default_reduce_buckets")]
    pub reduce_buckets: u64,
    /// Bucket number -> backend address
    pub bucket_servers: BTreeMap<u64, String>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Capacity of the per-client queue between reader and writer
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Slots per backend; 0 selects the pool's built-in default
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Dial attempts per connection request
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Deadline for reading one backend reply
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl PoolConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            dial_timeout_ms: default_dial_timeout_ms(),
            retries: default_retries(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

fn default_reduce_buckets() -> u64 {
    1
}
fn default_pipeline_depth() -> usize {
    crate::core::pipeline::DEFAULT_PIPELINE_DEPTH
}
fn default_pool_size() -> usize {
    600
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_retries() -> usize {
    2
}
fn default_read_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ConfigError::FileNotFound(path.to_string()),
                _ => ConfigError::IoError(e.to_string()),
            })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_ip.is_empty() {
            return Err(ConfigError::ValidationError(
                "bind_ip must not be empty".to_string(),
            ));
        }
        if self.buckets == 0 {
            return Err(ConfigError::ValidationError(
                "buckets must be greater than zero".to_string(),
            ));
        }
        if self.reduce_buckets == 0 || self.buckets % self.reduce_buckets != 0 {
            return Err(ConfigError::ValidationError(format!(
                "reduce_buckets ({}) must evenly divide buckets ({})",
                self.reduce_buckets, self.buckets
            )));
        }
        if self.bucket_servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "bucket_servers must map at least one bucket".to_string(),
            ));
        }
        for (bucket, addr) in &self.bucket_servers {
            if *bucket >= self.buckets {
                return Err(ConfigError::ValidationError(format!(
                    "bucket {} is out of range (buckets: {})",
                    bucket, self.buckets
                )));
            }
            if addr.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "bucket {} has an empty server address",
                    bucket
                )));
            }
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline_depth must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Listener address as `ip:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.bind_port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
