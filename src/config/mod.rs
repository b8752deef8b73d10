//! Configuration types for A3S Config Service
//!
//! Two independent documents, both written in HCL:
//! - [`ServiceConfig`] for the hosting side (provider, publisher, fetch endpoint)
//! - [`RemoteClientSettings`] for clients (remote endpoint, layers, subscriber)
//!
//! Settings are immutable once loaded; `validate()` runs before any network
//! activity and fails fast with a descriptive [`ConfigServiceError::Config`].

mod client;
mod transport;

pub use client::{LocalFileConfig, RemoteClientSettings, RemoteResourceConfig};
pub use transport::{RabbitMqOptions, RedisConnection, RedisOptions};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{ConfigServiceError, Result};

/// Hosting-side configuration
///
/// # HCL Example
///
/// ```hcl
/// listen = "0.0.0.0:8088"
///
/// provider {
///   file {
///     root                   = "/etc/a3s/config"
///     extensions             = ["json", "ini"]
///     include_subdirectories = true
///   }
/// }
///
/// rabbitmq {
///   hostname = "mq.internal"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address of the HTTP fetch endpoint (default: 0.0.0.0:8088)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Content provider settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Redis publisher settings
    #[serde(default)]
    pub redis: Option<RedisConnection>,

    /// RabbitMQ publisher settings
    #[serde(default)]
    pub rabbitmq: Option<RabbitMqOptions>,
}

fn default_listen() -> String {
    "0.0.0.0:8088".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            provider: ProviderConfig::default(),
            redis: None,
            rabbitmq: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an HCL file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConfigServiceError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| ConfigServiceError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        match self.provider.file {
            Some(ref file) => file.validate()?,
            None => {
                return Err(ConfigServiceError::Config(
                    "A provider must be configured (provider.file)".to_string(),
                ))
            }
        }

        if let Some(ref redis) = self.redis {
            redis.validate()?;
        }
        if let Some(ref rabbitmq) = self.rabbitmq {
            rabbitmq.validate()?;
        }

        Ok(())
    }

    /// Parsed fetch endpoint address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|e| {
            ConfigServiceError::Config(format!("Invalid listen address '{}': {}", self.listen, e))
        })
    }
}

/// Content provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// File-system provider
    #[serde(default)]
    pub file: Option<FileProviderConfig>,
}

/// File-system provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProviderConfig {
    /// Directory whose files are the distributed resources
    pub root: PathBuf,

    /// File extensions to include, without the dot (empty: every file)
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Descend into subdirectories (default: true)
    #[serde(default = "default_include_subdirectories")]
    pub include_subdirectories: bool,
}

fn default_include_subdirectories() -> bool {
    true
}

impl FileProviderConfig {
    /// Provider over every file below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
            include_subdirectories: default_include_subdirectories(),
        }
    }

    /// Validate the provider settings
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigServiceError::Config(
                "provider.file.root cannot be empty".to_string(),
            ));
        }
        if self.extensions.iter().any(|e| e.is_empty()) {
            return Err(ConfigServiceError::Config(
                "provider.file.extensions cannot contain empty entries".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServiceConfig {
        ServiceConfig {
            provider: ProviderConfig {
                file: Some(FileProviderConfig::new("/etc/a3s/config")),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_listen() {
        let config = ServiceConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8088");
        assert!(config.redis.is_none());
        assert!(config.rabbitmq.is_none());
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_provider() {
        let err = ServiceConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("provider"));
    }

    #[test]
    fn test_validate_bad_listen() {
        let mut config = valid_config();
        config.listen = "nowhere".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_root() {
        let mut config = valid_config();
        config.provider.file = Some(FileProviderConfig::new(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_extension() {
        let mut config = valid_config();
        if let Some(ref mut file) = config.provider.file {
            file.extensions = vec!["json".into(), String::new()];
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_hcl_full() {
        let hcl = r#"
listen = "127.0.0.1:9000"

provider {
  file {
    root                   = "/srv/config"
    extensions             = ["json", "ini"]
    include_subdirectories = false
  }
}

redis = "cache:6379"

rabbitmq {
  hostname = "mq"
  exchange = "cfg"
}
"#;
        let config = ServiceConfig::from_hcl(hcl).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        let file = config.provider.file.as_ref().unwrap();
        assert_eq!(file.root, PathBuf::from("/srv/config"));
        assert_eq!(file.extensions, vec!["json", "ini"]);
        assert!(!file.include_subdirectories);
        assert_eq!(
            config.redis,
            Some(RedisConnection::ConnectionString("cache:6379".into()))
        );
        let rabbit = config.rabbitmq.as_ref().unwrap();
        assert_eq!(rabbit.hostname, "mq");
        assert_eq!(rabbit.exchange, "cfg");
        assert_eq!(rabbit.username, "guest");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_hcl_invalid() {
        assert!(ServiceConfig::from_hcl("listen = ").is_err());
    }

    #[tokio::test]
    async fn test_from_file_missing() {
        let err = ServiceConfig::from_file("/nonexistent/service.hcl")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
