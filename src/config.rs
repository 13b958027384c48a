//! Configuration management for rusty-dyndns.

use crate::error::{DdnsError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration structure.
///
/// Loaded once at startup and shared read-only with every request handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Nameserver the update program talks to.
    #[serde(default = "default_server")]
    pub server: String,

    /// Default zone; a trailing dot is allowed.
    #[serde(default)]
    pub zone: String,

    /// Shared secret. When unset the server runs in delegated mode and the
    /// nameserver verifies the supplied key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,

    /// TTL in seconds for added records.
    #[serde(default = "default_ttl")]
    pub record_ttl: u32,

    /// Path to the update program.
    #[serde(default = "default_nsupdate_binary")]
    pub nsupdate_binary: String,

    /// Extra arguments for the update program (e.g. `-k /etc/ddns.key`).
    #[serde(default)]
    pub nsupdate_args: Vec<String>,

    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Log verbosity. 1 or higher mirrors update commands to the log.
    #[serde(default)]
    pub log_level: u8,

    /// Client address detection.
    #[serde(default)]
    pub client_ip: ClientIpConfig,

    /// Record expiry settings.
    #[serde(default)]
    pub expiry: ExpiryConfig,
}

fn default_server() -> String {
    "localhost".to_string()
}

fn default_ttl() -> u32 {
    300
}

fn default_nsupdate_binary() -> String {
    "nsupdate".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Order in which a comma-separated forwarding header is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanDirection {
    /// Rightmost entry first (proxies that append).
    #[default]
    RightToLeft,
    /// Leftmost entry first (proxies that prepend).
    LeftToRight,
}

/// Client address detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIpConfig {
    /// Trusted forwarding headers, highest priority first.
    #[serde(default = "default_headers")]
    pub headers: Vec<String>,

    /// Scan direction within a header.
    #[serde(default)]
    pub scan: ScanDirection,
}

fn default_headers() -> Vec<String> {
    vec!["X-Real-Ip".to_string(), "X-Forwarded-For".to_string()]
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            headers: default_headers(),
            scan: ScanDirection::default(),
        }
    }
}

/// Expiry store and sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    /// Lifetime of an updated record. Expiry tracking is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_expiry_secs: Option<u64>,

    /// JSON file backing the store. In-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Sweeper period in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of concurrent expiry deletions.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    16
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            record_expiry_secs: None,
            store_path: None,
            sweep_interval_secs: default_sweep_interval(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            zone: String::new(),
            shared_secret: None,
            record_ttl: default_ttl(),
            nsupdate_binary: default_nsupdate_binary(),
            nsupdate_args: Vec::new(),
            listen: default_listen(),
            log_level: 0,
            client_ip: ClientIpConfig::default(),
            expiry: ExpiryConfig::default(),
        }
    }
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub zone: Option<String>,
    pub shared_secret: Option<String>,
    pub nsupdate_binary: Option<String>,
    pub record_ttl: Option<u32>,
    pub listen: Option<SocketAddr>,
    pub log_level: Option<u8>,
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| DdnsError::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("rusty-dyndns").join("config.toml"))
    }

    /// Load configuration from a specific path.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML. A missing
    /// or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DdnsError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: Config = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                DdnsError::Config(format!("Malformed {}: {}", path.display(), e))
            })?
        } else {
            toml::from_str(&content)?
        };

        Ok(config)
    }

    /// Apply command line overrides.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(server) = overrides.server {
            self.server = server;
        }
        if let Some(zone) = overrides.zone {
            self.zone = zone;
        }
        if let Some(secret) = overrides.shared_secret {
            self.shared_secret = Some(secret);
        }
        if let Some(binary) = overrides.nsupdate_binary {
            self.nsupdate_binary = binary;
        }
        if let Some(ttl) = overrides.record_ttl {
            self.record_ttl = ttl;
        }
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
    }

    /// Check the values needed to run update sessions.
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(DdnsError::Config("server is empty".to_string()));
        }
        if self.nsupdate_binary.trim().is_empty() {
            return Err(DdnsError::Config("nsupdate_binary is empty".to_string()));
        }
        if self.record_ttl == 0 {
            return Err(DdnsError::Config("record_ttl must be positive".to_string()));
        }
        if self.expiry.sweep_interval_secs == 0 {
            return Err(DdnsError::Config(
                "expiry.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.expiry.max_in_flight == 0 {
            return Err(DdnsError::Config(
                "expiry.max_in_flight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether credentials are checked against a configured shared secret.
    pub fn uses_shared_secret(&self) -> bool {
        self.shared_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Whether update commands are mirrored to the log.
    pub fn log_commands(&self) -> bool {
        self.log_level >= 1
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Generate example configuration.
    pub fn example() -> Self {
        Self {
            server: "ns1.example.org".to_string(),
            zone: "dyn.example.org.".to_string(),
            shared_secret: Some("changeme".to_string()),
            nsupdate_args: vec!["-k".to_string(), "/etc/bind/ddns.key".to_string()],
            expiry: ExpiryConfig {
                record_expiry_secs: Some(86400),
                store_path: Some(PathBuf::from("/var/lib/rusty-dyndns/expiry.json")),
                ..ExpiryConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server, "localhost");
        assert_eq!(config.record_ttl, 300);
        assert_eq!(config.nsupdate_binary, "nsupdate");
        assert_eq!(config.client_ip.headers, vec!["X-Real-Ip", "X-Forwarded-For"]);
        assert_eq!(config.client_ip.scan, ScanDirection::RightToLeft);
        assert!(config.validate().is_ok());
        assert!(!config.uses_shared_secret());
    }

    #[test]
    fn test_example_config_round_trips_through_toml() {
        let rendered = Config::example().to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.zone, "dyn.example.org.");
        assert_eq!(parsed.expiry.record_expiry_secs, Some(86400));
        assert!(parsed.uses_shared_secret());
    }

    #[test]
    fn test_load_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"server": "ns.example.org", "zone": "example.org.", "record_ttl": 60,
                "client_ip": {{"scan": "left-to-right"}}}}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server, "ns.example.org");
        assert_eq!(config.record_ttl, 60);
        assert_eq!(config.client_ip.scan, ScanDirection::LeftToRight);
        assert_eq!(config.nsupdate_binary, "nsupdate");
    }

    #[test]
    fn test_load_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "server = \"10.0.0.53\"\nshared_secret = \"s3cret\"\n\n[expiry]\nrecord_expiry_secs = 120\n"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server, "10.0.0.53");
        assert_eq!(config.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.expiry.record_expiry_secs, Some(120));
        assert_eq!(config.expiry.sweep_interval_secs, 10);
    }

    #[test]
    fn test_missing_or_malformed_config_is_an_error() {
        assert!(Config::load_from(Path::new("/nonexistent/dyndns.json")).is_err());

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Config::load_from(file.path()),
            Err(DdnsError::Config(_))
        ));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = Config {
            server: "from-file".to_string(),
            record_ttl: 60,
            ..Config::default()
        };
        config.apply(Overrides {
            server: Some("from-flag".to_string()),
            log_level: Some(1),
            ..Overrides::default()
        });

        assert_eq!(config.server, "from-flag");
        assert_eq!(config.record_ttl, 60);
        assert!(config.log_commands());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = Config {
            record_ttl: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
