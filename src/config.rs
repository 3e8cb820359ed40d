//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Installation key for the persisted record
    #[serde(default = "default_installation_id")]
    pub installation_id: String,

    /// Data directory (holds `state.db`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            installation_id: default_installation_id(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the scoring / tier authority
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Policy (interception) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Margin above the tier threshold before a warning is issued
    #[serde(default = "default_grace_buffer")]
    pub grace_buffer: f64,

    /// Policy mode for a fresh installation
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,

    /// Hostname substrings that are always blocked
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,

    /// Hostname substrings that are never scored
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,

    /// URL prefixes that belong to the client itself
    #[serde(default = "default_internal_prefixes")]
    pub internal_prefixes: Vec<String>,

    /// Local page shown for blocked navigations
    #[serde(default = "default_block_page_url")]
    pub block_page_url: String,

    /// Rarity threshold requested from the alternative generator
    #[serde(default = "default_alternative_threshold")]
    pub alternative_threshold: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            grace_buffer: default_grace_buffer(),
            enabled_by_default: true,
            blocklist: default_blocklist(),
            allowlist: default_allowlist(),
            internal_prefixes: default_internal_prefixes(),
            block_page_url: default_block_page_url(),
            alternative_threshold: default_alternative_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Reconcile period in seconds (0 = disabled)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Reconcile once immediately at startup
    #[serde(default = "default_true")]
    pub on_startup: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP port for the navigation/command surface
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

impl Config {
    /// Parse a TOML document; absent sections fall back to defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Path of the SQLite state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.node.data_dir.join("state.db")
    }
}

// Defaults
fn default_installation_id() -> String { "default".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/rarity-gate") }
fn default_gateway_url() -> String { "https://suresh-ai-origin.onrender.com/api".to_string() }
fn default_timeout_secs() -> u64 { 5 }
fn default_grace_buffer() -> f64 { 20.0 }
fn default_true() -> bool { true }
fn default_blocklist() -> Vec<String> {
    [
        "facebook.com",
        "twitter.com",
        "instagram.com",
        "tiktok.com",
        "reddit.com",
        "youtube.com",
        "9gag.com",
        "buzzfeed.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_allowlist() -> Vec<String> {
    ["github.com", "stackoverflow.com", "arxiv.org", "scholar.google.com"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_internal_prefixes() -> Vec<String> {
    vec!["chrome-extension://".to_string(), "moz-extension://".to_string()]
}
fn default_block_page_url() -> String { "http://127.0.0.1:8088/blocked".to_string() }
fn default_alternative_threshold() -> f64 { 95.0 }
fn default_reconcile_interval() -> u64 { 3600 } // 1 hour
fn default_http_port() -> u16 { 8088 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.remote.timeout_secs, 5);
        assert_eq!(config.policy.grace_buffer, 20.0);
        assert_eq!(config.reconcile.interval_secs, 3600);
        assert!(config.policy.blocklist.iter().any(|s| s == "facebook.com"));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
[policy]
grace_buffer = 10.0
blocklist = ["example.org"]
"#,
        )
        .unwrap();

        assert_eq!(config.policy.grace_buffer, 10.0);
        assert_eq!(config.policy.blocklist, vec!["example.org".to_string()]);
        assert!(config.policy.enabled_by_default);
        assert_eq!(config.api.http_port, 8088);
    }

    #[test]
    fn test_state_db_path() {
        let mut config = Config::default();
        config.node.data_dir = PathBuf::from("/tmp/gate");
        assert_eq!(config.state_db_path(), PathBuf::from("/tmp/gate/state.db"));
    }
}
