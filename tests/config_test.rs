//! Config loading and defaults integration tests

use std::path::PathBuf;

use rarity_gate::config::Config;

#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[node]
installation_id = "work-laptop"
data_dir = "/tmp/rarity-gate-test"

[remote]
gateway_url = "http://localhost:9000/api"
timeout_secs = 2

[policy]
grace_buffer = 15.0
enabled_by_default = false
blocklist = ["facebook.com", "tiktok.com"]
allowlist = ["docs.rs"]
internal_prefixes = ["chrome-extension://"]
block_page_url = "http://127.0.0.1:9999/blocked"
alternative_threshold = 90.0

[reconcile]
interval_secs = 600
on_startup = false

[api]
http_port = 9999
"#;

    let config = Config::from_toml(toml_str).expect("valid config");

    assert_eq!(config.node.installation_id, "work-laptop");
    assert_eq!(config.node.data_dir, PathBuf::from("/tmp/rarity-gate-test"));
    assert_eq!(config.remote.gateway_url, "http://localhost:9000/api");
    assert_eq!(config.remote.timeout_secs, 2);
    assert_eq!(config.policy.grace_buffer, 15.0);
    assert!(!config.policy.enabled_by_default);
    assert_eq!(config.policy.allowlist, vec!["docs.rs".to_string()]);
    assert_eq!(config.policy.alternative_threshold, 90.0);
    assert_eq!(config.reconcile.interval_secs, 600);
    assert!(!config.reconcile.on_startup);
    assert_eq!(config.api.http_port, 9999);
    assert_eq!(
        config.state_db_path(),
        PathBuf::from("/tmp/rarity-gate-test/state.db")
    );
}

#[test]
fn test_default_lists() {
    let config = Config::default();
    for host in ["github.com", "stackoverflow.com", "arxiv.org", "scholar.google.com"] {
        assert!(config.policy.allowlist.iter().any(|h| h == host), "missing {}", host);
    }
    assert!(config.policy.internal_prefixes.iter().any(|p| p == "moz-extension://"));
    assert!(config.reconcile.on_startup);
}

#[test]
fn test_wrong_type_is_rejected() {
    assert!(Config::from_toml("[api]\nhttp_port = \"eighty\"\n").is_err());
}
