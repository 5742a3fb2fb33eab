use tile_proxy::config::TileProxyConfig;
use tile_proxy::ProxyError;

#[test]
fn test_load_sample_config() {
    let config = TileProxyConfig::from_file("tile_proxy.yaml");
    assert!(config.is_ok(), "Failed to load sample config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.tile_size, 4194304);
    assert_eq!(config.proxy_prefix, "/largefile/");
    assert_eq!(config.cache_version_name(), "tile-proxy-v1");
    assert_eq!(config.precache_assets.len(), 4);
    assert!(config.tile_store.enabled);
    assert!(config.upstream.api.is_some());
    assert_eq!(config.upstream.fallbacks.len(), 1);
    assert!(config.admin_endpoint.as_ref().unwrap().enabled);
}

#[test]
fn test_load_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minimal.yaml");
    std::fs::write(&path, "origin: \"https://app.example.com\"\n").unwrap();

    let config = TileProxyConfig::from_file(&path).unwrap();
    assert_eq!(config.origin, "https://app.example.com");
    // Defaults are applied
    assert_eq!(config.tile_size, 4 * 1024 * 1024);
    assert_eq!(config.cache_buster_param, "v");
    assert_eq!(config.offline_shell, "/offline.html");
    assert_eq!(config.max_retries, 2);
    assert!(config.activate_immediately);
    assert!(config.tile_store.enabled);
    assert!(config.upstream.api.is_none());
}

#[test]
fn test_load_invalid_tile_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invalid.yaml");
    std::fs::write(&path, "tile_size: 1024\n").unwrap();

    match TileProxyConfig::from_file(&path) {
        Err(ProxyError::ConfigError(msg)) => assert!(msg.contains("tile_size")),
        other => panic!("expected ConfigError, got {:?}", other),
    }
}

#[test]
fn test_template_without_id_is_rejected() {
    let yaml = r#"
upstream:
  fallbacks:
    - url_template: "https://mirror.example.com/static"
"#;
    assert!(TileProxyConfig::from_yaml(yaml).is_err());
}

#[test]
fn test_origin_with_path_is_rejected() {
    assert!(TileProxyConfig::from_yaml("origin: \"https://app.example.com/app\"\n").is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = TileProxyConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}
