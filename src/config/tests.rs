use super::Config;
use std::time::Duration;

// Environment-variable tests mutate process-global state, so everything
// that touches the environment lives in this single test to avoid
// interference between parallel test threads.
#[test]
fn test_env_overrides_and_fallbacks() {
    for name in [
        "PG_SECRET",
        "PROXY_PORT",
        "METRICS_PORT",
        "PG_CONNECT_TIMEOUT",
        "PG_BUFFER_SIZE",
        "PG_LOG_SAMPLE_RATE",
        "PG_HEALTH_CHECK_INTERVAL",
        "PG_STICKY_TTL",
        "PG_PROXY_LIST",
        "PG_PROXY_FILE",
        "PG_ENABLE_AUTH",
        "PG_MAX_LATENCY",
        "PG_HIGH_USAGE_THRESHOLD",
    ] {
        std::env::remove_var(name);
    }

    let cfg = Config::from_env();
    assert_eq!(cfg.proxy_port, 8888);
    assert_eq!(cfg.metrics_port, 9090);
    assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
    assert_eq!(cfg.buffer_size, 65536);
    assert_eq!(cfg.log_sample_rate, 1000);
    assert_eq!(cfg.health_check_interval, Duration::from_secs(60));
    assert_eq!(cfg.sticky_ttl_secs, 0);
    assert!(cfg.upstream_list.is_empty());
    assert_eq!(
        cfg.upstream_file.as_deref(),
        Some(std::path::Path::new("proxies.txt"))
    );
    assert!(cfg.enable_auth);
    assert_eq!(cfg.max_latency_ms, 500);
    assert_eq!(cfg.high_usage_threshold, 50);

    std::env::set_var("PG_SECRET", "s3cr3t");
    std::env::set_var("PROXY_PORT", "18888");
    std::env::set_var("PG_CONNECT_TIMEOUT", "2");
    std::env::set_var("PG_PROXY_LIST", "http://1.1.1.1:8080, http://2.2.2.2:8080,");
    std::env::set_var("PG_PROXY_FILE", "");
    std::env::set_var("PG_ENABLE_AUTH", "FALSE");
    std::env::set_var("PG_STICKY_TTL", "not-a-number");

    let cfg = Config::from_env();
    assert_eq!(cfg.secret, b"s3cr3t");
    assert_eq!(cfg.proxy_port, 18888);
    assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
    assert_eq!(
        cfg.upstream_list,
        vec!["http://1.1.1.1:8080", "http://2.2.2.2:8080"]
    );
    assert_eq!(cfg.upstream_file, None);
    assert!(!cfg.enable_auth);
    // Unparseable value falls back to the default.
    assert_eq!(cfg.sticky_ttl_secs, 0);

    for name in [
        "PG_SECRET",
        "PROXY_PORT",
        "PG_CONNECT_TIMEOUT",
        "PG_PROXY_LIST",
        "PG_PROXY_FILE",
        "PG_ENABLE_AUTH",
        "PG_STICKY_TTL",
    ] {
        std::env::remove_var(name);
    }
}
