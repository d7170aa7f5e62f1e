//! kvguard Client Unit Tests
//!
//! Tests for configuration resolution and retry timing.
//! These tests need no store.

use std::io::Write;
use std::time::Duration;

use kvguard_client::config::{DEFAULT_MAX_CONNECTION_RETRIES, DEFAULT_WORKER_COUNT, RETRY_CAP};
use kvguard_client::{RawConfig, RetryStrategy};
use proptest::prelude::*;
use serde_json::json;

// ============== Configuration Resolution Tests ==============

#[test]
fn test_resolve_minimal_config() {
    let raw = RawConfig::from_value(json!({ "storeURL": "store://localhost:6793" })).unwrap();
    let config = raw.resolve().unwrap();

    assert_eq!(config.max_connection_retries(), 10);
    assert_eq!(config.worker_count(), 3);
    assert_eq!(config.retry_delay_millis(), None);
    assert_eq!(config.hostname(), "localhost");
    assert_eq!(config.port(), 6793);
    assert_eq!(config.store_uri(), "store://localhost:6793");
    assert_eq!(DEFAULT_MAX_CONNECTION_RETRIES, 10);
    assert_eq!(DEFAULT_WORKER_COUNT, 3);
}

#[test]
fn test_resolve_is_deterministic() {
    let input = json!({
        "storeURL": "redis://cache.internal:7001",
        "maxConnectionRetries": 4,
        "retryDelayMillis": 250,
        "workerCount": 8,
        "comment": "ignored"
    });

    let a = RawConfig::from_value(input.clone()).unwrap().resolve().unwrap();
    let b = RawConfig::from_value(input).unwrap().resolve().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.endpoint(), b.endpoint());
    assert_eq!(a.retry_strategy(), RetryStrategy::Fixed(Duration::from_millis(250)));
}

#[test]
fn test_resolve_rejects_invalid_input() {
    let cases = [
        json!({}),
        json!({ "storeURL": "" }),
        json!({ "storeURL": "localhost:6793" }),
        json!({ "storeURL": "ftp://localhost" }),
        json!({ "storeURL": "store://localhost", "maxConnectionRetries": 0 }),
        json!({ "storeURL": "store://localhost", "maxConnectionRetries": -3 }),
        json!({ "storeURL": "store://localhost", "workerCount": 0 }),
        json!({ "storeURL": "store://localhost", "retryDelayMillis": -1 }),
    ];

    for case in cases {
        let result = RawConfig::from_value(case.clone()).and_then(RawConfig::resolve);
        assert!(result.is_err(), "expected {} to be rejected", case);
    }
}

#[test]
fn test_load_from_file() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
    write!(
        file,
        r#"{{"storeURL": "stores://secure.example:6380", "maxConnectionRetries": 2}}"#
    )?;
    file.flush()?;

    let config = RawConfig::load(file.path())?.resolve()?;
    assert_eq!(config.hostname(), "secure.example");
    assert_eq!(config.port(), 6380);
    assert_eq!(config.max_connection_retries(), 2);
    assert_eq!(config.worker_count(), 3);
    Ok(())
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = RawConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(err.to_string().contains("failed to read configuration"));
}

// ============== Retry Strategy Tests ==============

#[test]
fn test_linear_delays_for_first_attempts() {
    let strategy = RetryStrategy::default();
    for attempt in 0..=40u32 {
        let expected = (u64::from(attempt) * 50).min(2000);
        assert_eq!(strategy.delay_millis(attempt), expected, "attempt {}", attempt);
    }
}

proptest! {
    #[test]
    fn prop_linear_delay_is_capped(attempt in any::<u32>()) {
        let delay = RetryStrategy::default().delay_for(attempt);
        prop_assert!(delay <= RETRY_CAP);
        prop_assert_eq!(
            delay.as_millis() as u64,
            (u64::from(attempt) * 50).min(2000)
        );
    }

    #[test]
    fn prop_fixed_delay_ignores_attempt(millis in 0u64..100_000, attempt in any::<u32>()) {
        let strategy = RetryStrategy::from_override(Some(millis));
        prop_assert_eq!(strategy.delay_for(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn prop_resolve_accepts_any_positive_retries(retries in 1i64..=1_000_000) {
        let config = RawConfig::new("store://localhost")
            .with_max_connection_retries(retries)
            .resolve()
            .unwrap();
        prop_assert_eq!(i64::from(config.max_connection_retries()), retries);
    }
}
