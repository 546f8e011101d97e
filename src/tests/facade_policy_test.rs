//! Facade policy: retry classification, per-attempt timeouts, and the
//! per-provider circuit breaker.

use super::{database_pair, quick_config};
use anyhow::Result;
use backplane_core::{BackplaneError, BreakerState};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn retryable_read_survives_transient_failure() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    pair.alpha.seed("posts", "p1", json!({"n": 1}));

    pair.alpha.faults().fail_next_ops(1);
    let record = orchestrator.facade().read("posts", "p1").await?;
    assert_eq!(record.map(|r| r.data), Some(json!({"n": 1})));

    let stats = orchestrator.facade().stats();
    let alpha = stats
        .providers
        .get("database:alpha")
        .expect("stats recorded");
    assert!(alpha.attempts >= 2, "attempts: {}", alpha.attempts);
    assert!(alpha.failures >= 1, "failures: {}", alpha.failures);
    assert_eq!(alpha.breaker, BreakerState::Closed);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn create_is_attempted_exactly_once() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();

    pair.alpha.faults().fail_next_ops(1);
    let result = orchestrator.facade().create("posts", json!({"n": 1})).await;
    assert!(matches!(result, Err(BackplaneError::Adapter(_))));
    assert_eq!(pair.alpha.record_count(), 0);

    // The single injected failure is spent; the next create succeeds.
    orchestrator.facade().create("posts", json!({"n": 2})).await?;
    assert_eq!(pair.alpha.record_count(), 1);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn breaker_opens_short_circuits_and_half_opens() -> Result<()> {
    let mut config = quick_config();
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown = Duration::from_millis(150);
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    pair.alpha.seed("posts", "p1", json!({"n": 1}));

    // Two consecutive failures open the circuit mid-retry; the third
    // attempt is short-circuited.
    pair.alpha.faults().fail_next_ops(2);
    let result = orchestrator.facade().read("posts", "p1").await;
    assert!(matches!(result, Err(BackplaneError::CircuitOpen(_))));

    // Calls during the cool-down never reach the adapter.
    let rejected = orchestrator.facade().read("posts", "p1").await;
    assert!(matches!(rejected, Err(BackplaneError::CircuitOpen(_))));
    let stats = orchestrator.facade().stats();
    assert_eq!(
        stats.providers.get("database:alpha").map(|s| s.breaker),
        Some(BreakerState::Open)
    );

    // After the cool-down the trial call succeeds and closes the circuit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = orchestrator.facade().read("posts", "p1").await?;
    assert!(record.is_some());
    let stats = orchestrator.facade().stats();
    assert_eq!(
        stats.providers.get("database:alpha").map(|s| s.breaker),
        Some(BreakerState::Closed)
    );

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn attempt_timeout_surfaces_as_timeout_error() -> Result<()> {
    let mut config = quick_config();
    config.operation_timeout = Duration::from_millis(50);
    config.retry.max_attempts = 1;
    config.breaker.failure_threshold = 100;
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    pair.alpha.seed("posts", "p1", json!({"n": 1}));

    pair.alpha
        .faults()
        .set_delay(Some(Duration::from_millis(150)));
    let result = orchestrator.facade().read("posts", "p1").await;
    assert!(matches!(result, Err(BackplaneError::Timeout(_))));

    pair.alpha.faults().set_delay(None);
    assert!(orchestrator.facade().read("posts", "p1").await?.is_some());

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unhealthy_activation_requires_force() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    orchestrator
        .force_health(
            backplane_core::Capability::Database,
            "beta",
            Some(backplane_core::HealthStatus::Unhealthy),
        )
        .await?;

    let refused = orchestrator
        .registry()
        .set_active(backplane_core::Capability::Database, "beta", false)
        .await;
    assert!(matches!(refused, Err(BackplaneError::Unhealthy(_))));

    // The administrative override may still take the capability there.
    orchestrator
        .force_activate(backplane_core::Capability::Database, "beta")
        .await?;
    let status = orchestrator
        .get_status(backplane_core::Capability::Database)
        .await?;
    assert_eq!(status.active.as_deref(), Some("beta"));

    orchestrator.shutdown().await;
    Ok(())
}
