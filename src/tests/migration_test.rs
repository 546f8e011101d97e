//! Migration state machine scenarios: the full happy path, mutual
//! exclusion, fail-fast validation, verification failures, rollback and
//! cancellation.

use super::{database_pair, migration_states, quick_config, wait_for_terminal};
use anyhow::Result;
use backplane_core::{BackplaneError, Capability, MigrationOptions, MigrationState};
use serde_json::json;
use std::time::Duration;

fn seed_records(db: &backplane_mem::MemDatabase, count: usize) {
    for i in 0..count {
        db.seed("posts", &format!("p{:03}", i), json!({"n": i}));
    }
}

#[tokio::test]
async fn full_migration_runs_planned_to_completed() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    seed_records(&pair.alpha, 10);

    // Mark both providers healthy.
    orchestrator.monitor().probe_cycle().await;

    let job = orchestrator
        .request_migration(
            Capability::Database,
            "beta",
            MigrationOptions {
                verify: true,
                rollback_on_failure: false,
            },
        )
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Completed);

    assert_eq!(
        migration_states(&orchestrator.history(), Capability::Database),
        vec![
            MigrationState::Planned,
            MigrationState::Copying,
            MigrationState::Verifying,
            MigrationState::CuttingOver,
            MigrationState::Completed,
        ]
    );

    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("beta"));
    let snapshot = status.migration.expect("migration snapshot");
    assert_eq!(snapshot.state, MigrationState::Completed);
    assert_eq!(snapshot.items_copied, 10);
    assert_eq!(snapshot.items_verified, 10);
    assert_eq!(pair.beta.record_count(), 10);

    // Facade traffic now lands on the new provider.
    let record = orchestrator.facade().read("posts", "p003").await?;
    assert_eq!(record.map(|r| r.data), Some(json!({"n": 3})));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn second_request_is_rejected_while_first_runs() -> Result<()> {
    let mut config = quick_config();
    config.migration.copy_batch_size = 1;
    config.migration.copy_concurrency = Some(1);
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;
    seed_records(&pair.alpha, 20);
    pair.beta.faults().set_delay(Some(Duration::from_millis(10)));

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    let second = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await;
    assert!(matches!(
        second,
        Err(BackplaneError::MigrationInProgress(Capability::Database))
    ));
    assert!(!job.is_terminal());

    pair.beta.faults().set_delay(None);
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Completed);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn request_validation_fails_fast() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    let unknown = orchestrator
        .request_migration(Capability::Database, "missing", MigrationOptions::default())
        .await;
    assert!(matches!(unknown, Err(BackplaneError::NotFound(_))));

    let same = orchestrator
        .request_migration(Capability::Database, "alpha", MigrationOptions::default())
        .await;
    assert!(matches!(same, Err(BackplaneError::Config(_))));

    orchestrator
        .force_health(
            Capability::Database,
            "beta",
            Some(backplane_core::HealthStatus::Unhealthy),
        )
        .await?;
    let condemned = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await;
    assert!(matches!(
        condemned,
        Err(BackplaneError::TargetUnavailable(_))
    ));

    // Nothing above emitted a migration event or moved the binding.
    assert!(migration_states(&orchestrator.history(), Capability::Database).is_empty());
    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("alpha"));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn count_mismatch_fails_verification_and_keeps_source_active() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    seed_records(&pair.alpha, 5);
    // Pre-existing target data the copy does not overwrite: counts diverge.
    pair.beta.seed("zzz", "ghost", json!({"stale": true}));

    let before = orchestrator.get_status(Capability::Database).await?;
    let job = orchestrator
        .request_migration(
            Capability::Database,
            "beta",
            MigrationOptions {
                verify: true,
                rollback_on_failure: false,
            },
        )
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Failed);
    let failure = job.failure().expect("failure recorded");
    assert!(failure.contains("count mismatch"), "got: {}", failure);

    let after = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(after.active, before.active);
    assert_eq!(after.active.as_deref(), Some("alpha"));
    // Without rollback the partially-copied data is left for the operator.
    assert_eq!(pair.beta.record_count(), 6);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rollback_purges_target_after_failed_verification() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    seed_records(&pair.alpha, 5);
    pair.beta.seed("zzz", "ghost", json!({"stale": true}));

    let job = orchestrator
        .request_migration(
            Capability::Database,
            "beta",
            MigrationOptions {
                verify: true,
                rollback_on_failure: true,
            },
        )
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::RolledBack);

    let states = migration_states(&orchestrator.history(), Capability::Database);
    assert_eq!(
        states.last().copied(),
        Some(MigrationState::RolledBack)
    );
    assert!(states.contains(&MigrationState::Failed));

    assert_eq!(pair.beta.record_count(), 0);
    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("alpha"));
    assert_eq!(pair.alpha.record_count(), 5);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn checksum_mismatch_is_caught_within_count_tolerance() -> Result<()> {
    let mut config = quick_config();
    config.migration.count_tolerance = 1;
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    seed_records(&pair.alpha, 2);
    pair.beta.seed("zzz", "ghost", json!({"stale": true}));

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Failed);
    let failure = job.failure().expect("failure recorded");
    assert!(failure.contains("checksum mismatch"), "got: {}", failure);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancellation_terminates_job_without_moving_traffic() -> Result<()> {
    let mut config = quick_config();
    config.migration.copy_batch_size = 1;
    config.migration.copy_concurrency = Some(1);
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    seed_records(&pair.alpha, 30);
    pair.beta.faults().set_delay(Some(Duration::from_millis(10)));

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel_migration(Capability::Database).await?;

    assert_eq!(wait_for_terminal(&job).await, MigrationState::Failed);
    let failure = job.failure().expect("failure recorded");
    assert!(failure.contains("cancelled"), "got: {}", failure);
    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("alpha"));

    // A second cancel finds nothing in flight.
    let again = orchestrator.cancel_migration(Capability::Database).await;
    assert!(matches!(again, Err(BackplaneError::NotFound(_))));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_source_still_cuts_over() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Completed);
    assert_eq!(job.items_copied(), 0);

    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("beta"));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_inflight_migration() -> Result<()> {
    let mut config = quick_config();
    config.migration.copy_batch_size = 1;
    config.migration.copy_concurrency = Some(1);
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    seed_records(&pair.alpha, 30);
    pair.beta.faults().set_delay(Some(Duration::from_millis(10)));

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    orchestrator.shutdown().await;

    assert!(job.is_terminal());
    assert_eq!(job.state(), MigrationState::Failed);
    Ok(())
}
