//! Cutover under live traffic, and automatic failover promotion.

use super::{database_pair, quick_config, wait_for_active, wait_for_terminal};
use anyhow::Result;
use backplane_core::{Capability, MigrationOptions, MigrationState};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[tokio::test]
async fn facade_traffic_survives_cutover() -> Result<()> {
    let mut config = quick_config();
    config.migration.copy_batch_size = 8;
    config.migration.copy_concurrency = Some(2);
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    pair.alpha.seed("posts", "hot", json!({"title": "always there"}));
    for i in 0..200 {
        pair.alpha.seed("posts", &format!("p{:04}", i), json!({"n": i}));
    }
    // Slow the target so the copy phase overlaps plenty of reads.
    pair.beta.faults().set_delay(Some(Duration::from_millis(5)));

    let facade = orchestrator.facade().clone();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let reader = tokio::spawn(async move {
        let mut results = Vec::new();
        while !reader_stop.load(Ordering::SeqCst) {
            results.push(facade.read("posts", "hot").await);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        results
    });

    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Completed);

    // Let a few reads land on the new provider before stopping.
    tokio::time::sleep(Duration::from_millis(30)).await;
    stop.store(true, Ordering::SeqCst);
    let results = reader.await?;
    pair.beta.faults().set_delay(None);

    assert!(results.len() > 10, "only {} reads issued", results.len());
    for (i, result) in results.iter().enumerate() {
        match result {
            Ok(Some(record)) => assert_eq!(record.data["title"], json!("always there")),
            Ok(None) => panic!("read {} lost the record during cutover", i),
            Err(e) => panic!("read {} failed during cutover: {}", i, e),
        }
    }

    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("beta"));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failover_promotes_healthy_standby() -> Result<()> {
    let mut config = quick_config();
    config.auto_failover = true;
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    pair.beta.seed("posts", "p1", json!({"kept": true}));

    // Condemn the active provider; the policy reacts to the emitted event.
    pair.alpha.faults().fail_next_probes(3);
    for _ in 0..3 {
        orchestrator.monitor().probe_cycle().await;
    }

    wait_for_active(orchestrator, Capability::Database, "beta").await;
    let record = orchestrator.facade().read("posts", "p1").await?;
    assert_eq!(record.map(|r| r.data), Some(json!({"kept": true})));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failover_without_standby_leaves_binding_alone() -> Result<()> {
    let mut config = quick_config();
    config.auto_failover = true;
    let pair = database_pair(config).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;

    // Condemn both providers: no healthy standby exists.
    pair.alpha.faults().fail_next_probes(3);
    pair.beta.faults().fail_next_probes(3);
    for _ in 0..3 {
        orchestrator.monitor().probe_cycle().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = orchestrator.get_status(Capability::Database).await?;
    assert_eq!(status.active.as_deref(), Some("alpha"));

    orchestrator.shutdown().await;
    Ok(())
}
