//! Event stream guarantees: ordered delivery to subscribers, capability
//! filtering, and operation events on both outcomes.

use super::{database_pair, full_stack, migration_states, quick_config, wait_for_terminal};
use anyhow::Result;
use backplane_core::{BackplaneEvent, Capability, MigrationOptions, MigrationState, OperationOutcome};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn subscribers_see_migration_events_in_order() -> Result<()> {
    let pair = database_pair(quick_config()).await?;
    let orchestrator = &pair.orchestrator;
    orchestrator.monitor().stop();
    orchestrator.monitor().probe_cycle().await;
    for i in 0..4 {
        pair.alpha.seed("posts", &format!("p{}", i), json!({"n": i}));
    }

    let mut rx = orchestrator.subscribe();
    let job = orchestrator
        .request_migration(Capability::Database, "beta", MigrationOptions::default())
        .await?;
    assert_eq!(wait_for_terminal(&job).await, MigrationState::Completed);

    let mut received = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(event)) => {
                let done = matches!(
                    &event,
                    BackplaneEvent::Migration(e) if e.state == MigrationState::Completed
                );
                received.push(event);
                if done {
                    break;
                }
            }
            _ => panic!("subscriber never saw the Completed event"),
        }
    }

    assert_eq!(
        migration_states(&received, Capability::Database),
        vec![
            MigrationState::Planned,
            MigrationState::Copying,
            MigrationState::Verifying,
            MigrationState::CuttingOver,
            MigrationState::Completed,
        ]
    );

    // The final event carries the finished counters.
    let last = received
        .iter()
        .rev()
        .find_map(|event| match event {
            BackplaneEvent::Migration(e) => Some(e.clone()),
            _ => None,
        })
        .expect("migration event");
    assert_eq!(last.items_copied, 4);
    assert_eq!(last.items_verified, 4);
    assert_eq!(last.source_id, "alpha");
    assert_eq!(last.target_id, "beta");

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn history_filters_by_capability() -> Result<()> {
    let stack = full_stack(quick_config()).await?;
    let orchestrator = &stack.orchestrator;
    orchestrator.monitor().stop();

    orchestrator.facade().create("posts", json!({"n": 1})).await?;
    orchestrator
        .facade()
        .upload("media", "a.txt", b"x".to_vec())
        .await?;

    let database_events = orchestrator
        .history()
        .into_iter()
        .filter(|e| matches!(e, BackplaneEvent::Operation(_)))
        .filter(|e| e.capability() == Capability::Database)
        .count();
    assert_eq!(database_events, 1);

    let storage_ops: Vec<BackplaneEvent> = orchestrator
        .history()
        .into_iter()
        .filter(|e| {
            matches!(e, BackplaneEvent::Operation(_)) && e.capability() == Capability::Storage
        })
        .collect();
    assert_eq!(storage_ops.len(), 1);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn operation_events_record_both_outcomes() -> Result<()> {
    let stack = full_stack(quick_config()).await?;
    let orchestrator = &stack.orchestrator;
    orchestrator.monitor().stop();

    orchestrator.facade().create("posts", json!({"n": 1})).await?;
    let missing = orchestrator.facade().invoke("missing", json!({})).await;
    assert!(missing.is_err());

    let operations: Vec<(String, bool)> = orchestrator
        .history()
        .into_iter()
        .filter_map(|event| match event {
            BackplaneEvent::Operation(e) => Some((
                e.operation.to_string(),
                matches!(e.outcome, OperationOutcome::Success),
            )),
            _ => None,
        })
        .collect();

    assert!(operations.contains(&("database.create".to_string(), true)));
    assert!(operations.contains(&("functions.invoke".to_string(), false)));

    // The failure event carries the normalized kind, not adapter detail.
    let failure_kind = orchestrator.history().into_iter().find_map(|event| {
        match event {
            BackplaneEvent::Operation(e) => match e.outcome {
                OperationOutcome::Failure(kind) if e.operation == "functions.invoke" => {
                    Some(kind)
                }
                _ => None,
            },
            _ => None,
        }
    });
    assert_eq!(failure_kind.as_deref(), Some("adapter_error"));

    orchestrator.shutdown().await;
    Ok(())
}
