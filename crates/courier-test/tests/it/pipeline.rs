use std::time::Duration;

use chrono::{TimeDelta, Utc};
use courier_core::{NewTask, TaskId, PUBLISH_PAYLOAD};
use courier_runtime::registry::SubmitError;
use courier_runtime::store::{TaskStore, POISON_FAILURES};
use courier_test::{spawn_worker, wait_for};
use serde_json::json;

use crate::parse_request;

#[tokio::test]
async fn one_time_happy_path() -> anyhow::Result<()> {
    let harness = spawn_worker();
    let registry = harness.registry();

    let request = parse_request(json!({
        "schedule": {
            "type": "one-time",
            "executionTime": Utc::now().timestamp_millis() + 500,
        },
        "targetTopic": "orders",
        "payload": {"data": "aGVsbG8=", "attributes": {"trace": "t-1"}},
    }));

    let id = registry.submit(&request, Utc::now()).await?;
    assert_eq!(harness.store.len(), 1);

    assert!(
        wait_for(Duration::from_secs(5), || harness.publisher.publish_count() == 1).await,
        "payload was not published in time"
    );

    // The exact bytes went to the exact topic, attributes intact.
    let messages = harness.publisher.messages_for_topic("orders");
    assert_eq!(messages.len(), 1);
    assert_eq!(&messages[0].payload[..], b"hello");
    assert_eq!(messages[0].attributes["trace"], "t-1");

    // A successful one-shot leaves no row behind.
    assert!(wait_for(Duration::from_secs(2), || harness.store.is_empty()).await);
    assert!(harness.store.get(&id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn recurring_task_is_rescheduled_after_success() -> anyhow::Result<()> {
    let harness = spawn_worker();
    let registry = harness.registry();
    let submitted_at = Utc::now();

    // A past initial execution time means "fire immediately".
    let request = parse_request(json!({
        "schedule": {
            "type": "fixed-delay",
            "delaySeconds": 3600,
            "initialExecutionTime": submitted_at.timestamp_millis() - 1_000,
        },
        "targetTopic": "reports",
        "payload": {"data": "cGluZw=="},
        "taskName": "hourly-report",
    }));
    let id = registry.submit(&request, submitted_at).await?;

    assert!(
        wait_for(Duration::from_secs(5), || harness.publisher.publish_count() == 1).await,
        "recurring task did not fire"
    );
    assert!(
        wait_for(Duration::from_secs(2), || {
            harness
                .store
                .snapshot()
                .iter()
                .any(|task| !task.picked && task.last_success.is_some())
        })
        .await,
        "row was not rescheduled"
    );

    // Exactly one row remains, due one delay after the successful fire.
    assert_eq!(harness.store.len(), 1);
    let row = harness.store.get(&id).await?.expect("row should remain");
    assert_eq!(row.consecutive_failures, 0);
    let next_in = row.execution_time - row.last_success.expect("success recorded");
    assert_eq!(next_in.num_seconds(), 3600);

    Ok(())
}

#[tokio::test]
async fn duplicate_named_recurring_is_rejected() -> anyhow::Result<()> {
    let harness = spawn_worker();
    let registry = harness.registry();

    let daily = || {
        parse_request(json!({
            "schedule": {"type": "daily", "hour": 9, "minute": 0},
            "targetTopic": "reports",
            "payload": {"data": "cGluZw=="},
            "taskName": "daily-report",
        }))
    };

    registry.submit(&daily(), Utc::now()).await?;
    match registry.submit(&daily(), Utc::now()).await {
        Err(SubmitError::Duplicate(id)) => {
            assert_eq!(id, TaskId::new(PUBLISH_PAYLOAD, "daily-report"));
        }
        other => panic!("expected a duplicate rejection, got {other:?}"),
    }

    assert_eq!(harness.store.len(), 1);

    Ok(())
}

#[tokio::test]
async fn undecodable_rows_are_parked_not_retried() -> anyhow::Result<()> {
    let harness = spawn_worker();

    // Simulate schema skew: a row whose data no longer decodes.
    harness
        .store
        .insert(NewTask {
            id: TaskId::new(PUBLISH_PAYLOAD, "skewed"),
            execution_time: Utc::now() - TimeDelta::seconds(1),
            data: b"no longer an envelope".to_vec(),
        })
        .await?;

    assert!(
        wait_for(Duration::from_secs(3), || {
            harness
                .store
                .snapshot()
                .iter()
                .any(|task| !task.picked && task.consecutive_failures >= POISON_FAILURES)
        })
        .await,
        "row was not parked"
    );

    // Parked means parked: never claimed again, nothing ever published.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let row = harness
        .store
        .get(&TaskId::new(PUBLISH_PAYLOAD, "skewed"))
        .await?
        .expect("parked row is retained");
    assert!(!row.picked);
    assert_eq!(harness.publisher.publish_count(), 0);

    Ok(())
}
