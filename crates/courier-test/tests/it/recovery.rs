use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_runtime::broker::TestPublisher;
use courier_runtime::registry::TaskRegistry;
use courier_runtime::store::{MemTaskStore, StoreError, TaskStore};
use courier_runtime::Stats;
use courier_test::{spawn_worker_on, test_config, wait_for};
use serde_json::json;

use crate::parse_request;

#[tokio::test]
async fn crashed_worker_lease_is_recovered_and_republished() -> anyhow::Result<()> {
    let store = Arc::new(MemTaskStore::new());
    let publisher = Arc::new(TestPublisher::new());
    let registry = TaskRegistry::new(store.clone(), Arc::new(Stats::default()));

    let request = parse_request(json!({
        "schedule": {
            "type": "one-time",
            "executionTime": Utc::now().timestamp_millis() + 100,
        },
        "targetTopic": "orders",
        "payload": {"data": "cmVjb3Zlcg=="},
    }));
    let id = registry.submit(&request, Utc::now()).await?;

    // Claim the row as a worker that then crashes: no heartbeats, no
    // progress, lease left dangling.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = store.claim_due(Utc::now(), "crashed-worker", 1).await?;
    assert_eq!(claimed.len(), 1);

    // A healthy worker must recover the stale lease within lease_timeout
    // plus a polling interval, see the same data, and publish it.
    let worker = spawn_worker_on(store.clone(), publisher.clone(), test_config());

    assert!(
        wait_for(Duration::from_secs(5), || publisher.publish_count() == 1).await,
        "recovered task was never published"
    );
    let messages = publisher.messages_for_topic("orders");
    assert_eq!(&messages[0].payload[..], b"recover");
    assert!(wait_for(Duration::from_secs(2), || store.is_empty()).await);

    // The original holder is fenced out: its lease mutations are rejected
    // and it must not publish.
    assert!(matches!(
        store.heartbeat(&id, "crashed-worker", Utc::now()).await,
        Err(StoreError::LeaseLost)
    ));

    drop(worker);

    Ok(())
}

#[tokio::test]
async fn two_workers_split_the_backlog_without_double_publishing() -> anyhow::Result<()> {
    let store = Arc::new(MemTaskStore::new());
    let publisher = Arc::new(TestPublisher::new());
    let registry = TaskRegistry::new(store.clone(), Arc::new(Stats::default()));

    let first = spawn_worker_on(store.clone(), publisher.clone(), test_config());
    let second = spawn_worker_on(store.clone(), publisher.clone(), test_config());

    for index in 0..20 {
        let request = parse_request(json!({
            "schedule": {
                "type": "one-time",
                "executionTime": Utc::now().timestamp_millis() + 100,
            },
            "targetTopic": format!("topic-{index}"),
            "payload": {"data": "aGk="},
        }));
        registry.submit(&request, Utc::now()).await?;
    }

    assert!(
        wait_for(Duration::from_secs(10), || {
            store.is_empty() && publisher.publish_count() >= 20
        })
        .await,
        "backlog was not drained"
    );

    // Exclusive claims and live heartbeats mean exactly one publish per
    // task, even with two workers racing over the same table.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(publisher.publish_count(), 20);

    drop(first);
    drop(second);

    Ok(())
}
