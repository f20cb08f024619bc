use std::time::Duration;

use chrono::{TimeDelta, Utc};
use courier_runtime::store::TaskStore;
use courier_test::{spawn_worker, wait_for};
use serde_json::json;

use crate::parse_request;

#[tokio::test]
async fn failing_publish_backs_off_exponentially() -> anyhow::Result<()> {
    let harness = spawn_worker();
    let registry = harness.registry();
    harness.publisher.fail_times(3);

    let request = parse_request(json!({
        "schedule": {
            "type": "one-time",
            "executionTime": Utc::now().timestamp_millis() + 100,
        },
        "targetTopic": "orders",
        "payload": {"data": "aGk="},
    }));
    let id = registry.submit(&request, Utc::now()).await?;

    // Failures 1, 2, 3 push the due time out by 30s, 60s, 120s from the
    // moment of each failure.
    for (failures, delay_secs) in [(1, 30), (2, 60), (3, 120)] {
        assert!(
            wait_for(Duration::from_secs(5), || {
                harness
                    .store
                    .snapshot()
                    .first()
                    .is_some_and(|task| !task.picked && task.consecutive_failures == failures)
            })
            .await,
            "row never reached {failures} consecutive failures"
        );

        let row = harness.store.get(&id).await?.expect("row is retained");
        let backoff = row.execution_time - row.last_failure.expect("failure recorded");
        assert_eq!(backoff.num_seconds(), delay_secs);

        // Fast-forward instead of sleeping out the backoff.
        harness
            .store
            .set_execution_time(&id, Utc::now() - TimeDelta::seconds(1));
    }

    // Injected failures are spent; the next attempt publishes and the
    // one-shot row disappears, failure streak and all.
    assert!(
        wait_for(Duration::from_secs(5), || harness.publisher.publish_count() == 1).await,
        "publish never succeeded after retries"
    );
    assert!(wait_for(Duration::from_secs(2), || harness.store.is_empty()).await);

    Ok(())
}
