use std::time::Duration;

use courier_test::spawn_worker;

#[tokio::test]
async fn shutdown_completes_promptly() -> anyhow::Result<()> {
    let harness = spawn_worker();

    // Give the polling loop a couple of ticks before stopping it.
    tokio::time::sleep(Duration::from_millis(300)).await;

    harness.worker.handle().shutdown();
    match tokio::time::timeout(Duration::from_secs(5), harness.worker).await {
        Ok(result) => result,
        Err(_) => panic!("unable to shut the worker down in under 5s"),
    }
}
