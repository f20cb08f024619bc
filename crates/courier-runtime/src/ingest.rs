//! Broker ingress.
//!
//! Subscribes to a subject and funnels every message through the same
//! parse-and-submit path as the HTTP endpoint. Malformed messages are
//! dropped after logging — replaying a request that can never parse would
//! only storm the subscription.

use std::sync::Arc;

use chrono::Utc;
use courier_core::ScheduleRequest;
use futures_util::StreamExt;

use crate::flag::StopFlag;
use crate::registry::{SubmitError, TaskRegistry};

pub async fn run(
    client: async_nats::Client,
    subject: String,
    registry: Arc<TaskRegistry>,
    shutdown: StopFlag,
) -> anyhow::Result<()> {
    let mut subscription = client.subscribe(subject.clone()).await?;
    tracing::info!(%subject, "listening for schedule requests");

    loop {
        let message = tokio::select! {
            biased;

            _ = shutdown.wait() => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("broker subscription closed");
                    break;
                }
            },
        };

        let now = Utc::now();
        let request = match ScheduleRequest::parse(&message.payload, now) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!("dropping malformed schedule request: {error}");
                continue;
            }
        };

        match registry.submit(&request, now).await {
            Ok(id) => tracing::debug!(task = %id, "scheduled from broker request"),
            Err(SubmitError::Duplicate(id)) => {
                tracing::info!(task = %id, "ignoring duplicate recurring request");
            }
            Err(error) => tracing::error!("failed to persist schedule request: {error}"),
        }
    }

    let _ = subscription.unsubscribe().await;

    Ok(())
}
