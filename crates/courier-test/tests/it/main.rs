use chrono::Utc;
use courier_core::ScheduleRequest;

mod backoff;
mod pipeline;
mod recovery;
mod shutdown;

/// Builds a validated request from a JSON literal, panicking on anything a
/// test did not mean to send.
pub(crate) fn parse_request(value: serde_json::Value) -> ScheduleRequest {
    ScheduleRequest::parse(value.to_string().as_bytes(), Utc::now())
        .expect("test request should validate")
}
