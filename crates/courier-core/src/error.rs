/// A schedule request that must be rejected at ingress.
///
/// Validation failures are never persisted; each variant maps to a specific
/// caller-facing message. Anything that passes this gate is safe to hand to
/// the store.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The request body is not one of the accepted JSON shapes.
    #[error("malformed schedule request: {0}")]
    Malformed(String),

    /// A one-time execution time that already passed.
    #[error("one-time execution time {requested} is in the past (now {now})")]
    PastExecutionTime {
        requested: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    },

    /// An epoch-millisecond timestamp outside the representable range.
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(i64),

    /// The target topic matches neither the simple nor the qualified form.
    #[error("invalid target topic: {0:?}")]
    InvalidTopic(String),

    /// The payload decodes to zero bytes.
    #[error("payload data must be non-empty")]
    EmptyPayload,

    /// The payload `data` field is not valid base64.
    #[error("payload data is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// A cron expression that does not parse as a 5- or 6-field schedule.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A daily schedule outside of hour 0..=23 / minute 0..=59.
    #[error("daily time-of-day {hour}:{minute:02} is out of range")]
    TimeOfDayOutOfRange { hour: u32, minute: u32 },

    /// A fixed delay of zero or negative seconds.
    #[error("fixed delay must be positive, got {0}s")]
    NonPositiveDelay(i64),

    /// A time zone name that is not a known IANA zone.
    #[error("unknown time zone {0:?}")]
    UnknownZone(String),
}
