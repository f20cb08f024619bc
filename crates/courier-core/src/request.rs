//! Schedule request parsing and validation.
//!
//! Both ingress adapters (broker subscription and HTTP) funnel their JSON
//! bodies through [`ScheduleRequest::parse`]. Everything that can be rejected
//! is rejected here, before a task row exists: topic shape, payload encoding,
//! schedule construction, one-time times already in the past.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::payload::TaskData;
use crate::schedule::Schedule;

/// The wire form of a schedule, as it appears both in incoming requests and
/// in the persisted [`TaskData`] envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScheduleSpec {
    OneTime {
        #[serde(rename = "executionTime")]
        execution_time: i64,
    },
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
        #[serde(
            rename = "initialExecutionTime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        initial_execution_time: Option<i64>,
    },
    FixedDelay {
        #[serde(rename = "delaySeconds")]
        delay_seconds: i64,
        #[serde(
            rename = "initialExecutionTime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        initial_execution_time: Option<i64>,
    },
    Daily {
        hour: u32,
        minute: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
        #[serde(
            rename = "initialExecutionTime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        initial_execution_time: Option<i64>,
    },
}

impl ScheduleSpec {
    /// Builds the validated domain schedule. Every constructor check
    /// (cron parse, daily range, positive delay, known zone) runs here.
    pub fn to_schedule(&self) -> Result<Schedule, ValidationError> {
        match self {
            ScheduleSpec::OneTime { execution_time } => {
                Ok(Schedule::one_time(millis_to_instant(*execution_time)?))
            }
            ScheduleSpec::Cron {
                expression, zone, ..
            } => Schedule::cron(expression, parse_zone(zone.as_deref())?),
            ScheduleSpec::FixedDelay { delay_seconds, .. } => {
                if *delay_seconds <= 0 {
                    return Err(ValidationError::NonPositiveDelay(*delay_seconds));
                }
                Schedule::fixed_delay(TimeDelta::seconds(*delay_seconds))
            }
            ScheduleSpec::Daily {
                hour, minute, zone, ..
            } => Schedule::daily(*hour, *minute, parse_zone(zone.as_deref())?),
        }
    }

    /// The caller-provided first fire instant, when present. May be in the
    /// past, which means "fire immediately".
    pub fn initial_execution_time(&self) -> Option<i64> {
        match self {
            ScheduleSpec::OneTime { .. } => None,
            ScheduleSpec::Cron {
                initial_execution_time,
                ..
            }
            | ScheduleSpec::FixedDelay {
                initial_execution_time,
                ..
            }
            | ScheduleSpec::Daily {
                initial_execution_time,
                ..
            } => *initial_execution_time,
        }
    }
}

/// The payload object of the canonical request shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Base64 of the bytes to republish.
    pub data: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// The canonical request shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRequest {
    pub schedule: ScheduleSpec,
    pub target_topic: String,
    pub payload: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// The legacy flat shape, accepted as a one-time schedule.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRequest {
    execution_time: i64,
    target_topic: String,
    payload: MessagePayload,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireRequest {
    Canonical(CanonicalRequest),
    Legacy(LegacyRequest),
}

/// A fully validated schedule request, ready to be resolved into a task row.
#[derive(Clone, Debug)]
pub struct ScheduleRequest {
    pub target_topic: String,
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub schedule: Schedule,
    pub spec: ScheduleSpec,
    pub task_name: Option<String>,
    pub initial_execution_time: Option<DateTime<Utc>>,
}

impl ScheduleRequest {
    /// Parses and validates a JSON request body against `now`.
    pub fn parse(body: &[u8], now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let wire: WireRequest = serde_json::from_slice(body)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let canonical = match wire {
            WireRequest::Canonical(canonical) => canonical,
            WireRequest::Legacy(legacy) => CanonicalRequest {
                schedule: ScheduleSpec::OneTime {
                    execution_time: legacy.execution_time,
                },
                target_topic: legacy.target_topic,
                payload: legacy.payload,
                task_name: None,
            },
        };

        Self::from_canonical(canonical, now)
    }

    pub fn from_canonical(
        request: CanonicalRequest,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if !topic_is_valid(&request.target_topic) {
            return Err(ValidationError::InvalidTopic(request.target_topic));
        }

        if let Some(name) = request.task_name.as_deref() {
            if name.trim().is_empty() {
                return Err(ValidationError::Malformed(
                    "taskName must be non-empty when present".into(),
                ));
            }
        }

        let payload = STANDARD.decode(request.payload.data.as_bytes())?;
        if payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }

        let schedule = request.schedule.to_schedule()?;
        if let Schedule::OneTime { fire_at } = &schedule {
            if *fire_at < now {
                return Err(ValidationError::PastExecutionTime {
                    requested: *fire_at,
                    now,
                });
            }
        }

        let initial_execution_time = request
            .schedule
            .initial_execution_time()
            .map(millis_to_instant)
            .transpose()?;

        Ok(Self {
            target_topic: request.target_topic,
            payload,
            attributes: request.payload.attributes,
            schedule,
            spec: request.schedule,
            task_name: request.task_name,
            initial_execution_time,
        })
    }

    /// The instant the first task row becomes due.
    ///
    /// One-time schedules fire at their requested instant. Recurring
    /// schedules fire at the caller-provided initial time when one was given
    /// (past instants fire immediately), otherwise at the next natural fire
    /// computed from `now`.
    pub fn first_execution_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match &self.schedule {
            Schedule::OneTime { fire_at } => *fire_at,
            _ => self
                .initial_execution_time
                .or_else(|| self.schedule.next(now))
                .unwrap_or(now),
        }
    }

    /// The envelope persisted in the task row's `data` column.
    pub fn task_data(&self) -> TaskData {
        TaskData {
            target_topic: self.target_topic.clone(),
            payload: self.payload.clone(),
            attributes: self.attributes.clone(),
            schedule: self.spec.clone(),
        }
    }

    /// Re-emits the canonical wire form (used by the `parse` command).
    pub fn canonical(&self) -> CanonicalRequest {
        CanonicalRequest {
            schedule: self.spec.clone(),
            target_topic: self.target_topic.clone(),
            payload: MessagePayload {
                data: STANDARD.encode(&self.payload),
                attributes: self.attributes.clone(),
            },
            task_name: self.task_name.clone(),
        }
    }
}

fn millis_to_instant(millis: i64) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(ValidationError::TimestampOutOfRange(millis))
}

fn parse_zone(zone: Option<&str>) -> Result<Tz, ValidationError> {
    match zone {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| ValidationError::UnknownZone(name.to_owned())),
    }
}

/// Accepts a simple topic name or the fully-qualified
/// `projects/<project>/topics/<topic>` form.
pub fn topic_is_valid(topic: &str) -> bool {
    static SIMPLE: OnceLock<Regex> = OnceLock::new();
    static QUALIFIED: OnceLock<Regex> = OnceLock::new();

    let simple = SIMPLE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._~+%-]{2,254}$").unwrap());
    let qualified =
        QUALIFIED.get_or_init(|| Regex::new(r"^projects/[^/]+/topics/[^/]+$").unwrap());

    simple.is_match(topic) || qualified.is_match(topic)
}

/// The broker-facing name: qualified topics collapse to their final segment.
pub fn short_topic(topic: &str) -> &str {
    match topic.rsplit_once('/') {
        Some((_, name)) => name,
        None => topic,
    }
}
