//! The envelope persisted in a task row's `data` column.
//!
//! Written once at insert and decoded again by whichever worker ends up
//! executing the row, possibly a different process on a different version.
//! Serialization is JSON with the raw bytes base64-armored, and decode
//! failures are surfaced as-is so the pipeline can park the row instead of
//! retrying it forever.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::request::ScheduleSpec;

/// Everything the execution pipeline needs to republish a payload: the
/// target topic, the raw bytes, their attributes, and the schedule
/// descriptor that drives the reschedule decision at finalize time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    pub target_topic: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    pub schedule: ScheduleSpec,
}

impl TaskData {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        let data = TaskData {
            target_topic: "orders".into(),
            payload: b"\x00\x01binary\xffbytes".to_vec(),
            attributes: BTreeMap::from([
                ("origin".to_string(), "ingest".to_string()),
                ("trace".to_string(), "abc123".to_string()),
            ]),
            schedule: ScheduleSpec::FixedDelay {
                delay_seconds: 30,
                initial_execution_time: None,
            },
        };

        let encoded = data.encode().unwrap();
        assert_eq!(TaskData::decode(&encoded).unwrap(), data);
    }

    #[test]
    fn attributes_are_optional_on_the_wire() {
        let decoded = TaskData::decode(
            br#"{"targetTopic":"t-1","payload":"aGk=","schedule":{"type":"one-time","executionTime":1700000000000}}"#,
        )
        .unwrap();

        assert_eq!(decoded.payload, b"hi");
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn decode_rejects_schema_skew() {
        assert!(TaskData::decode(b"{\"somethingElse\":1}").is_err());
        assert!(TaskData::decode(b"not json at all").is_err());
    }
}
