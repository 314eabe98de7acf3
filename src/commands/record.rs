use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::Lane;

/// Lower values are serviced first.
pub type Priority = i32;

pub const DEFAULT_PRIORITY: Priority = 5;

/// Type tag naming the factory that rebuilds a command from its record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandType(String);

impl CommandType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A unit of deferred work as it is persisted. The payload is opaque to the
/// queue engine; only the factory registered for `command_type` reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub command_type: CommandType,
    pub lane: Lane,
    pub priority: Priority,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<CommandType>,
        lane: Lane,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            lane,
            priority: DEFAULT_PRIORITY,
            payload: payload.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Key used to order a lane's backlog: priority, then age, then id.
    pub fn order_key(&self) -> (Priority, i64, &str) {
        (
            self.priority,
            self.updated_at.timestamp_micros(),
            self.command_id.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::queue::Lane;

    use super::{CommandRecord, CommandType, DEFAULT_PRIORITY};

    #[test]
    fn new_record_uses_default_priority_and_now() {
        let before = Utc::now();
        let record = CommandRecord::new("hash:1", "file.hash", Lane::Hashing, "{}");
        let after = Utc::now();

        assert_eq!(record.priority, DEFAULT_PRIORITY);
        assert_eq!(record.command_type, CommandType::new("file.hash"));
        assert!(record.updated_at >= before && record.updated_at <= after);
    }

    #[test]
    fn order_key_sorts_by_priority_then_age() {
        let now = Utc::now();
        let older = CommandRecord::new("b", "x", Lane::General, "")
            .with_priority(5)
            .with_updated_at(now - Duration::seconds(5));
        let newer = CommandRecord::new("a", "x", Lane::General, "")
            .with_priority(5)
            .with_updated_at(now);
        let urgent = CommandRecord::new("c", "x", Lane::General, "")
            .with_priority(1)
            .with_updated_at(now);

        let mut records = vec![&newer, &older, &urgent];
        records.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let ids = records
            .iter()
            .map(|record| record.command_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn record_survives_json_persistence() {
        let record = CommandRecord::new("img:7", "image.fetch", Lane::Image, "<opaque/>")
            .with_priority(9);
        let raw = serde_json::to_vec(&record).expect("record should serialize");
        let restored: CommandRecord = serde_json::from_slice(&raw).expect("record should deserialize");
        assert_eq!(restored, record);
    }
}
