//! Domain types shared by the coordinator services
//!
//! These are the representations stored in the coordination store (as JSON)
//! and handed to the transport layer.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::constants::{DEFAULT_CONSUMER_GROUP, OFFSET_BEGIN, OFFSET_WIDTH};
use super::error::{CoordinatorError, Result};

/// Position inside one partition of an event type
///
/// Offsets are totally ordered within a partition. The special value
/// [`Offset::BEGIN`] is the position before the first event; every real
/// event offset is non-negative. On the wire an offset is the zero-padded
/// 18-digit decimal string (or `BEGIN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(i64);

impl Offset {
    /// Position before the first event of a partition
    pub const BEGIN: Offset = Offset(-1);

    /// Offset of a concrete event
    pub fn new(value: i64) -> Result<Self> {
        if value < 0 {
            return Err(CoordinatorError::Validation(format!(
                "offset must not be negative: {}",
                value
            )));
        }
        Ok(Offset(value))
    }

    /// Numeric value (-1 for BEGIN)
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_begin(&self) -> bool {
        self.0 < 0
    }

    /// Offset of the event following this position
    pub fn next(&self) -> Offset {
        Offset(self.0 + 1)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_begin() {
            f.write_str(OFFSET_BEGIN)
        } else {
            write!(f, "{:0width$}", self.0, width = OFFSET_WIDTH)
        }
    }
}

impl FromStr for Offset {
    type Err = CoordinatorError;

    /// Accepts `BEGIN` and decimal strings with or without zero padding
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(OFFSET_BEGIN) {
            return Ok(Offset::BEGIN);
        }
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoordinatorError::Validation(format!(
                "invalid offset: '{}'",
                s
            )));
        }
        trimmed
            .parse::<i64>()
            .map(Offset)
            .map_err(|_| CoordinatorError::Validation(format!("offset out of range: '{}'", s)))
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One partition of one event type
///
/// Ordering is (event type, partition) and defines the "partition-key order"
/// used by the assignment algorithm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventTypePartition {
    pub event_type: String,
    pub partition: u32,
}

impl EventTypePartition {
    pub fn new(event_type: impl Into<String>, partition: u32) -> Self {
        Self {
            event_type: event_type.into(),
            partition,
        }
    }
}

impl fmt::Display for EventTypePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.partition)
    }
}

/// Where consumption starts for partitions without a committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Oldest available event of each partition
    Begin,
    /// Only events published after the partition is first assigned
    #[default]
    End,
    /// Explicit cursors supplied with the subscription definition
    Cursors,
}

/// Cursor as exchanged with clients
///
/// `partition` stays a string on the wire; it is validated against the
/// subscription's partitions when used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursor {
    pub event_type: String,
    pub partition: String,
    pub offset: String,
    /// Opaque token issued with a streamed batch, echoed back on commit
    #[serde(default)]
    pub cursor_token: String,
}

impl SubscriptionCursor {
    pub fn new(
        event_type: impl Into<String>,
        partition: impl Into<String>,
        offset: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            partition: partition.into(),
            offset: offset.into(),
            cursor_token: String::new(),
        }
    }

    /// Attach a cursor token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.cursor_token = token.into();
        self
    }

    /// Parse partition and offset
    pub fn parse(&self) -> Result<(EventTypePartition, Offset)> {
        let partition = parse_partition(&self.partition)?;
        let offset: Offset = self.offset.parse()?;
        Ok((EventTypePartition::new(self.event_type.clone(), partition), offset))
    }
}

/// Parse a partition id from its wire form
pub fn parse_partition(raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| CoordinatorError::Validation(format!("invalid partition: '{}'", raw)))
}

/// Client request to create a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDefinition {
    pub owning_application: String,
    pub event_types: BTreeSet<String>,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub start_from: StartFrom,
    /// Required when `start_from` is `Cursors`
    #[serde(default)]
    pub initial_cursors: Vec<SubscriptionCursor>,
}

impl SubscriptionDefinition {
    pub fn new<I, S>(owning_application: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owning_application: owning_application.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            consumer_group: None,
            start_from: StartFrom::default(),
            initial_cursors: Vec::new(),
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_initial_cursors(mut self, cursors: Vec<SubscriptionCursor>) -> Self {
        self.start_from = StartFrom::Cursors;
        self.initial_cursors = cursors;
        self
    }

    /// Consumer group with the default applied
    pub fn effective_consumer_group(&self) -> &str {
        self.consumer_group
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(DEFAULT_CONSUMER_GROUP)
    }
}

/// A durable consumption contract over one or more event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub owning_application: String,
    pub event_types: BTreeSet<String>,
    pub consumer_group: String,
    pub start_from: StartFrom,
    #[serde(default)]
    pub initial_cursors: Vec<SubscriptionCursor>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Initial offset configured for a partition (CURSORS subscriptions only)
    pub fn initial_offset(&self, key: &EventTypePartition) -> Option<Offset> {
        self.initial_cursors.iter().find_map(|cursor| match cursor.parse() {
            Ok((partition, offset)) if &partition == key => Some(offset),
            _ => None,
        })
    }
}

/// Payload of a live session's ephemeral node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: String,
    pub subscription_id: String,
    pub created_at: DateTime<Utc>,
}

/// Payload of a subscription's topology node
///
/// The generation is bumped by every persisted rebalance; the node's version
/// guards concurrent rebalances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_display_is_zero_padded() {
        let offset = Offset::new(25).unwrap();
        assert_eq!(offset.to_string(), "000000000000000025");
        assert_eq!(Offset::BEGIN.to_string(), "BEGIN");
    }

    #[test]
    fn test_offset_parse_accepts_padded_and_plain() {
        let plain: Offset = "25".parse().unwrap();
        let padded: Offset = "000000000000000025".parse().unwrap();
        assert_eq!(plain, padded);
        assert_eq!(plain.value(), 25);
        assert_eq!("BEGIN".parse::<Offset>().unwrap(), Offset::BEGIN);
    }

    #[test]
    fn test_offset_parse_rejects_garbage() {
        assert!("".parse::<Offset>().is_err());
        assert!("-5".parse::<Offset>().is_err());
        assert!("12a".parse::<Offset>().is_err());
        assert!("99999999999999999999999".parse::<Offset>().is_err());
    }

    #[test]
    fn test_offset_ordering() {
        let ten: Offset = "10".parse().unwrap();
        let twenty_five: Offset = "25".parse().unwrap();
        assert!(Offset::BEGIN < ten);
        assert!(ten < twenty_five);
        assert_eq!(Offset::BEGIN.next().value(), 0);
    }

    #[test]
    fn test_offset_serde_uses_wire_form() {
        let json = serde_json::to_string(&Offset::new(7).unwrap()).unwrap();
        assert_eq!(json, "\"000000000000000007\"");
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value(), 7);
    }

    #[test]
    fn test_event_type_partition_order() {
        let mut keys = vec![
            EventTypePartition::new("b", 0),
            EventTypePartition::new("a", 1),
            EventTypePartition::new("a", 0),
        ];
        keys.sort();
        assert_eq!(keys[0], EventTypePartition::new("a", 0));
        assert_eq!(keys[2], EventTypePartition::new("b", 0));
    }

    #[test]
    fn test_definition_default_consumer_group() {
        let def = SubscriptionDefinition::new("app", ["et"]);
        assert_eq!(def.effective_consumer_group(), DEFAULT_CONSUMER_GROUP);
        assert_eq!(def.start_from, StartFrom::End);

        let def = def.with_consumer_group("");
        assert_eq!(def.effective_consumer_group(), DEFAULT_CONSUMER_GROUP);
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let def: SubscriptionDefinition =
            serde_json::from_str(r#"{"owning_application":"app","event_types":["et"]}"#).unwrap();
        assert_eq!(def.start_from, StartFrom::End);
        assert!(def.consumer_group.is_none());
        assert!(def.initial_cursors.is_empty());
    }

    #[test]
    fn test_cursor_parse() {
        let cursor = SubscriptionCursor::new("et", "3", "42").with_token("abc");
        let (key, offset) = cursor.parse().unwrap();
        assert_eq!(key, EventTypePartition::new("et", 3));
        assert_eq!(offset.value(), 42);
        assert_eq!(cursor.cursor_token, "abc");

        assert!(SubscriptionCursor::new("et", "x", "42").parse().is_err());
    }
}
