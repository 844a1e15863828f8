//! Append-only protocol event log.
//!
//! Every event is stored as received. Consecutive events with the same source and
//! discriminant (`type` field of the payload) are folded into one [`LogEntry`]
//! with a count when the log is read, so the raw payloads are never lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Sent by this side
    Local,
    /// Received from the model service
    Remote,
}

/// One protocol event as observed by the session.
///
/// Stored exactly once per arrival and never merged, so it carries no repeat
/// count. The count of a run of same-kind events is [`LogEntry::count`],
/// computed by [`EventLog::entries`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub time: DateTime<Utc>,
    pub source: EventSource,
    pub payload: Value,
}

impl RealtimeEvent {
    pub fn new(source: EventSource, payload: Value) -> Self {
        Self {
            time: Utc::now(),
            source,
            payload,
        }
    }

    pub fn local(payload: Value) -> Self {
        Self::new(EventSource::Local, payload)
    }

    pub fn remote(payload: Value) -> Self {
        Self::new(EventSource::Remote, payload)
    }

    /// Payload discriminant: the `type` field, or `"unknown"`.
    pub fn kind(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    fn same_run(&self, other: &RealtimeEvent) -> bool {
        self.source == other.source && self.kind() == other.kind()
    }
}

/// Aggregated view of a run of consecutive same-kind events
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    /// First event of the run
    pub event: &'a RealtimeEvent,
    /// Most recent event of the run
    pub latest: &'a RealtimeEvent,
    pub count: usize,
}

/// Lazy iterator over aggregated entries. Obtain a fresh one to restart.
pub struct Entries<'a> {
    events: &'a [RealtimeEvent],
    pos: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = LogEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.events.get(self.pos)?;
        let mut end = self.pos + 1;
        while end < self.events.len() && self.events[end].same_run(first) {
            end += 1;
        }
        let entry = LogEntry {
            event: first,
            latest: &self.events[end - 1],
            count: end - self.pos,
        };
        self.pos = end;
        Some(entry)
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RealtimeEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: RealtimeEvent) {
        self.events.push(event);
    }

    /// Aggregated entries in order.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            events: &self.events,
            pos: 0,
        }
    }

    /// Every event exactly as appended.
    pub fn raw(&self) -> impl Iterator<Item = &RealtimeEvent> + '_ {
        self.events.iter()
    }

    /// Number of aggregated entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn raw_len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
