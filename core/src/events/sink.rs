//! Fixed-capacity ring buffer of redacted records, plus the read-side
//! queries the transports need.
//!
//! The ring itself is not synchronized; [`EventHub`](super::hub::EventHub)
//! owns it behind the same lock as the observer set.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::LogRecord;

/// Ordering of a query result. Consumers disagree on what they want, so
/// every query takes it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Oldest of the returned slice first.
    #[default]
    Chronological,
    NewestFirst,
}

/// Aggregate view of the buffer, served to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Records currently held.
    pub total: usize,
    /// Held records of type `request`.
    pub requests: usize,
    /// Held records of type `response`.
    pub responses: usize,
    /// Held records whose type mentions `error`.
    pub errors: usize,
    /// Share of held records that are not errors, in percent, two decimals.
    pub success_rate: f64,
    /// Live observers right now.
    pub observers: usize,
    /// Records inserted since start, evicted ones included.
    pub inserted_total: u64,
    /// Records dropped by capacity since start.
    pub evicted_total: u64,
}

#[derive(Debug)]
pub struct LogRing {
    records: VecDeque<LogRecord>,
    capacity: usize,
    inserted_total: u64,
    evicted_total: u64,
}

impl LogRing {
    /// A zero capacity is bumped to one; a ring that can hold nothing
    /// would make `subscribe` backlogs meaningless.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            inserted_total: 0,
            evicted_total: 0,
        }
    }

    /// Append, evicting the oldest records beyond capacity.
    pub fn push(&mut self, record: LogRecord) -> Option<LogRecord> {
        self.records.push_back(record);
        self.inserted_total += 1;
        if self.records.len() > self.capacity {
            self.evicted_total += 1;
            return self.records.pop_front();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Everything held, oldest first.
    pub fn all(&self) -> Vec<LogRecord> {
        self.records.iter().cloned().collect()
    }

    /// The `limit` most recent records.
    pub fn recent(&self, limit: usize, order: Order) -> Vec<LogRecord> {
        self.recent_of_type(limit, None, order)
    }

    /// The `limit` most recent records, optionally restricted to one type.
    pub fn recent_of_type(&self, limit: usize, kind: Option<&str>, order: Order) -> Vec<LogRecord> {
        let mut newest_first: Vec<LogRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .take(limit)
            .cloned()
            .collect();
        if order == Order::Chronological {
            newest_first.reverse();
        }
        newest_first
    }

    /// Records with `start <= ts <= end`, newest first.
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<&str>,
    ) -> Vec<LogRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.ts >= start && r.ts <= end)
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect()
    }

    pub fn stats(&self, observers: usize) -> HubStats {
        let total = self.records.len();
        let (mut requests, mut responses, mut errors) = (0, 0, 0);
        for record in &self.records {
            match record.kind.as_str() {
                "request" => requests += 1,
                "response" => responses += 1,
                kind if kind.contains("error") => errors += 1,
                _ => {}
            }
        }
        let success_rate = if total == 0 {
            0.0
        } else {
            let pct = (total - errors) as f64 / total as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };

        HubStats {
            total,
            requests,
            responses,
            errors,
            success_rate,
            observers,
            inserted_total: self.inserted_total,
            evicted_total: self.evicted_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::record::NewRecord;
    use chrono::Duration;

    fn record(kind: &str, seq: u32) -> LogRecord {
        NewRecord::new("test", kind).field("seq", seq).stamp()
    }

    fn seqs(records: &[LogRecord]) -> Vec<u64> {
        records
            .iter()
            .map(|r| r.fields["seq"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut ring = LogRing::new(10);
        for seq in 0..15 {
            ring.push(record("request", seq));
        }

        assert_eq!(ring.len(), 10);
        assert_eq!(seqs(&ring.all()), (5..15).collect::<Vec<_>>());
        let stats = ring.stats(0);
        assert_eq!(stats.inserted_total, 15);
        assert_eq!(stats.evicted_total, 5);
    }

    #[test]
    fn push_returns_evicted_record() {
        let mut ring = LogRing::new(1);
        assert!(ring.push(record("a", 0)).is_none());
        let evicted = ring.push(record("a", 1)).expect("evicts");
        assert_eq!(evicted.fields["seq"], 0);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        assert_eq!(LogRing::new(0).capacity(), 1);
    }

    #[test]
    fn recent_orders_are_explicit() {
        let mut ring = LogRing::new(10);
        for seq in 0..6 {
            ring.push(record("request", seq));
        }
        assert_eq!(seqs(&ring.recent(3, Order::Chronological)), vec![3, 4, 5]);
        assert_eq!(seqs(&ring.recent(3, Order::NewestFirst)), vec![5, 4, 3]);
        assert_eq!(ring.recent(100, Order::Chronological).len(), 6);
    }

    #[test]
    fn recent_of_type_filters_before_limiting() {
        let mut ring = LogRing::new(10);
        ring.push(record("request", 0));
        ring.push(record("response", 1));
        ring.push(record("request", 2));
        ring.push(record("response", 3));

        let responses = ring.recent_of_type(5, Some("response"), Order::Chronological);
        assert_eq!(seqs(&responses), vec![1, 3]);
    }

    #[test]
    fn between_is_inclusive_and_newest_first() {
        let mut ring = LogRing::new(10);
        let base = Utc::now();
        for (seq, offset) in [(0, -10), (1, -5), (2, 0), (3, 5)] {
            let mut r = record("request", seq);
            r.ts = base + Duration::seconds(offset);
            ring.push(r);
        }

        let hits = ring.between(base - Duration::seconds(5), base, None);
        assert_eq!(seqs(&hits), vec![2, 1]);
    }

    #[test]
    fn stats_counts_by_type() {
        let mut ring = LogRing::new(10);
        ring.push(record("request", 0));
        ring.push(record("response", 1));
        ring.push(record("error", 2));
        ring.push(record("verification_error", 3));

        let stats = ring.stats(2);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.observers, 2);
    }

    #[test]
    fn empty_stats_have_zero_rate() {
        assert_eq!(LogRing::new(5).stats(0).success_rate, 0.0);
    }
}
