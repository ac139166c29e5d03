//! In-memory bounded telemetry journal.
//!
//! Grounded in `original_source/app/services/mqtt_bridge.py`'s
//! `_publisher_loop` retention policy (`cleanup_every`/`ttl_days`/
//! `max_rows`), reimplemented as an in-memory ring instead of SQL-backed
//! rows since the teacher's dependency stack carries no database crate
//! (DESIGN.md Open Question 2).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub id: u64,
    pub topic: String,
    pub object: String,
    pub line: String,
    pub unit_id: u8,
    pub register_type: String,
    pub address: u32,
    pub param: String,
    pub value: Option<String>,
    pub code: i32,
    pub message: String,
    pub silent_for_s: i64,
    pub ts: DateTime<Utc>,
}

struct Inner {
    rows: VecDeque<JournalRecord>,
    next_id: u64,
    inserts_since_cleanup: u64,
}

/// Append-only bounded store with count- and time-based retention.
pub struct Journal {
    max_rows: usize,
    ttl_days: u32,
    cleanup_every: u64,
    inner: Mutex<Inner>,
}

impl Journal {
    pub fn new(max_rows: usize, ttl_days: u32, cleanup_every: u64) -> Self {
        Self {
            max_rows,
            ttl_days,
            cleanup_every,
            inner: Mutex::new(Inner { rows: VecDeque::new(), next_id: 1, inserts_since_cleanup: 0 }),
        }
    }

    /// Appends one record, running retention cleanup every `cleanup_every`
    /// inserts.
    pub fn append(&self, mut record: JournalRecord) {
        let mut inner = self.inner.lock();
        record.id = inner.next_id;
        inner.next_id += 1;
        inner.rows.push_back(record);
        inner.inserts_since_cleanup += 1;

        if self.cleanup_every > 0 && inner.inserts_since_cleanup % self.cleanup_every == 0 {
            self.cleanup_locked(&mut inner);
        }
    }

    fn cleanup_locked(&self, inner: &mut Inner) {
        if self.ttl_days > 0 {
            let cutoff = Utc::now() - ChronoDuration::days(self.ttl_days as i64);
            while inner.rows.front().is_some_and(|r| r.ts < cutoff) {
                inner.rows.pop_front();
            }
        }
        if self.max_rows > 0 {
            while inner.rows.len() > self.max_rows {
                inner.rows.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the most recent `n` records, newest last.
    pub fn recent(&self, n: usize) -> Vec<JournalRecord> {
        let inner = self.inner.lock();
        inner.rows.iter().rev().take(n).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: DateTime<Utc>) -> JournalRecord {
        JournalRecord {
            id: 0,
            topic: "/devices/r1/temp".to_string(),
            object: "r1".to_string(),
            line: "line1".to_string(),
            unit_id: 1,
            register_type: "holding".to_string(),
            address: 0,
            param: "temp".to_string(),
            value: Some("42".to_string()),
            code: 0,
            message: "OK".to_string(),
            silent_for_s: 0,
            ts,
        }
    }

    #[test]
    fn test_append_assigns_monotonic_ids() {
        let j = Journal::new(0, 0, 0);
        j.append(record(Utc::now()));
        j.append(record(Utc::now()));
        let rows = j.recent(10);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn test_max_rows_retention() {
        let j = Journal::new(3, 0, 1);
        for _ in 0..5 {
            j.append(record(Utc::now()));
        }
        assert_eq!(j.len(), 3);
    }

    #[test]
    fn test_ttl_retention() {
        let j = Journal::new(0, 1, 1);
        j.append(record(Utc::now() - ChronoDuration::days(2)));
        j.append(record(Utc::now()));
        assert_eq!(j.len(), 1);
    }

    #[test]
    fn test_cleanup_only_runs_every_n_inserts() {
        let j = Journal::new(1, 0, 10);
        for _ in 0..5 {
            j.append(record(Utc::now()));
        }
        // cleanup_every=10 hasn't triggered yet, so all 5 rows remain.
        assert_eq!(j.len(), 5);
    }
}
