//! # Data Usage Tracking
//!
//! Per-session network byte accounting. The embedder feeds request and
//! response sizes in as it observes traffic; `finish` produces the record
//! the session facade posts to the manager on close.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::types::UsageRecord;

pub struct DataUsageTracker {
    browser_id: String,
    started_at: DateTime<Utc>,
    bytes: AtomicU64,
}

impl DataUsageTracker {
    pub fn new(browser_id: &str) -> Self {
        Self {
            browser_id: browser_id.to_string(),
            started_at: Utc::now(),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_response(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of the session's usage, closed out at the current time.
    pub fn finish(&self) -> UsageRecord {
        UsageRecord {
            browser_id: self.browser_id.clone(),
            start: self.started_at,
            end: Utc::now(),
            bytes: self.total_bytes(),
        }
    }
}
