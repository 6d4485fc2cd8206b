//! Process-wide counters shown on the status screen

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by every worker for the lifetime of the process
#[derive(Debug, Default)]
pub struct ScanMetrics {
    seen: AtomicU64,
    captchas: AtomicU64,
    sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub seen: u64,
    pub captchas: u64,
    pub sent: u64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_seen(&self, count: u64) {
        self.seen.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_captcha(&self) {
        self.captchas.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            seen: self.seen.load(Ordering::Relaxed),
            captchas: self.captchas.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }
}
