//! Quota status snapshots.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{saturating_add, until};

/// Quota state of one tenant at the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuotaStatus {
    pub tenant_id: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub warning_threshold: u32,
}

impl TenantQuotaStatus {
    pub fn is_exceeded(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_approaching_limit(&self) -> bool {
        self.remaining <= self.warning_threshold
    }

    /// Share of the window's quota already consumed, 0..=100.
    pub fn usage_percentage(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        (self.limit - self.remaining) as f64 / self.limit as f64 * 100.0
    }

    pub fn used(&self) -> u32 {
        self.limit - self.remaining
    }

    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        until(now, self.reset_time)
    }
}

/// Mutable per-tenant counters, guarded by the tracker's tenant-scoped lock.
#[derive(Debug)]
pub(crate) struct QuotaWindow {
    pub(crate) remaining: u32,
    pub(crate) reset_time: DateTime<Utc>,
}

impl QuotaWindow {
    pub(crate) fn new(limit: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            remaining: limit,
            reset_time,
        }
    }

    /// Refills the window once `now` reaches the boundary. The boundary moves
    /// forward by whole windows so it stays aligned with the first boundary.
    /// Returns true when a reset happened.
    pub(crate) fn roll(&mut self, now: DateTime<Utc>, limit: u32, window: TimeDelta) -> bool {
        if now < self.reset_time {
            return false;
        }

        let window_ms = window.num_milliseconds().max(1);
        let overdue_ms = (now - self.reset_time).num_milliseconds();
        let windows = overdue_ms / window_ms + 1;

        self.remaining = limit;
        let advance = TimeDelta::try_milliseconds(window_ms.saturating_mul(windows))
            .unwrap_or(TimeDelta::MAX);
        self.reset_time = saturating_add(self.reset_time, advance);
        true
    }
}
