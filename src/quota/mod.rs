//! Tenant-based quota tracking for a rate-limited upstream.

use std::time::Duration;

mod source;
mod status;
mod tracker;

pub use source::{AuthoritativeQuota, QuotaSource};
pub use status::TenantQuotaStatus;
pub use tracker::QuotaTracker;

/// Quota window settings shared by every tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaConfig {
    /// Calls allowed per window.
    pub limit: u32,
    /// Length of one quota window; the first starts when a tenant is first seen.
    pub window: Duration,
    /// Remaining calls at or below which waits log a warning.
    pub warning_threshold: u32,
    /// Added to the time-until-reset when sleeping for capacity.
    pub reset_buffer: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 5000,
            window: Duration::from_secs(3600),
            warning_threshold: 100,
            reset_buffer: Duration::from_secs(1),
        }
    }
}
