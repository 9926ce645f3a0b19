//! Authoritative quota values reported by the upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::UpstreamError;

/// Remaining quota and window boundary as reported by the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeQuota {
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

impl AuthoritativeQuota {
    pub fn new(remaining: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            remaining,
            reset_time,
        }
    }

    /// Builds from a unix-seconds reset instant, the shape most rate-limit
    /// response headers use. Returns `None` for an out-of-range instant.
    pub fn from_epoch_seconds(remaining: u32, reset_epoch_secs: i64) -> Option<Self> {
        DateTime::from_timestamp(reset_epoch_secs, 0)
            .map(|reset_time| Self::new(remaining, reset_time))
    }
}

/// Fetches authoritative quota on demand (e.g. a dedicated rate-limit
/// endpoint). Used by `wait_for_capacity` when a refresh is forced.
#[async_trait::async_trait]
pub trait QuotaSource: Send + Sync {
    async fn fetch(&self, tenant_id: &str) -> Result<AuthoritativeQuota, UpstreamError>;
}
