//! Common imports for governed call sites.
//!
//! ```rust
//! use tenant_governor::prelude::*;
//! ```

pub use crate::{Error, Result, Stage};

pub use crate::classify::{FailureClass, UpstreamError};
pub use crate::config::{ConfigBuilder, ConfigProvider, GovernorConfig};
pub use crate::governor::{Governor, GovernorBuilder};
pub use crate::quota::{AuthoritativeQuota, QuotaSource, TenantQuotaStatus};
pub use crate::resilience::TenantCircuitState;

pub use tokio_util::sync::CancellationToken;
