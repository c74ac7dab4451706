//! Upstream rate budgeting.
//!
//! [`RateLimiterGroup`] enforces several fixed-window quotas jointly and can be
//! persisted between runs; [`ApiRateLimiter`] is a per-second burst limiter.

mod api;
mod group;
pub mod snapshot;
mod window;

pub use api::{ApiRateLimiter, DEFAULT_FEED_RPS};
pub use group::{LimiterStatus, RateLimiterGroup};
pub use snapshot::{PERSIST_INTERVAL_MS, RateLimitSnapshot};
pub use window::{FixedWindowLimiter, LimiterSpec, WindowState};
