//! In-process caches
//!
//! - [`DelayLimiter`] - once-per-window suppression for low-cardinality writes
//! - [`RangeCache`] - shared timestamp ranges behind gap-widening index writes
//!
//! Both are advisory. Losing them only costs duplicate writes; the database
//! stays the system of record.

pub mod delay_limiter;
pub mod expiration;
pub mod range_cache;

pub use delay_limiter::{DelayLimiter, DelayLimiterBuilder};
pub use range_cache::{IndexKey, RangeCache, TimestampRange, Widening};
