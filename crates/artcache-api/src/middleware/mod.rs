//! # HTTP Middleware
//!
//! - `metrics`: request/error counters, mirrored into the `metrics` facade.

pub mod metrics;
