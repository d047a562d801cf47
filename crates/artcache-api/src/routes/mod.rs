//! # API Route Modules
//!
//! - `artifacts`: artifact get/put, store summary, and the download-speed
//!   probe. Mounted behind the authorization layer.
//! - `health`: health probe and Prometheus scrape endpoint. Mounted
//!   outside the authorization layer.

pub mod artifacts;
pub mod health;
