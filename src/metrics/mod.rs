//! Prometheus metrics for the PostgreSQL Operator
//!
//! This module exposes metrics for monitoring operator health and controller activity.

mod prometheus;

pub use prometheus::*;
