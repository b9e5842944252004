//! Logging bootstrap and in-process metrics for fabric binaries.

pub mod logging;
pub mod metrics;
