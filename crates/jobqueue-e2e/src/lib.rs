//! # Jobqueue E2E
//!
//! Runs a manager under a random workload: every configured topic gets a
//! processor with random latency and failures, a producer adds jobs with
//! correlation ids `#00001`, `#00002`, ... at random intervals, and a stats
//! line is logged periodically until the process is interrupted.

pub mod driver;
