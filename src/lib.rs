//! Tollgate - In-process admission control
//!
//! This crate decides, per incoming unit of work, whether to admit it now,
//! admit it after a delay, or reject it. Budgets are token buckets: one
//! global bucket plus one bucket per caller key, with idle caller buckets
//! evicted in the background.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
