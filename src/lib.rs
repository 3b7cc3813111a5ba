//! `drover` bounded-concurrency remote-command dispatch library.
//!
//! This crate provides the transport seam (`executor`), serialized
//! multi-host reporting (`report`), the bounded scheduling core (`pool`,
//! `dispatch`), per-host execution state (`context`), and the deployment
//! task layer (`task`, `hosts`) used by the `drover` CLI.
//!
//! Invariants:
//! - at most `limit` jobs execute concurrently in one dispatch round
//! - every submitted job yields one result or one logged failure, never
//!   zero or two; one host's failure never aborts its siblings
//! - no two hosts' reports interleave line-by-line
//! - scoped directory changes are restored on every exit path

pub mod context;
pub mod dispatch;
pub mod executor;
pub mod hosts;
pub mod pool;
pub mod report;
pub mod task;

pub use executor::LOCALHOST;
