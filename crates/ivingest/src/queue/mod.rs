//! The worker pool: bounded concurrency over the job store.

pub mod backoff;
mod worker;

pub use worker::{WorkerPool, WorkerStatus};
