//! # Kestrel background execution
//!
//! - **JobScheduler**: shared worker pool for one-shot and periodic jobs
//! - **PromiseManager**: one-shot result handoff to a dedicated callback thread

pub mod job_scheduler;
pub mod promise;

pub use job_scheduler::{JobHandle, JobId, JobMetrics, JobScheduler};
pub use promise::{Promise, PromiseCallback, PromiseId, PromiseManager, PromiseState};
