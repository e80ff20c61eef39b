//! Durable job store and admission control.
//!
//! This crate provides:
//! - Job persistence, leasing and delayed retries on Redis
//! - An in-memory store with identical semantics for tests and embedding
//! - A system-wide admission gate bounding in-flight attempts
//! - A progress reporting capability handed to pipeline stages
//! - A read-only status facade for polling clients

pub mod config;
pub mod error;
pub mod gate;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod redis_store;
pub mod status;
pub mod store;

pub use config::{AdmissionConfig, AttemptLimits, StoreConfig};
pub use error::{QueueError, QueueResult};
pub use gate::{AdmissionGate, AdmissionSlot, MemoryAdmissionGate, RedisAdmissionGate};
pub use memory::MemoryJobStore;
pub use progress::ProgressReporter;
pub use queue::JobQueue;
pub use redis_store::RedisJobStore;
pub use status::JobStatusFacade;
pub use store::{JobStore, QueueDepth};
