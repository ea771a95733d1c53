//! Durable, transactional job queue on PostgreSQL.
//!
//! Producers enqueue named jobs with optional scheduling, throttling,
//! singleton or debounce semantics; workers poll queues under
//! `FOR UPDATE SKIP LOCKED`, run user handlers against a wall-clock
//! deadline, and report completion or failure. Delivery is at-least-once
//! with per-queue retry, dead-lettering, expiration and archival. Each
//! queue owns a partition of one partitioned jobs table, and every
//! uniqueness discipline (`short`, `singleton`, `stately`, throttle,
//! debounce) is enforced by unique partial indexes on that partition —
//! never by an application-side lock.
//!
//! ```no_run
//! use serde_json::json;
//! use stevedore::{FetchOptions, Manager, QueueOptions, SendOptions, WorkerOptions};
//!
//! # async fn example() -> Result<(), stevedore::Error> {
//! let manager = Manager::options()
//!     .database_url("postgres://postgres@localhost/app")
//!     .connect()
//!     .await?;
//!
//! manager.create_queue("emails", QueueOptions::default()).await?;
//!
//! manager
//!     .send("emails", &json!({ "to": "user@example.com" }), SendOptions::default())
//!     .await?;
//!
//! manager
//!     .work("emails", WorkerOptions::default(), |jobs| async move {
//!         for job in &jobs {
//!             println!("sending {:?}", job.data());
//!         }
//!         Ok::<_, String>(json!({ "sent": true }))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod events;
pub mod migrations;
mod job;
mod manager;
mod queue;
mod sql;
mod worker;

pub use config::{ManagerOptions, DEFAULT_SCHEMA};
pub use errors::{Error, Result};
pub use events::QueueEvent;
pub use job::{
    BatchOutcome, Job, JobInsert, JobState, SendOptions, SendOptionsBuilder, StartAfter,
};
pub use manager::{
    FetchOptions, MaintenanceSummary, Manager, PublishOutcome, SHUTDOWN_MESSAGE,
};
pub use queue::{Queue, QueueOptions, QueueOptionsBuilder, QueuePolicy};
pub use sql::maintenance::StateCount;
pub use worker::{WorkerOptions, WorkerSnapshot, WorkerState};
