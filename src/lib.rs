#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Run Engine
//!
//! Execution coordination core for a background-task platform.
//!
//! ## Overview
//!
//! The engine decides which queued run may execute next, tracks the
//! authoritative state of every run across many worker processes, and
//! resolves dependencies between runs: a parent waiting on children, a batch
//! of runs, a point in time, or an external event.
//!
//! ## Architecture
//!
//! - **Run queue**: concurrency-limited priority queues per (environment,
//!   queue, concurrency key), aggregated under master queues. Every multi-key
//!   operation is one atomic script.
//! - **Run lock**: per-run mutual exclusion around every state transition.
//! - **Execution snapshots**: an append-only chain per run; callers pass the
//!   snapshot id they last saw and stale ids are rejected.
//! - **Waitpoints**: resolvable futures that runs block on.
//! - **Batches**: fan-out of N child runs, fan-in through one waitpoint.
//! - **Scheduled jobs**: delays, TTLs, heartbeats and cancellation fan-out are
//!   future-scored entries in the queue backend, so they survive restarts.
//!
//! ## Module Organization
//!
//! - [`engine`] - The systems and the [`engine::RunEngine`] facade
//! - [`run_queue`] - Keys, messages, atomic scripts, backends and strategies
//! - [`locking`] - Run locks
//! - [`store`] - Transactional persistence (in-memory and PostgreSQL)
//! - [`worker`] - Scheduled engine jobs
//! - [`models`] - Runs, snapshots, waitpoints, batches
//! - [`retry`] - Retry outcome computation
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`events`] - Domain events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use run_engine::config::EngineConfig;
//! use run_engine::engine::{RunEngine, TriggerRequest};
//! use run_engine::models::{AuthenticatedEnvironment, RuntimeEnvironmentType, WorkerIdentity};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! run_engine::logging::init_structured_logging();
//! let engine = RunEngine::in_memory(EngineConfig::default());
//! let env = AuthenticatedEnvironment::new(RuntimeEnvironmentType::Production);
//!
//! let run = engine
//!     .trigger(TriggerRequest::new(env, "resize-image", serde_json::json!({"id": 1})))
//!     .await?;
//!
//! for message in engine.dequeue_from_master_queue("worker-1", &run.master_queue, 1).await? {
//!     let started = engine
//!         .start_run_attempt(message.run.id, message.snapshot.id, WorkerIdentity::default(), false)
//!         .await?;
//!     println!("executing attempt {}", started.execution.attempt.number);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                          # In-memory backends
//! cargo test --features test-services # Also PostgreSQL and Redis paths
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod locking;
pub mod logging;
pub mod models;
pub mod retry;
pub mod run_queue;
pub mod store;
pub mod worker;

pub use config::{ConfigManager, EngineConfig};
pub use engine::{RunEngine, TriggerRequest};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventPublisher};
pub use run_queue::RunQueue;
