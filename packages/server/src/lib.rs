//! nexaas - event-and-job orchestrator core.
//!
//! A single process owns six cooperating components on one event loop:
//! the Store (durable state), the Bus (pub/sub + SSE fanout), the Queue
//! (job claiming), the Engine (tick loop turning due events into jobs),
//! the Worker pool (job execution, including the flow interpreter), and
//! the Ops Monitor (self-healing watchdog). `lifecycle` wires them
//! together; everything else is a plain library module usable on its own.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod store;
pub mod workers;

pub use config::Config;
pub use error::OrchestratorError;
