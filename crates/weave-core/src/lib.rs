//! Weave Core: transport-agnostic multi-agent workflow orchestration.
//!
//! This crate contains the domain models, the SQLite-backed stores and the
//! orchestration services:
//!
//! - `events`: in-process message bus with a durable event journal
//! - `engine`: DAG validation, workflow/step state machine, supervisors
//! - `registry`: agent capabilities and heartbeat liveness
//! - `context`: layered, versioned project/feature/step context
//! - `tools`: ranked tool adapters behind circuit breakers
//! - `agent`: in-process agent host speaking the bus protocol
//!
//! It has **no HTTP framework dependency** by default, so it can back the
//! HTTP server (`weave-server`), the CLI, or an embedding application.
//!
//! # Feature Flags
//!
//! - `axum`: Enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod agent;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod state;
pub mod store;
pub mod tools;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::{ServerError, ValidationError};
pub use state::{create_app_state, AppState, AppStateInner};
