//! CI orchestration core: build-graph execution, durable work queue,
//! commit→build intake, runner dispatch and status roll-up.
//!
//! The crate is the engine only. Source-control hosts, blob/log byte
//! stores, authorization and the pipeline-file grammar are collaborators
//! behind the traits in [`adapters`] and [`parser`]; persistence is
//! behind [`store::Store`] with an in-memory backend and an optional
//! Postgres backend (`postgres` feature).

pub mod adapters;
pub mod dag;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod intake;
pub mod parser;
pub mod queue;
pub mod retry;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod sync;
pub mod types;
pub mod workqueue;

pub use error::{Error, Result};
