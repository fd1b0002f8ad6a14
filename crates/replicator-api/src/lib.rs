//! Replicator — service library.
//!
//! Wires the publisher, the partition workers, the dead-letter reconciler and
//! the retention sweep over `PostgreSQL` storage, and exposes the ingestion
//! and operator routes over HTTP.

pub mod config;
pub mod error;
pub mod routes;
pub mod service;
pub mod state;
pub mod telemetry;
