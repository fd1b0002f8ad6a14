//! Application layer for the consumer side.

pub mod applier;
pub mod dispatcher;
pub mod query_handlers;
pub mod reconciler;
pub mod registry;
