//! Domain layer for the producer side.

pub mod batcher;
pub mod commands;
