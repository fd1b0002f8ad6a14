//! Application layer for the producer side.

pub mod command_handlers;
pub mod publisher;
