//! Domain layer for the consumer side.

pub mod replicas;
