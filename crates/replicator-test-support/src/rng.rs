//! Test jitter — deterministic `JitterRng` implementations for tests.

use replicator_core::rng::JitterRng;

/// Adds no jitter, so backoff delays are exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterRng for NoJitter {
    fn next_f64(&mut self) -> f64 {
        0.0
    }
}

/// Always returns the same fraction.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterRng for FixedJitter {
    fn next_f64(&mut self) -> f64 {
        self.0
    }
}
