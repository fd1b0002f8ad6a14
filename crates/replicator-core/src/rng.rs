//! Jitter source abstraction for deterministic backoff.
//!
//! In production, this wraps the thread-local RNG. In tests, a fixed or
//! zero-jitter implementation is injected so retry delays are exact.

/// Source of the random fraction added to backoff delays.
pub trait JitterRng: Send + Sync {
    /// Generate a random `f64` in `[0.0, 1.0)`.
    fn next_f64(&mut self) -> f64;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadJitter;

impl JitterRng for ThreadJitter {
    fn next_f64(&mut self) -> f64 {
        rand::random::<f64>()
    }
}
