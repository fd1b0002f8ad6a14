//! Shared test doubles and in-memory stores for the replicator pipeline.

mod channel;
mod clock;
mod dead_letter;
mod rng;
mod store;
mod versioning;

pub use channel::{FailingChannel, LeasingChannel, RecordingChannel};
pub use clock::{FixedClock, ManualClock};
pub use dead_letter::{FailingDeadLetterSink, InMemoryDeadLetterSink};
pub use rng::{FixedJitter, NoJitter};
pub use store::{FailingReplicaStore, FlakyReplicaStore, InMemoryReplicaStore};
pub use versioning::InMemoryVersionSequencer;
