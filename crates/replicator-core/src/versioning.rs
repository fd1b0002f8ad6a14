//! Producer-side version stamping.

use async_trait::async_trait;

use crate::error::ReplicationError;
use crate::ledger::LedgerKey;

/// Hands out strictly increasing versions per entity to an owning service.
///
/// Owning services stamp every change event with the next version of its
/// entity before publishing; consumers rely on that order.
#[async_trait]
pub trait VersionSequencer: Send + Sync {
    /// Returns the next version for `key`, starting at 1.
    async fn next_version(&self, key: &LedgerKey) -> Result<i64, ReplicationError>;
}
