use time::OffsetDateTime;

use crate::error::PersistenceError;

/// Durable log of who has been messaged. At most one record per recipient,
/// checked across every date and hour bucket.
pub trait HistoryStore: Send + Sync {
    fn has_been_messaged(&self, identity: &str) -> Result<bool, PersistenceError>;

    /// Durably appends a send record before returning. Returns `false` when a
    /// record for `identity` already existed; the existing record is kept.
    fn record_sent(
        &self,
        identity: &str,
        location_key: &str,
        when: OffsetDateTime,
    ) -> Result<bool, PersistenceError>;
}
