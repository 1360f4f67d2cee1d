//! Storage seams injected into the ingestion coordinator.

use crate::view::ViewDelta;
use crate::{AggregateRow, Identity, SessionInput, SessionRecord, StoreError};

/// Append-only session log.
pub trait SessionLog {
    /// Prior sessions for one identity, in any order. A log that does not
    /// exist yet reads as empty.
    fn history_for(&self, identity: &Identity) -> Result<Vec<SessionRecord>, StoreError>;

    /// Appends one record and returns it with its assigned `seq`.
    fn append(&mut self, input: &SessionInput) -> Result<SessionRecord, StoreError>;

    /// The whole log in insertion order.
    fn records(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

/// Keyed per-identity aggregate view.
pub trait AggregateView {
    /// Adds `delta` to the identity's row as a single read-modify-write.
    fn upsert(
        &mut self,
        identity: &Identity,
        delta: &ViewDelta,
        now_ms: i64,
    ) -> Result<AggregateRow, StoreError>;

    fn row_for(&self, identity: &Identity) -> Result<Option<AggregateRow>, StoreError>;

    /// All rows ordered by identity.
    fn rows(&self) -> Result<Vec<AggregateRow>, StoreError>;

    /// Replaces the whole view with `rows`.
    fn replace_all(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError>;
}
