use std::collections::BTreeMap;

use crate::store::{AggregateView, SessionLog};
use crate::view::{merge_delta, ViewDelta};
use crate::{AggregateRow, Identity, SessionInput, SessionRecord, StoreError};

/// Process-local store implementing both storage seams.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    log: Vec<SessionRecord>,
    view: BTreeMap<Identity, AggregateRow>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable access to a stored row, for simulating lost or corrupted
    /// view updates.
    pub fn row_mut(&mut self, identity: &Identity) -> Option<&mut AggregateRow> {
        self.view.get_mut(identity)
    }
}

impl SessionLog for InMemoryStore {
    fn history_for(&self, identity: &Identity) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .log
            .iter()
            .filter(|record| &record.identity == identity)
            .cloned()
            .collect())
    }

    fn append(&mut self, input: &SessionInput) -> Result<SessionRecord, StoreError> {
        let seq = self
            .log
            .last()
            .map_or(1, |record| record.seq.saturating_add(1));
        let record = input.clone().into_record(seq);
        self.log.push(record.clone());
        Ok(record)
    }

    fn records(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.log.clone())
    }
}

impl AggregateView for InMemoryStore {
    fn upsert(
        &mut self,
        identity: &Identity,
        delta: &ViewDelta,
        now_ms: i64,
    ) -> Result<AggregateRow, StoreError> {
        let row = merge_delta(self.view.get(identity), identity, delta, now_ms);
        self.view.insert(identity.clone(), row.clone());
        Ok(row)
    }

    fn row_for(&self, identity: &Identity) -> Result<Option<AggregateRow>, StoreError> {
        Ok(self.view.get(identity).cloned())
    }

    fn rows(&self) -> Result<Vec<AggregateRow>, StoreError> {
        Ok(self.view.values().cloned().collect())
    }

    fn replace_all(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        self.view = rows
            .iter()
            .map(|row| (row.identity(), row.clone()))
            .collect();
        Ok(())
    }
}
