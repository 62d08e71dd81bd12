use crate::counter::CounterStore;
use crate::model::{EventRecord, Snapshot};
use crate::stock::DurableStock;

use super::validate::validate_id;
use super::{Engine, EngineError};

impl<C: CounterStore, D: DurableStock> Engine<C, D> {
    /// Counter-store view of one SKU. Eventually consistent with
    /// in-flight scripts (a read may trail by one execution).
    pub async fn snapshot(&self, sku: &str) -> Result<Snapshot, EngineError> {
        validate_id(sku, self.strict_ids)?;
        self.counter
            .snapshot(sku)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Most recent lifecycle events, newest first.
    pub async fn events(&self, limit: usize) -> Result<Vec<EventRecord>, EngineError> {
        if limit == 0 {
            return Err(EngineError::BadRequest("limit must be at least 1"));
        }
        Ok(self.counter.events(limit).await?)
    }
}
