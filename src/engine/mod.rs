//! Reservation engine: orchestrates the counter store's atomic scripts
//! and the durable store's conditional decrement.
//!
//! The engine is stateless apart from its store handles. It holds no
//! locks; all mutual exclusion between concurrent operations on a SKU is
//! delegated to the counter store's one-script-at-a-time execution.

mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;

use crate::config::Config;
use crate::counter::CounterStore;
use crate::model::Ms;
use crate::stock::DurableStock;

use validate::validate_id;

pub struct Engine<C, D> {
    counter: C,
    stock: D,
    default_hold_ttl_ms: Ms,
    strict_ids: bool,
}

impl<C: CounterStore, D: DurableStock> Engine<C, D> {
    pub fn new(counter: C, stock: D, config: &Config) -> Self {
        Self {
            counter,
            stock,
            default_hold_ttl_ms: config.default_hold_ttl.as_millis() as Ms,
            strict_ids: config.strict_id_validation,
        }
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    pub fn stock(&self) -> &D {
        &self.stock
    }

    pub(super) fn validate_pair(&self, sku: &str, cart_id: &str) -> Result<(), EngineError> {
        validate_id(sku, self.strict_ids)?;
        validate_id(cart_id, self.strict_ids)?;
        Ok(())
    }
}
