//! Real-time inventory reservation over two stores: an atomic counter
//! store holding live `reserved` counts and short-lived per-cart holds,
//! and a durable store owning the authoritative totals.
//!
//! The [`Engine`] answers "can this cart take N units of this SKU right
//! now" atomically, replays identical requests idempotently, and commits
//! durable-store-first so concurrent checkouts can never oversell. The
//! [`reaper`] sweeps abandoned holds back into availability when their
//! leases lapse.

pub mod config;
pub mod counter;
pub mod engine;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod stock;

pub use config::Config;
pub use counter::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use engine::{Engine, EngineError};
pub use model::{Commit, EventRecord, Extension, Hold, Release, Reservation, Snapshot};
pub use stock::{DurableStock, MemoryStock, PostgresStock};

/// Connect both production stores and assemble an engine from `config`.
pub async fn connect(
    config: &Config,
) -> Result<Engine<RedisCounterStore, PostgresStock>, EngineError> {
    let counter = RedisCounterStore::connect(
        &config.counter_store_url,
        config.events_enabled,
        &config.events_stream_name,
    )
    .await?;
    let stock = PostgresStock::connect(&config.durable_store_dsn).await?;
    Ok(Engine::new(counter, stock, config))
}
