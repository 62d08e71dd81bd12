//! Atomic counter store: live `reserved` counters, per-cart holds, the
//! expiry index, and the lifecycle event stream.
//!
//! The store's mutating surface is a closed set of named scripts. Each
//! script executes to completion without interleaving with any other
//! script or command, which is the only source of mutual exclusion in the
//! system; callers hold no locks of their own.

mod memory;
mod redis;

pub use memory::MemoryCounterStore;
pub use redis::RedisCounterStore;

use async_trait::async_trait;

use crate::model::{EventRecord, Hold, Ms, ReleaseReason, Snapshot};

/// Outcome of the RESERVE script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveReply {
    Ok {
        expires_at: Ms,
        available_after: i64,
        idempotent: bool,
    },
    Insufficient {
        available: i64,
    },
    /// A hold exists for this `(cart, sku)` with a different quantity.
    Conflict {
        existing_qty: i64,
    },
}

/// Outcome of the EXTEND script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendReply {
    Ok { new_expires_at: Ms },
    NotFound,
}

/// Outcome of the COMMIT_LOCAL script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLocalReply {
    Ok { consumed_qty: i64 },
    NotFound,
}

/// Outcome of the RELEASE script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReply {
    Released { qty: i64 },
    Absent,
}

#[derive(Debug)]
pub enum CounterError {
    /// Transient I/O failure; the caller may retry.
    Unavailable(String),
    /// Invariant violation or malformed store state; do not retry.
    Internal(String),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::Unavailable(e) => write!(f, "counter store unavailable: {e}"),
            CounterError::Internal(e) => write!(f, "counter store internal error: {e}"),
        }
    }
}

impl std::error::Error for CounterError {}

/// The atomic counter store capability.
///
/// The four mutating methods map one-to-one onto the store's scripts;
/// the rest are plain reads plus the replicator's `mirror_total` surface.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// RESERVE: create a hold for `qty` units, or replay an identical one.
    async fn reserve(
        &self,
        sku: &str,
        cart_id: &str,
        qty: i64,
        ttl_ms: Ms,
        now: Ms,
    ) -> Result<ReserveReply, CounterError>;

    /// EXTEND: push the hold's expiry to `max(current, now) + add_ms`.
    async fn extend(
        &self,
        sku: &str,
        cart_id: &str,
        add_ms: Ms,
        now: Ms,
    ) -> Result<ExtendReply, CounterError>;

    /// COMMIT_LOCAL: consume the hold, decrementing `reserved`. Never
    /// touches `total`; the durable store owns that.
    async fn commit_local(
        &self,
        sku: &str,
        cart_id: &str,
        now: Ms,
    ) -> Result<CommitLocalReply, CounterError>;

    /// RELEASE: return the hold's units to availability. Idempotent.
    async fn release(
        &self,
        sku: &str,
        cart_id: &str,
        reason: ReleaseReason,
        now: Ms,
    ) -> Result<ReleaseReply, CounterError>;

    /// Read a hold without mutating anything.
    async fn peek_hold(&self, sku: &str, cart_id: &str) -> Result<Option<Hold>, CounterError>;

    /// Read one SKU's counters. `None` when the SKU has never been mirrored.
    async fn snapshot(&self, sku: &str) -> Result<Option<Snapshot>, CounterError>;

    /// Holds whose `expires_at <= now`, ascending by expiry, at most
    /// `limit`. Returns `(cart_id, sku)` pairs.
    async fn expired_holds(
        &self,
        now: Ms,
        limit: usize,
    ) -> Result<Vec<(String, String)>, CounterError>;

    /// Most recent lifecycle events, newest first.
    async fn events(&self, limit: usize) -> Result<Vec<EventRecord>, CounterError>;

    /// Replicator surface: overwrite the mirrored `total` for one SKU.
    /// The engine never calls this: `total` is owned by the durable
    /// store and only projected here.
    async fn mirror_total(&self, sku: &str, total: i64) -> Result<(), CounterError>;
}

/// Events kept in the stream/ring before old entries are dropped.
pub(crate) const EVENTS_CAP: usize = 10_000;
