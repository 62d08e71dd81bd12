use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::counter::{
    CommitLocalReply, CounterError, CounterStore, ExtendReply, ReleaseReply, ReserveReply,
};
use crate::model::{Commit, Extension, Ms, Release, ReleaseReason, Reservation, hold_member};
use crate::observability;
use crate::stock::{DurableStock, StockDecrement};

use super::validate::{lease_ms_from_seconds, now_ms, validate_qty};
use super::{Engine, EngineError};

/// Retries of the counter-side commit after the durable decrement has
/// already landed.
const COMMIT_LOCAL_RETRIES: usize = 3;
const COMMIT_LOCAL_BACKOFF: Duration = Duration::from_millis(50);

impl<C: CounterStore, D: DurableStock> Engine<C, D> {
    /// Place (or idempotently replay) a hold for `qty` units of `sku`.
    ///
    /// `ttl_seconds = None` falls back to the configured default TTL.
    pub async fn reserve(
        &self,
        sku: &str,
        qty: i64,
        cart_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(sku, qty, cart_id, ttl_seconds).await;
        observability::record_op("reserve", started, &result);
        result
    }

    async fn reserve_inner(
        &self,
        sku: &str,
        qty: i64,
        cart_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Reservation, EngineError> {
        self.validate_pair(sku, cart_id)?;
        validate_qty(qty)?;
        let ttl_ms = match ttl_seconds {
            Some(secs) => lease_ms_from_seconds(secs)?,
            None => self.default_hold_ttl_ms,
        };

        let reply = self
            .counter
            .reserve(sku, cart_id, qty, ttl_ms, now_ms())
            .await?;
        match reply {
            ReserveReply::Ok { expires_at, available_after, idempotent } => {
                debug!(sku, cart_id, qty, expires_at, idempotent, "hold placed");
                Ok(Reservation {
                    hold_id: hold_member(cart_id, sku),
                    expires_at,
                    available_after,
                    idempotent,
                })
            }
            ReserveReply::Insufficient { available } => {
                Err(EngineError::Insufficient { available })
            }
            ReserveReply::Conflict { existing_qty } => {
                Err(EngineError::Conflict { existing_qty: Some(existing_qty) })
            }
        }
    }

    /// Push a hold's expiry out by `add_seconds` from `max(current, now)`.
    pub async fn extend(
        &self,
        cart_id: &str,
        sku: &str,
        add_seconds: i64,
    ) -> Result<Extension, EngineError> {
        let started = Instant::now();
        let result = self.extend_inner(cart_id, sku, add_seconds).await;
        observability::record_op("extend", started, &result);
        result
    }

    async fn extend_inner(
        &self,
        cart_id: &str,
        sku: &str,
        add_seconds: i64,
    ) -> Result<Extension, EngineError> {
        self.validate_pair(sku, cart_id)?;
        let add_ms = lease_ms_from_seconds(add_seconds)?;

        match self.counter.extend(sku, cart_id, add_ms, now_ms()).await? {
            ExtendReply::Ok { new_expires_at } => Ok(Extension { new_expires_at }),
            ExtendReply::NotFound => Err(EngineError::NotFound),
        }
    }

    /// Release a hold back to availability. Idempotent: releasing an
    /// absent hold succeeds with `Release::Absent`.
    pub async fn release(&self, cart_id: &str, sku: &str) -> Result<Release, EngineError> {
        let started = Instant::now();
        let result = self.release_inner(cart_id, sku).await;
        observability::record_op("release", started, &result);
        result
    }

    async fn release_inner(&self, cart_id: &str, sku: &str) -> Result<Release, EngineError> {
        self.validate_pair(sku, cart_id)?;
        let reply = self
            .counter
            .release(sku, cart_id, ReleaseReason::Manual, now_ms())
            .await?;
        Ok(match reply {
            ReleaseReply::Released { qty } => {
                metrics::counter!(observability::RELEASES_TOTAL, "reason" => "manual")
                    .increment(1);
                Release::Released { qty }
            }
            ReleaseReply::Absent => Release::Absent,
        })
    }

    /// Commit a hold: durable store first, counter store second.
    ///
    /// The ordering is a contract. Freeing the counter-side capacity
    /// before the durable decrement would let a concurrent reserve draw
    /// from stock the sale is about to consume.
    pub async fn commit(&self, cart_id: &str, sku: &str) -> Result<Commit, EngineError> {
        let started = Instant::now();
        let result = self.commit_inner(cart_id, sku).await;
        observability::record_op("commit", started, &result);
        result
    }

    async fn commit_inner(&self, cart_id: &str, sku: &str) -> Result<Commit, EngineError> {
        self.validate_pair(sku, cart_id)?;

        // Step 1: read the hold without mutating anything.
        let hold = self
            .counter
            .peek_hold(sku, cart_id)
            .await?
            .ok_or(EngineError::NotFound)?;

        // Step 2: conditional decrement of the authoritative total. On a
        // transient store error nothing has moved on either side, so the
        // hold stays for the caller to retry against (or to expire).
        let new_total = match self.stock.decrement(sku, hold.qty).await {
            Ok(StockDecrement::Applied { new_total }) => new_total,
            Ok(StockDecrement::Insufficient) => {
                // Lost the race against external consumption. Release the
                // hold so it does not sit on capacity that no longer exists.
                warn!(sku, cart_id, qty = hold.qty, "durable stock gone at commit, releasing hold");
                if let Err(e) = self
                    .counter
                    .release(sku, cart_id, ReleaseReason::Manual, now_ms())
                    .await
                {
                    warn!(sku, cart_id, "compensating release failed, lease will expire: {e}");
                }
                return Err(EngineError::Conflict { existing_qty: None });
            }
            Err(e) => return Err(e.into()),
        };

        // Step 3: consume the hold. The durable side is settled, so
        // transient failures here are retried rather than surfaced.
        let mut backoff = COMMIT_LOCAL_BACKOFF;
        for attempt in 0..=COMMIT_LOCAL_RETRIES {
            match self.counter.commit_local(sku, cart_id, now_ms()).await {
                Ok(CommitLocalReply::Ok { consumed_qty }) => {
                    info!(sku, cart_id, consumed_qty, new_total, "hold committed");
                    return Ok(Commit { consumed_qty, new_total });
                }
                Ok(CommitLocalReply::NotFound) => {
                    // The hold expired between lookup and consumption. The
                    // durable decrement stands and expiry already returned
                    // the reserved units, so the commit is complete.
                    info!(sku, cart_id, "hold reaped during commit, durable decrement stands");
                    return Ok(Commit { consumed_qty: hold.qty, new_total });
                }
                Err(CounterError::Internal(msg)) => return Err(EngineError::Internal(msg)),
                Err(CounterError::Unavailable(msg)) if attempt < COMMIT_LOCAL_RETRIES => {
                    warn!(sku, cart_id, attempt, "counter commit failed, retrying: {msg}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(CounterError::Unavailable(msg)) => {
                    // Divergence: total is decremented but the hold still
                    // pins reserved units. Lease expiry releases them and
                    // the replicator mirrors the lower total.
                    metrics::counter!(observability::COMMIT_DIVERGENCE_TOTAL).increment(1);
                    error!(
                        sku,
                        cart_id,
                        qty = hold.qty,
                        "counter commit exhausted retries, stores diverged until lease expiry: {msg}"
                    );
                    return Ok(Commit { consumed_qty: hold.qty, new_total });
                }
            }
        }
        unreachable!("commit retry loop returns on every branch")
    }

    /// Release every hold with `expires_at <= now`, oldest first, at most
    /// `limit`. Returns the number released. Used by the reaper; safe to
    /// run concurrently with itself since RELEASE is idempotent.
    pub async fn sweep_expired(&self, now: Ms, limit: usize) -> Result<usize, EngineError> {
        let expired = self.counter.expired_holds(now, limit).await?;
        let mut released = 0;
        for (cart_id, sku) in expired {
            match self
                .counter
                .release(&sku, &cart_id, ReleaseReason::Expired, now)
                .await?
            {
                ReleaseReply::Released { qty } => {
                    info!(%sku, %cart_id, qty, "reaped expired hold");
                    metrics::counter!(observability::RELEASES_TOTAL, "reason" => "expired")
                        .increment(1);
                    released += 1;
                }
                ReleaseReply::Absent => {
                    // Already gone, concurrent release or double sweep.
                    debug!(%sku, %cart_id, "expired hold already released");
                }
            }
        }
        Ok(released)
    }
}
