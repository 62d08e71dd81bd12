use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::model::{
    EventKind, EventRecord, Hold, Ms, ReleaseReason, Snapshot, hold_member, parse_member,
};

use super::{
    CommitLocalReply, CounterError, CounterStore, EVENTS_CAP, ExtendReply, ReleaseReply,
    ReserveReply,
};

// ── Writer-task command channel ──────────────────────────────────

enum Command {
    Reserve {
        sku: String,
        cart_id: String,
        qty: i64,
        ttl_ms: Ms,
        now: Ms,
        reply: oneshot::Sender<Result<ReserveReply, CounterError>>,
    },
    Extend {
        sku: String,
        cart_id: String,
        add_ms: Ms,
        now: Ms,
        reply: oneshot::Sender<Result<ExtendReply, CounterError>>,
    },
    CommitLocal {
        sku: String,
        cart_id: String,
        now: Ms,
        reply: oneshot::Sender<Result<CommitLocalReply, CounterError>>,
    },
    Release {
        sku: String,
        cart_id: String,
        reason: ReleaseReason,
        now: Ms,
        reply: oneshot::Sender<Result<ReleaseReply, CounterError>>,
    },
    PeekHold {
        sku: String,
        cart_id: String,
        reply: oneshot::Sender<Option<Hold>>,
    },
    Snapshot {
        sku: String,
        reply: oneshot::Sender<Option<Snapshot>>,
    },
    ExpiredHolds {
        now: Ms,
        limit: usize,
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    Events {
        limit: usize,
        reply: oneshot::Sender<Vec<EventRecord>>,
    },
    MirrorTotal {
        sku: String,
        total: i64,
        reply: oneshot::Sender<()>,
    },
}

/// Counter store backed by a single writer task.
///
/// All state is owned by one task and mutated one command at a time, so
/// every command is atomic with respect to every other: the same
/// serialization contract a scripted store provides, without the server.
#[derive(Clone)]
pub struct MemoryCounterStore {
    tx: mpsc::Sender<Command>,
}

impl MemoryCounterStore {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn new(events_enabled: bool) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(writer_loop(State::new(events_enabled), rx));
        Self { tx }
    }

    async fn send<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CounterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| CounterError::Unavailable("counter writer task stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| CounterError::Unavailable("counter writer dropped reply".into()))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn reserve(
        &self,
        sku: &str,
        cart_id: &str,
        qty: i64,
        ttl_ms: Ms,
        now: Ms,
    ) -> Result<ReserveReply, CounterError> {
        let (sku, cart_id) = (sku.to_string(), cart_id.to_string());
        self.send(|reply| Command::Reserve { sku, cart_id, qty, ttl_ms, now, reply })
            .await?
    }

    async fn extend(
        &self,
        sku: &str,
        cart_id: &str,
        add_ms: Ms,
        now: Ms,
    ) -> Result<ExtendReply, CounterError> {
        let (sku, cart_id) = (sku.to_string(), cart_id.to_string());
        self.send(|reply| Command::Extend { sku, cart_id, add_ms, now, reply })
            .await?
    }

    async fn commit_local(
        &self,
        sku: &str,
        cart_id: &str,
        now: Ms,
    ) -> Result<CommitLocalReply, CounterError> {
        let (sku, cart_id) = (sku.to_string(), cart_id.to_string());
        self.send(|reply| Command::CommitLocal { sku, cart_id, now, reply })
            .await?
    }

    async fn release(
        &self,
        sku: &str,
        cart_id: &str,
        reason: ReleaseReason,
        now: Ms,
    ) -> Result<ReleaseReply, CounterError> {
        let (sku, cart_id) = (sku.to_string(), cart_id.to_string());
        self.send(|reply| Command::Release { sku, cart_id, reason, now, reply })
            .await?
    }

    async fn peek_hold(&self, sku: &str, cart_id: &str) -> Result<Option<Hold>, CounterError> {
        let (sku, cart_id) = (sku.to_string(), cart_id.to_string());
        self.send(|reply| Command::PeekHold { sku, cart_id, reply }).await
    }

    async fn snapshot(&self, sku: &str) -> Result<Option<Snapshot>, CounterError> {
        let sku = sku.to_string();
        self.send(|reply| Command::Snapshot { sku, reply }).await
    }

    async fn expired_holds(
        &self,
        now: Ms,
        limit: usize,
    ) -> Result<Vec<(String, String)>, CounterError> {
        self.send(|reply| Command::ExpiredHolds { now, limit, reply }).await
    }

    async fn events(&self, limit: usize) -> Result<Vec<EventRecord>, CounterError> {
        self.send(|reply| Command::Events { limit, reply }).await
    }

    async fn mirror_total(&self, sku: &str, total: i64) -> Result<(), CounterError> {
        let sku = sku.to_string();
        self.send(|reply| Command::MirrorTotal { sku, total, reply }).await
    }
}

// ── Writer task state ────────────────────────────────────────────

#[derive(Default, Clone, Copy)]
struct Counters {
    total: i64,
    reserved: i64,
}

struct HoldEntry {
    qty: i64,
    expires_at: Ms,
    created_at: Ms,
    /// Position in the expiry index; the `u64` is an insertion sequence
    /// so same-millisecond expiries keep insertion order.
    index_key: (Ms, u64),
}

struct State {
    counters: HashMap<String, Counters>,
    holds: HashMap<String, HoldEntry>,
    expiry: BTreeMap<(Ms, u64), String>,
    events: VecDeque<EventRecord>,
    seq: u64,
    events_enabled: bool,
}

async fn writer_loop(mut state: State, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        state.handle(cmd);
    }
}

impl State {
    fn new(events_enabled: bool) -> Self {
        Self {
            counters: HashMap::new(),
            holds: HashMap::new(),
            expiry: BTreeMap::new(),
            events: VecDeque::new(),
            seq: 0,
            events_enabled,
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Reserve { sku, cart_id, qty, ttl_ms, now, reply } => {
                let _ = reply.send(self.reserve(&sku, &cart_id, qty, ttl_ms, now));
            }
            Command::Extend { sku, cart_id, add_ms, now, reply } => {
                let _ = reply.send(self.extend(&sku, &cart_id, add_ms, now));
            }
            Command::CommitLocal { sku, cart_id, now, reply } => {
                let _ = reply.send(self.commit_local(&sku, &cart_id, now));
            }
            Command::Release { sku, cart_id, reason, now, reply } => {
                let _ = reply.send(self.release(&sku, &cart_id, reason, now));
            }
            Command::PeekHold { sku, cart_id, reply } => {
                let hold = self.holds.get(&hold_member(&cart_id, &sku)).map(|h| Hold {
                    qty: h.qty,
                    expires_at: h.expires_at,
                    created_at: h.created_at,
                });
                let _ = reply.send(hold);
            }
            Command::Snapshot { sku, reply } => {
                let snap = self.counters.get(&sku).map(|c| Snapshot {
                    total: c.total,
                    reserved: c.reserved,
                    available: c.total - c.reserved,
                });
                let _ = reply.send(snap);
            }
            Command::ExpiredHolds { now, limit, reply } => {
                let expired = self
                    .expiry
                    .range(..=(now, u64::MAX))
                    .take(limit)
                    .filter_map(|(_, member)| parse_member(member))
                    .collect();
                let _ = reply.send(expired);
            }
            Command::Events { limit, reply } => {
                let out = self.events.iter().rev().take(limit).cloned().collect();
                let _ = reply.send(out);
            }
            Command::MirrorTotal { sku, total, reply } => {
                // The replicator writes total and nothing else.
                self.counters.entry(sku).or_default().total = total;
                let _ = reply.send(());
            }
        }
    }

    fn reserve(
        &mut self,
        sku: &str,
        cart_id: &str,
        qty: i64,
        ttl_ms: Ms,
        now: Ms,
    ) -> Result<ReserveReply, CounterError> {
        let member = hold_member(cart_id, sku);
        let expires_at = now
            .checked_add(ttl_ms)
            .ok_or_else(|| CounterError::Internal("hold expiry overflow".into()))?;

        if let Some(existing) = self.holds.get(&member) {
            if existing.qty != qty {
                return Ok(ReserveReply::Conflict { existing_qty: existing.qty });
            }
            // Identical replay: refresh the lease, counters untouched.
            let old_key = existing.index_key;
            let new_key = self.next_index_key(expires_at);
            self.expiry.remove(&old_key);
            self.expiry.insert(new_key, member.clone());
            let hold = self.holds.get_mut(&member).expect("hold just read");
            hold.expires_at = expires_at;
            hold.index_key = new_key;
            let c = self.counters.get(sku).copied().unwrap_or_default();
            return Ok(ReserveReply::Ok {
                expires_at,
                available_after: c.total - c.reserved,
                idempotent: true,
            });
        }

        let available_after = match self.counters.get_mut(sku) {
            Some(c) if c.total - c.reserved >= qty => {
                c.reserved = c
                    .reserved
                    .checked_add(qty)
                    .ok_or_else(|| CounterError::Internal("reserved counter overflow".into()))?;
                c.total - c.reserved
            }
            Some(c) => {
                return Ok(ReserveReply::Insufficient { available: c.total - c.reserved });
            }
            None => return Ok(ReserveReply::Insufficient { available: 0 }),
        };

        let index_key = self.next_index_key(expires_at);
        self.expiry.insert(index_key, member.clone());
        self.holds.insert(
            member,
            HoldEntry { qty, expires_at, created_at: now, index_key },
        );
        self.push_event(EventKind::HoldCreated, sku, cart_id, qty, None, now);

        Ok(ReserveReply::Ok { expires_at, available_after, idempotent: false })
    }

    fn extend(
        &mut self,
        sku: &str,
        cart_id: &str,
        add_ms: Ms,
        now: Ms,
    ) -> Result<ExtendReply, CounterError> {
        let member = hold_member(cart_id, sku);
        let Some(hold) = self.holds.get(&member) else {
            return Ok(ExtendReply::NotFound);
        };
        // Base at max(current, now): an expired hold never extends from
        // its stale expiry.
        let new_expires_at = hold
            .expires_at
            .max(now)
            .checked_add(add_ms)
            .ok_or_else(|| CounterError::Internal("hold expiry overflow".into()))?;
        let (qty, old_key) = (hold.qty, hold.index_key);

        let new_key = self.next_index_key(new_expires_at);
        self.expiry.remove(&old_key);
        self.expiry.insert(new_key, member.clone());
        let hold = self.holds.get_mut(&member).expect("hold just read");
        hold.expires_at = new_expires_at;
        hold.index_key = new_key;
        self.push_event(EventKind::HoldExtended, sku, cart_id, qty, None, now);

        Ok(ExtendReply::Ok { new_expires_at })
    }

    fn commit_local(
        &mut self,
        sku: &str,
        cart_id: &str,
        now: Ms,
    ) -> Result<CommitLocalReply, CounterError> {
        let member = hold_member(cart_id, sku);
        let Some(hold) = self.holds.remove(&member) else {
            return Ok(CommitLocalReply::NotFound);
        };
        self.expiry.remove(&hold.index_key);
        self.decrement_reserved(sku, hold.qty);
        self.push_event(EventKind::HoldCommitted, sku, cart_id, hold.qty, None, now);
        Ok(CommitLocalReply::Ok { consumed_qty: hold.qty })
    }

    fn release(
        &mut self,
        sku: &str,
        cart_id: &str,
        reason: ReleaseReason,
        now: Ms,
    ) -> Result<ReleaseReply, CounterError> {
        let member = hold_member(cart_id, sku);
        let Some(hold) = self.holds.remove(&member) else {
            // An absent hold must leave no index entry behind.
            self.expiry.retain(|_, m| m != &member);
            return Ok(ReleaseReply::Absent);
        };
        self.expiry.remove(&hold.index_key);
        self.decrement_reserved(sku, hold.qty);
        self.push_event(EventKind::HoldReleased, sku, cart_id, hold.qty, Some(reason), now);
        Ok(ReleaseReply::Released { qty: hold.qty })
    }

    fn decrement_reserved(&mut self, sku: &str, qty: i64) {
        if let Some(c) = self.counters.get_mut(sku) {
            c.reserved -= qty;
            if c.reserved < 0 {
                tracing::warn!(sku, "reserved counter went negative, clamping to zero");
                c.reserved = 0;
            }
        }
    }

    fn next_index_key(&mut self, expires_at: Ms) -> (Ms, u64) {
        self.seq += 1;
        (expires_at, self.seq)
    }

    fn push_event(
        &mut self,
        kind: EventKind,
        sku: &str,
        cart_id: &str,
        qty: i64,
        reason: Option<ReleaseReason>,
        now: Ms,
    ) {
        if !self.events_enabled {
            return;
        }
        if self.events.len() >= EVENTS_CAP {
            self.events.pop_front();
        }
        self.events.push_back(EventRecord {
            id: Ulid::new().to_string(),
            ts: now,
            kind,
            sku: sku.to_string(),
            cart_id: cart_id.to_string(),
            qty,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_700_000_000_000;

    async fn seeded(total: i64) -> MemoryCounterStore {
        let store = MemoryCounterStore::new(true);
        store.mirror_total("sku-123", total).await.unwrap();
        store
    }

    #[tokio::test]
    async fn reserve_and_snapshot() {
        let store = seeded(10).await;
        let reply = store.reserve("sku-123", "cart-a", 3, 120_000, NOW).await.unwrap();
        assert_eq!(
            reply,
            ReserveReply::Ok { expires_at: NOW + 120_000, available_after: 7, idempotent: false }
        );
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.total, 10);
        assert_eq!(snap.reserved, 3);
        assert_eq!(snap.available, 7);
    }

    #[tokio::test]
    async fn reserve_insufficient_reports_availability() {
        let store = seeded(2).await;
        store.reserve("sku-123", "cart-a", 2, 60_000, NOW).await.unwrap();
        let reply = store.reserve("sku-123", "cart-b", 2, 60_000, NOW).await.unwrap();
        assert_eq!(reply, ReserveReply::Insufficient { available: 0 });
    }

    #[tokio::test]
    async fn reserve_unknown_sku_is_insufficient() {
        let store = MemoryCounterStore::new(true);
        let reply = store.reserve("sku-999", "cart-a", 1, 60_000, NOW).await.unwrap();
        assert_eq!(reply, ReserveReply::Insufficient { available: 0 });
    }

    #[tokio::test]
    async fn idempotent_replay_refreshes_lease_only() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-r", 1, 60_000, NOW).await.unwrap();
        let reply = store
            .reserve("sku-123", "cart-r", 1, 60_000, NOW + 5_000)
            .await
            .unwrap();
        assert_eq!(
            reply,
            ReserveReply::Ok { expires_at: NOW + 65_000, available_after: 9, idempotent: true }
        );
        // Counters moved exactly once.
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 1);
        let hold = store.peek_hold("sku-123", "cart-r").await.unwrap().unwrap();
        assert_eq!(hold.expires_at, NOW + 65_000);
    }

    #[tokio::test]
    async fn replay_with_different_qty_conflicts() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 2, 60_000, NOW).await.unwrap();
        let reply = store.reserve("sku-123", "cart-a", 3, 60_000, NOW).await.unwrap();
        assert_eq!(reply, ReserveReply::Conflict { existing_qty: 2 });
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 2);
    }

    #[tokio::test]
    async fn extend_bases_on_max_of_current_and_now() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 1, 10_000, NOW).await.unwrap();

        // Not yet expired: base is the current expiry.
        let reply = store.extend("sku-123", "cart-a", 30_000, NOW + 1_000).await.unwrap();
        assert_eq!(reply, ExtendReply::Ok { new_expires_at: NOW + 40_000 });

        // Past expiry: base is now, not the stale expiry.
        let late = NOW + 100_000;
        let reply = store.extend("sku-123", "cart-a", 30_000, late).await.unwrap();
        assert_eq!(reply, ExtendReply::Ok { new_expires_at: late + 30_000 });
    }

    #[tokio::test]
    async fn extend_missing_hold_not_found() {
        let store = seeded(10).await;
        let reply = store.extend("sku-123", "cart-x", 30_000, NOW).await.unwrap();
        assert_eq!(reply, ExtendReply::NotFound);
    }

    #[tokio::test]
    async fn commit_local_consumes_hold() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 4, 60_000, NOW).await.unwrap();
        let reply = store.commit_local("sku-123", "cart-a", NOW).await.unwrap();
        assert_eq!(reply, CommitLocalReply::Ok { consumed_qty: 4 });

        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 0);
        // The counter store never touches total.
        assert_eq!(snap.total, 10);
        assert!(store.peek_hold("sku-123", "cart-a").await.unwrap().is_none());
        assert!(store.expired_holds(NOW + 120_000, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 2, 60_000, NOW).await.unwrap();
        let first = store
            .release("sku-123", "cart-a", ReleaseReason::Manual, NOW)
            .await
            .unwrap();
        assert_eq!(first, ReleaseReply::Released { qty: 2 });
        let second = store
            .release("sku-123", "cart-a", ReleaseReason::Manual, NOW)
            .await
            .unwrap();
        assert_eq!(second, ReleaseReply::Absent);
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 0);
    }

    #[tokio::test]
    async fn expired_holds_in_expiry_then_insertion_order() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-b", 1, 5_000, NOW).await.unwrap();
        store.reserve("sku-123", "cart-a", 1, 5_000, NOW).await.unwrap(); // same expiry, later insert
        store.reserve("sku-123", "cart-c", 1, 1_000, NOW).await.unwrap(); // earliest expiry

        let expired = store.expired_holds(NOW + 10_000, 16).await.unwrap();
        let carts: Vec<&str> = expired.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(carts, vec!["cart-c", "cart-b", "cart-a"]);

        // Batch limit honored.
        let limited = store.expired_holds(NOW + 10_000, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        // Unexpired holds stay out.
        let none = store.expired_holds(NOW, 16).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn events_record_lifecycle_newest_first() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 2, 60_000, NOW).await.unwrap();
        store.extend("sku-123", "cart-a", 30_000, NOW + 1).await.unwrap();
        store
            .release("sku-123", "cart-a", ReleaseReason::Expired, NOW + 2)
            .await
            .unwrap();

        let events = store.events(10).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::HoldReleased, EventKind::HoldExtended, EventKind::HoldCreated]
        );
        assert_eq!(events[0].reason, Some(ReleaseReason::Expired));
        assert_eq!(events[0].qty, 2);
    }

    #[tokio::test]
    async fn events_disabled_records_nothing() {
        let store = MemoryCounterStore::new(false);
        store.mirror_total("sku-123", 10).await.unwrap();
        store.reserve("sku-123", "cart-a", 1, 60_000, NOW).await.unwrap();
        assert!(store.events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mirror_total_preserves_reserved() {
        let store = seeded(10).await;
        store.reserve("sku-123", "cart-a", 3, 60_000, NOW).await.unwrap();
        store.mirror_total("sku-123", 7).await.unwrap();
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.total, 7);
        assert_eq!(snap.reserved, 3);
        assert_eq!(snap.available, 4);
    }

    #[tokio::test]
    async fn expiry_overflow_is_internal() {
        let store = seeded(10).await;
        let result = store.reserve("sku-123", "cart-a", 1, Ms::MAX, NOW).await;
        assert!(matches!(result, Err(CounterError::Internal(_))));
        // Nothing leaked.
        let snap = store.snapshot("sku-123").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 0);
    }
}
