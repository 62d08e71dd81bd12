use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::counter::CounterStore;
use crate::engine::Engine;
use crate::observability;
use crate::stock::DurableStock;

/// Background task that periodically releases expired holds.
///
/// Each tick drains the expiry index in `batch`-sized sweeps until a sweep
/// comes back short. A counter-store error aborts the current sweep; the
/// next tick retries. Cancellation lets the in-flight batch finish, then
/// the task exits. The durable store is never touched from here.
pub async fn run<C, D>(
    engine: Arc<Engine<C, D>>,
    interval: Duration,
    batch: usize,
    shutdown: CancellationToken,
) where
    C: CounterStore,
    D: DurableStock,
{
    let mut ticker = tokio::time::interval(interval);
    'outer: loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        loop {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis() as i64;
            let started = Instant::now();
            match engine.sweep_expired(now, batch).await {
                Ok(released) => {
                    if released > 0 {
                        metrics::counter!(observability::REAPER_SWEPT_TOTAL)
                            .increment(released as u64);
                        metrics::histogram!(observability::REAPER_SWEEP_DURATION_SECONDS)
                            .record(started.elapsed().as_secs_f64());
                    }
                    // A full batch means the index may hold more backlog.
                    if released < batch {
                        break;
                    }
                    if shutdown.is_cancelled() {
                        break 'outer;
                    }
                }
                Err(e) => {
                    // Next tick retries; releases already applied stand.
                    warn!("reaper sweep aborted: {e}");
                    break;
                }
            }
        }
    }
    info!("reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::counter::MemoryCounterStore;
    use crate::model::{EventKind, ReleaseReason};
    use crate::stock::MemoryStock;

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    async fn engine_with_stock(
        sku: &str,
        total: i64,
    ) -> Arc<Engine<MemoryCounterStore, MemoryStock>> {
        let counter = MemoryCounterStore::new(true);
        counter.mirror_total(sku, total).await.unwrap();
        let stock = MemoryStock::new();
        stock.set_total(sku, total);
        Arc::new(Engine::new(counter, stock, &Config::default()))
    }

    #[tokio::test]
    async fn reaper_releases_expired_holds() {
        let engine = engine_with_stock("sku-123", 10).await;

        // A hold whose lease is already in the past.
        engine
            .counter()
            .reserve("sku-123", "cart-x", 2, 1_000, now_ms() - 10_000)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            128,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snap = engine.snapshot("sku-123").await.unwrap();
        assert_eq!(snap.reserved, 0);
        assert!(engine.counter().peek_hold("sku-123", "cart-x").await.unwrap().is_none());

        let events = engine.events(10).await.unwrap();
        let released = events
            .iter()
            .find(|e| e.kind == EventKind::HoldReleased)
            .expect("release event recorded");
        assert_eq!(released.reason, Some(ReleaseReason::Expired));
        assert_eq!(released.cart_id, "cart-x");
    }

    #[tokio::test]
    async fn reaper_leaves_live_holds_alone() {
        let engine = engine_with_stock("sku-123", 10).await;
        engine
            .reserve("sku-123", 3, "cart-live", Some(3_600))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            128,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snap = engine.snapshot("sku-123").await.unwrap();
        assert_eq!(snap.reserved, 3);
    }

    #[tokio::test]
    async fn reaper_stops_promptly_on_cancellation() {
        let engine = engine_with_stock("sku-123", 1).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            engine,
            Duration::from_secs(3600), // would never tick again on its own
            128,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper exited after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_drains_backlog_beyond_one_batch() {
        let engine = engine_with_stock("sku-123", 100).await;
        let past = now_ms() - 60_000;
        for i in 0..10 {
            engine
                .counter()
                .reserve("sku-123", &format!("cart-{i}"), 1, 1_000, past)
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            engine.clone(),
            Duration::from_millis(10),
            3, // force several sweeps per tick
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snap = engine.snapshot("sku-123").await.unwrap();
        assert_eq!(snap.reserved, 0);
    }
}
