use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// Purge every lapsed hold record once. Returns how many were purged.
///
/// Expiry is already lazy (an expired hold reads as absent everywhere), so
/// this only keeps the slot table and watchers tidy.
pub async fn sweep_expired_holds(engine: &Engine) -> usize {
    let mut purged = 0;
    for id in engine.collect_expired_holds(engine.now()) {
        match engine.purge_expired_hold(id).await {
            Ok(true) => purged += 1,
            Ok(false) => {}
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    if purged > 0 {
        metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(purged as u64);
        debug!("reaped {purged} expired holds");
    }
    purged
}

/// Background task that periodically purges expired holds, idle watch
/// channels and idle swimmer locks.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_expired_holds(&engine).await;
        engine.notify.prune();
        let pruned = engine.prune_swimmer_locks();
        if pruned > 0 {
            debug!("dropped {pruned} idle swimmer locks");
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_journal().await {
            Ok(()) => info!("compacted journal after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MINUTE, ManualClock};
    use crate::config::BookingPolicy;
    use crate::engine::NewInstance;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, TimeDelta};
    use ulid::Ulid;

    fn setup() -> (Arc<Engine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let engine = Engine::in_memory(
            Arc::new(NotifyHub::new()),
            clock.clone(),
            BookingPolicy::default(),
        );
        (Arc::new(engine), clock)
    }

    async fn lesson(engine: &Engine) -> InstanceId {
        let start = NaiveDate::from_ymd_opt(2024, 1, 8)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        engine
            .create_instance(NewInstance {
                id: None,
                span: Span::new(start, start + TimeDelta::minutes(30)),
                instructor_id: Ulid::new(),
                location: "Turlock".into(),
                capacity: 1,
                booked_count: 0,
                kind: SessionKind::Recurring,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn sweep_purges_only_lapsed_holds() {
        let (engine, clock) = setup();
        let stale = lesson(&engine).await;
        let fresh = lesson(&engine).await;

        engine.acquire_hold(stale, "a").await.unwrap();
        clock.advance(4 * MINUTE);
        engine.acquire_hold(fresh, "b").await.unwrap();
        clock.advance(2 * MINUTE);

        assert_eq!(engine.collect_expired_holds(engine.now()), vec![stale]);
        assert_eq!(sweep_expired_holds(&engine).await, 1);
        assert!(engine.collect_expired_holds(engine.now()).is_empty());
        assert!(engine.get_hold(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn renewed_hold_survives_purge() {
        let (engine, clock) = setup();
        let id = lesson(&engine).await;
        engine.acquire_hold(id, "a").await.unwrap();
        clock.advance(6 * MINUTE);
        let expired = engine.collect_expired_holds(engine.now());
        assert_eq!(expired, vec![id]);

        // Re-acquired between collection and purge.
        engine.acquire_hold(id, "b").await.unwrap();
        assert!(!engine.purge_expired_hold(id).await.unwrap());
        assert_eq!(engine.get_hold(id).await.unwrap().unwrap().holder_id, "b");
    }

    #[tokio::test]
    async fn sweep_with_nothing_expired_is_noop() {
        let (engine, _clock) = setup();
        let id = lesson(&engine).await;
        engine.acquire_hold(id, "a").await.unwrap();
        assert_eq!(sweep_expired_holds(&engine).await, 0);
    }
}
