mod catalog;
mod changes;
mod conflict;
mod error;
mod holds;
mod orchestrator;
mod recurring;

pub use catalog::{BookingHistory, NewInstance, SlotCatalog};
pub use conflict::{find_conflict, validate_candidate};
pub use error::{ErrorKind, ReservationError};
pub use orchestrator::{AttemptState, BookingAttempt};
pub use recurring::{expected_dates, resolve, resolve_recurring};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::clock::{Clock, Ms};
use crate::config::BookingPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<SlotState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum WalCommand {
    /// One journal record: every event in it commits or none does.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Write and fsync every record of the group. On any failure the whole group is
/// cut back off the file, so the journal never keeps part of an unacknowledged commit.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!("journal rollback failed: {e}");
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Confirmed and cancelled bookings, indexed by swimmer.
#[derive(Default)]
pub(super) struct Ledger {
    pub(super) bookings: DashMap<BookingId, Booking>,
    pub(super) by_swimmer: DashMap<SwimmerId, Vec<BookingId>>,
}

impl Ledger {
    fn insert(&self, booking: Booking) {
        self.by_swimmer
            .entry(booking.swimmer_id)
            .or_default()
            .push(booking.id);
        self.bookings.insert(booking.id, booking);
    }

    pub(super) fn for_swimmer(&self, swimmer_id: &SwimmerId) -> Vec<Booking> {
        let ids = self
            .by_swimmer
            .get(swimmer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect()
    }
}

/// Apply an event to a slot (no locking: the caller holds the slot's write lock).
fn apply_to_slot(slot: &mut SlotState, event: &Event, ledger: &Ledger) {
    match event {
        Event::HoldAcquired {
            session_instance_id,
            holder_id,
            acquired_at,
            expires_at,
        } => {
            slot.hold = Some(Hold {
                session_instance_id: *session_instance_id,
                holder_id: holder_id.clone(),
                acquired_at: *acquired_at,
                expires_at: *expires_at,
            });
        }
        Event::HoldReleased { .. } => {
            slot.hold = None;
        }
        Event::BookingConfirmed {
            id,
            series_id,
            swimmer_id,
            session_instance_id,
            span,
            created_at,
        } => {
            slot.instance.booked_count += 1;
            slot.hold = None;
            ledger.insert(Booking {
                id: *id,
                series_id: *series_id,
                swimmer_id: *swimmer_id,
                session_instance_id: *session_instance_id,
                span: *span,
                status: BookingStatus::Confirmed,
                created_at: *created_at,
                cancelled_at: None,
            });
        }
        Event::BookingCancelled {
            id, cancelled_at, ..
        } => {
            slot.instance.booked_count = slot.instance.booked_count.saturating_sub(1);
            if let Some(mut booking) = ledger.bookings.get_mut(id) {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
            }
        }
        // Handled at the DashMap level.
        Event::InstanceCreated { .. } => {}
    }
}

/// Reservation core: catalog slots, holds, bookings. Mutual exclusion is per
/// session instance (one `RwLock` each) plus one mutex per swimmer for confirmations.
pub struct Engine {
    pub(super) slots: DashMap<InstanceId, SharedSlot>,
    pub(super) ledger: Ledger,
    swimmer_locks: DashMap<SwimmerId, Arc<Mutex<()>>>,
    /// Serializes instance creation against compaction.
    pub(super) catalog_lock: Mutex<()>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: BookingPolicy,
}

impl Engine {
    /// Open the journal at `wal_path`, replay it, and start the group-commit writer.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self::build(Some(wal_tx), notify, clock, policy);
        let replayed = events.len();
        for event in &events {
            engine.replay_event(event);
        }
        info!(
            "journal replayed: {replayed} events, {} instances, {} bookings",
            engine.slots.len(),
            engine.ledger.bookings.len()
        );
        Ok(engine)
    }

    /// Engine without a journal. State lives only as long as the process.
    pub fn in_memory(notify: Arc<NotifyHub>, clock: Arc<dyn Clock>, policy: BookingPolicy) -> Self {
        Self::build(None, notify, clock, policy)
    }

    fn build(
        wal_tx: Option<mpsc::Sender<WalCommand>>,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            ledger: Ledger::default(),
            swimmer_locks: DashMap::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            notify,
            clock,
            policy,
        }
    }

    // We are the sole owner of every slot during replay, so try_write always succeeds.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::InstanceCreated { instance } => {
                let slot = SlotState::new(instance.clone());
                self.slots.insert(instance.id, Arc::new(RwLock::new(slot)));
            }
            other => {
                let id = other.session_instance_id();
                let Some(slot) = self.get_slot(&id) else {
                    warn!("replay: event for unknown instance {id}, skipping");
                    return;
                };
                match slot.try_write() {
                    Ok(mut guard) => apply_to_slot(&mut guard, other, &self.ledger),
                    Err(_) => warn!("replay: instance {id} unexpectedly locked"),
                };
            }
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(super) fn get_slot(&self, id: &InstanceId) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn slot(&self, id: &InstanceId) -> Result<SharedSlot, ReservationError> {
        self.get_slot(id).ok_or(ReservationError::NotFound(*id))
    }

    /// Per-swimmer mutex; never held while waiting on another swimmer.
    pub(super) fn swimmer_lock(&self, swimmer_id: SwimmerId) -> Arc<Mutex<()>> {
        self.swimmer_locks.entry(swimmer_id).or_default().value().clone()
    }

    /// Drop swimmer mutexes nobody is holding or waiting on. Returns how many went.
    pub fn prune_swimmer_locks(&self) -> usize {
        let before = self.swimmer_locks.len();
        self.swimmer_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.swimmer_locks.len())
    }

    /// Write one record to the journal via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), ReservationError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| ReservationError::Storage("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| ReservationError::Storage("journal writer dropped response".into()))?
            .map_err(|e| ReservationError::Storage(e.to_string()))
    }

    /// Journal + apply + notify, under the caller's slot write lock.
    pub(super) async fn persist_and_apply(
        &self,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), ReservationError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_slot(slot, event, &self.ledger);
        self.notify.send(event.session_instance_id(), event);
        Ok(())
    }

    /// Journal a multi-instance change as a single record, then apply each event
    /// to the locked slot it names. Nothing is applied unless the record is durable.
    pub(super) async fn persist_and_apply_batch(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<SlotState>],
        events: &[Event],
    ) -> Result<(), ReservationError> {
        for event in events {
            let id = event.session_instance_id();
            if !guards.iter().any(|g| g.instance.id == id) {
                return Err(ReservationError::invalid(format!("session {id} is not locked")));
            }
        }
        self.wal_append(events.to_vec()).await?;
        for event in events {
            let id = event.session_instance_id();
            if let Some(slot) = guards.iter_mut().find(|g| g.instance.id == id) {
                apply_to_slot(slot, event, &self.ledger);
            }
            self.notify.send(id, event);
        }
        Ok(())
    }

    /// Journal + insert a brand-new slot.
    pub(super) async fn persist_instance(&self, instance: SessionInstance) -> Result<(), ReservationError> {
        let id = instance.id;
        let event = Event::InstanceCreated {
            instance: instance.clone(),
        };
        self.wal_append(vec![event.clone()]).await?;
        self.slots
            .insert(id, Arc::new(RwLock::new(SlotState::new(instance))));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Rewrite the journal with only the events needed to recreate the current state.
    /// All slots are read-locked (in id order) until the new file is in place, so no
    /// append can land in the old file after the snapshot.
    pub async fn compact_journal(&self) -> Result<(), ReservationError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _catalog = self.catalog_lock.lock().await;

        let mut ids: Vec<InstanceId> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(slot) = self.get_slot(id) {
                guards.push(slot.read_owned().await);
            }
        }

        let mut by_instance: HashMap<InstanceId, Vec<Booking>> = HashMap::new();
        for entry in self.ledger.bookings.iter() {
            let b = entry.value();
            by_instance
                .entry(b.session_instance_id)
                .or_default()
                .push(b.clone());
        }

        let now = self.now();
        let mut events = Vec::new();
        for guard in &guards {
            let mut bookings = by_instance.remove(&guard.instance.id).unwrap_or_default();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            let confirmed = bookings.iter().filter(|b| b.is_confirmed()).count() as u32;

            let mut instance = guard.instance.clone();
            instance.booked_count = instance.booked_count.saturating_sub(confirmed);
            events.push(Event::InstanceCreated { instance });

            for b in bookings {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    series_id: b.series_id,
                    swimmer_id: b.swimmer_id,
                    session_instance_id: b.session_instance_id,
                    span: b.span,
                    created_at: b.created_at,
                });
                if let Some(cancelled_at) = b.cancelled_at {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        session_instance_id: b.session_instance_id,
                        cancelled_at,
                    });
                }
            }

            if let Some(hold) = guard.active_hold(now) {
                events.push(Event::HoldAcquired {
                    session_instance_id: hold.session_instance_id,
                    holder_id: hold.holder_id.clone(),
                    acquired_at: hold.acquired_at,
                    expires_at: hold.expires_at,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| ReservationError::Storage("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| ReservationError::Storage("journal writer dropped response".into()))?
            .map_err(|e| ReservationError::Storage(e.to_string()))?;
        info!("journal compacted to {count} events");
        Ok(())
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
