use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;
use crate::observability;

use super::catalog::BookingHistory;
use super::conflict::find_conflict;
use super::holds::{validate_holder, verify_hold};
use super::{Engine, ErrorKind, ReservationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    Idle,
    Holding,
    Confirming,
    Confirmed,
    Failed(ErrorKind),
    Released,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Confirmed | AttemptState::Failed(_) | AttemptState::Released
        )
    }
}

/// One all-or-nothing booking of a batch of instances (a single lesson, or a
/// whole recurring series). Either every instance ends up booked, or none does
/// and every hold taken along the way is given back.
///
/// Dropping an attempt mid-flight leaves its holds to lapse at TTL.
pub struct BookingAttempt<'a> {
    engine: &'a Engine,
    swimmer_id: SwimmerId,
    holder_id: HolderId,
    instance_ids: Vec<InstanceId>,
    held: Vec<InstanceId>,
    state: AttemptState,
}

impl<'a> BookingAttempt<'a> {
    pub fn new(
        engine: &'a Engine,
        swimmer_id: SwimmerId,
        holder_id: impl Into<HolderId>,
        instance_ids: Vec<InstanceId>,
    ) -> Self {
        Self {
            engine,
            swimmer_id,
            holder_id: holder_id.into(),
            instance_ids,
            held: Vec::new(),
            state: AttemptState::Idle,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Instances currently held by this attempt.
    pub fn held(&self) -> &[InstanceId] {
        &self.held
    }

    fn validate(&self) -> Result<(), ReservationError> {
        if self.instance_ids.is_empty() {
            return Err(ReservationError::invalid("no sessions selected"));
        }
        if self.instance_ids.len() > MAX_BATCH_SIZE {
            return Err(ReservationError::invalid(format!(
                "at most {MAX_BATCH_SIZE} sessions per booking"
            )));
        }
        let mut seen = HashSet::with_capacity(self.instance_ids.len());
        if let Some(dup) = self.instance_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ReservationError::invalid(format!("session {dup} selected twice")));
        }
        validate_holder(&self.holder_id)
    }

    /// Idle → Holding. Acquires a hold on every instance; the first refusal
    /// releases whatever was taken and fails the attempt.
    pub async fn hold(&mut self) -> Result<(), ReservationError> {
        if self.state != AttemptState::Idle {
            return Err(ReservationError::invalid(format!(
                "attempt is {:?}, expected Idle",
                self.state
            )));
        }
        self.validate()?;

        self.state = AttemptState::Holding;
        let ids = self.instance_ids.clone();
        for id in ids {
            match self.engine.acquire_hold(id, &self.holder_id).await {
                Ok(_) => self.held.push(id),
                Err(e) => return Err(self.fail(e).await),
            }
        }
        debug!("holding {} sessions for {}", self.held.len(), self.holder_id);
        Ok(())
    }

    /// Holding → Confirming → Confirmed. Conflict checks run against the
    /// swimmer's confirmed bookings and across the batch itself; then every
    /// instance is locked (ascending id) and re-verified before anything commits.
    pub async fn confirm(&mut self) -> Result<Vec<Booking>, ReservationError> {
        if self.state != AttemptState::Holding {
            return Err(ReservationError::invalid(format!(
                "attempt is {:?}, expected Holding",
                self.state
            )));
        }
        self.state = AttemptState::Confirming;

        let swimmer_lock = self.engine.swimmer_lock(self.swimmer_id);
        let _swimmer = swimmer_lock.lock().await;

        let instances = match self.snapshot_instances().await {
            Ok(instances) => instances,
            Err(e) => return Err(self.fail(e).await),
        };
        if let Err(e) = self.check_conflicts(&instances).await {
            return Err(self.fail(e).await);
        }
        match self.commit().await {
            Ok(bookings) => {
                self.held.clear();
                self.state = AttemptState::Confirmed;
                metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL)
                    .increment(bookings.len() as u64);
                info!(
                    "swimmer {} booked {} sessions",
                    self.swimmer_id,
                    bookings.len()
                );
                Ok(bookings)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Give up before confirmation. A no-op once the attempt has finished.
    pub async fn release(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.release_held().await;
        self.state = AttemptState::Released;
    }

    async fn snapshot_instances(&self) -> Result<Vec<SessionInstance>, ReservationError> {
        let mut out = Vec::with_capacity(self.instance_ids.len());
        for id in &self.instance_ids {
            let instance = self
                .engine
                .get_instance(*id)
                .await
                .ok_or(ReservationError::NotFound(*id))?;
            out.push(instance);
        }
        Ok(out)
    }

    async fn check_conflicts(&self, instances: &[SessionInstance]) -> Result<(), ReservationError> {
        let history = self.engine.list_confirmed_bookings(self.swimmer_id).await;
        for instance in instances {
            if let Some(existing) = find_conflict(&history, &instance.span) {
                return Err(ReservationError::ConflictDetected {
                    instance_id: instance.id,
                    conflicting_with: existing.id,
                });
            }
        }

        let mut by_start: Vec<&SessionInstance> = instances.iter().collect();
        by_start.sort_by_key(|i| (i.span.start, i.id));
        for pair in by_start.windows(2) {
            if pair[0].span.overlaps(&pair[1].span) {
                return Err(ReservationError::ConflictDetected {
                    instance_id: pair[1].id,
                    conflicting_with: pair[0].id,
                });
            }
        }
        Ok(())
    }

    async fn commit(&self) -> Result<Vec<Booking>, ReservationError> {
        let mut ids = self.instance_ids.clone();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let slot = self.engine.slot(id)?;
            guards.push(slot.write_owned().await);
        }

        let now = self.engine.now();
        for guard in &guards {
            verify_hold(guard, &self.holder_id, now)?;
            if guard.instance.is_full() {
                return Err(ReservationError::SlotUnavailable(guard.instance.id));
            }
        }

        let series_id = Ulid::new();
        let events: Vec<Event> = guards
            .iter()
            .map(|guard| Event::BookingConfirmed {
                id: Ulid::new(),
                series_id,
                swimmer_id: self.swimmer_id,
                session_instance_id: guard.instance.id,
                span: guard.instance.span,
                created_at: now,
            })
            .collect();
        self.engine
            .persist_and_apply_batch(&mut guards, &events)
            .await?;

        let mut bookings: Vec<Booking> = events
            .iter()
            .filter_map(|event| match event {
                Event::BookingConfirmed { id, .. } => self.engine.get_booking(*id),
                _ => None,
            })
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));
        Ok(bookings)
    }

    async fn fail(&mut self, err: ReservationError) -> ReservationError {
        let kind = err.kind();
        metrics::counter!(observability::BOOKING_ATTEMPTS_FAILED_TOTAL, "kind" => kind.as_str())
            .increment(1);
        warn!(
            "booking attempt for swimmer {} failed ({}): {err}; releasing {} holds",
            self.swimmer_id,
            kind.as_str(),
            self.held.len()
        );
        self.release_held().await;
        self.state = AttemptState::Failed(kind);
        err
    }

    async fn release_held(&mut self) {
        for id in std::mem::take(&mut self.held) {
            // NotHolder here means our hold lapsed and someone else took the slot.
            if let Err(e) = self.engine.release_hold(id, &self.holder_id).await {
                debug!("compensating release of {id} skipped: {e}");
            }
        }
    }
}

impl Engine {
    /// Book `instance_ids` for a swimmer, holding under the swimmer's own id.
    pub async fn confirm_booking(
        &self,
        swimmer_id: SwimmerId,
        instance_ids: Vec<InstanceId>,
    ) -> Result<Vec<Booking>, ReservationError> {
        self.confirm_booking_as(swimmer_id, swimmer_id.to_string(), instance_ids)
            .await
    }

    /// Book `instance_ids` for a swimmer. `holder_id` may already hold some or all
    /// of them (a checkout in progress); those holds are renewed, not contested.
    pub async fn confirm_booking_as(
        &self,
        swimmer_id: SwimmerId,
        holder_id: impl Into<HolderId>,
        instance_ids: Vec<InstanceId>,
    ) -> Result<Vec<Booking>, ReservationError> {
        let mut attempt = BookingAttempt::new(self, swimmer_id, holder_id, instance_ids);
        attempt.hold().await?;
        attempt.confirm().await
    }
}
