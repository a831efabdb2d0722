use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{HOUR, Ms, to_local};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::validate_candidate;
use super::{Engine, ReservationError};

/// Source of truth for which session instances exist.
#[async_trait]
pub trait SlotCatalog: Send + Sync {
    /// Instances matching `filter`, ascending by start.
    async fn list_instances(&self, filter: &InstanceFilter) -> Vec<SessionInstance>;
}

/// Booking history, read by the conflict detector.
#[async_trait]
pub trait BookingHistory: Send + Sync {
    /// Confirmed (not cancelled) bookings for a swimmer, ascending by start.
    async fn list_confirmed_bookings(&self, swimmer_id: SwimmerId) -> Vec<Booking>;
}

/// Catalog entry as supplied by the scheduling side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInstance {
    pub id: Option<InstanceId>,
    pub span: Span,
    pub instructor_id: InstructorId,
    pub location: String,
    pub capacity: u32,
    #[serde(default)]
    pub booked_count: u32,
    pub kind: SessionKind,
}

#[async_trait]
impl SlotCatalog for Engine {
    async fn list_instances(&self, filter: &InstanceFilter) -> Vec<SessionInstance> {
        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for slot in slots {
            let guard = slot.read().await;
            if filter.accepts(&guard.instance) {
                out.push(guard.instance.clone());
            }
        }
        out.sort_by_key(|i| (i.span.start, i.id));
        out
    }
}

#[async_trait]
impl BookingHistory for Engine {
    async fn list_confirmed_bookings(&self, swimmer_id: SwimmerId) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .ledger
            .for_swimmer(&swimmer_id)
            .into_iter()
            .filter(Booking::is_confirmed)
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));
        bookings
    }
}

impl Engine {
    pub async fn create_instance(&self, new: NewInstance) -> Result<SessionInstance, ReservationError> {
        validate_candidate(&new.span)?;
        if new.capacity == 0 {
            return Err(ReservationError::invalid("capacity must be at least 1"));
        }
        if new.booked_count > new.capacity {
            return Err(ReservationError::invalid("booked count exceeds capacity"));
        }
        if new.location.len() > MAX_LOCATION_LEN {
            return Err(ReservationError::invalid("location too long"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.slots.len() >= MAX_INSTANCES {
            return Err(ReservationError::invalid("too many session instances"));
        }
        let id = new.id.unwrap_or_else(Ulid::new);
        if self.slots.contains_key(&id) {
            return Err(ReservationError::invalid(format!("session {id} already exists")));
        }

        let instance = SessionInstance {
            id,
            span: new.span,
            instructor_id: new.instructor_id,
            location: new.location,
            capacity: new.capacity,
            booked_count: new.booked_count,
            kind: new.kind,
        };
        self.persist_instance(instance.clone()).await?;
        debug!("session {id} created at {}", instance.span.start);
        Ok(instance)
    }

    pub async fn get_instance(&self, id: InstanceId) -> Option<SessionInstance> {
        let slot = self.get_slot(&id)?;
        let guard = slot.read().await;
        Some(guard.instance.clone())
    }

    pub async fn find_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<SessionInstance>, ReservationError> {
        if filter.range_start > filter.range_end {
            return Err(ReservationError::invalid("range start is after range end"));
        }
        if (filter.range_end - filter.range_start).num_days() > MAX_QUERY_DAYS {
            return Err(ReservationError::invalid("date range too wide"));
        }
        Ok(self.list_instances(filter).await)
    }

    pub fn get_booking(&self, id: BookingId) -> Option<Booking> {
        self.ledger.bookings.get(&id).map(|b| b.value().clone())
    }

    /// Every booking a swimmer has made, cancelled ones included, by start.
    pub async fn swimmer_bookings(&self, swimmer_id: SwimmerId) -> Vec<Booking> {
        let mut bookings = self.ledger.for_swimmer(&swimmer_id);
        bookings.sort_by_key(|b| (b.span.start, b.id));
        bookings
    }

    /// A booking, provided it belongs to `swimmer_id`.
    pub(super) fn owned_booking(
        &self,
        booking_id: BookingId,
        swimmer_id: SwimmerId,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .get_booking(booking_id)
            .ok_or(ReservationError::NotFound(booking_id))?;
        if booking.swimmer_id != swimmer_id {
            return Err(ReservationError::invalid(format!(
                "booking {booking_id} does not belong to swimmer {swimmer_id}"
            )));
        }
        Ok(booking)
    }

    /// Refuse to give up `booking` once its start is inside the notice window.
    pub(super) fn check_notice(&self, booking: &Booking, now: Ms) -> Result<(), ReservationError> {
        let until_start = booking.span.start - to_local(now, self.policy.utc_offset);
        if until_start < TimeDelta::milliseconds(self.policy.min_cancel_notice_ms) {
            return Err(ReservationError::LateCancellation {
                booking_id: booking.id,
                hours_before: until_start.num_hours(),
                notice_hours: self.policy.min_cancel_notice_ms / HOUR,
            });
        }
        Ok(())
    }

    /// Re-read a booking under its slot lock; a concurrent cancel may have won.
    pub(super) fn confirmed_booking(&self, booking_id: BookingId) -> Result<Booking, ReservationError> {
        let current = self
            .get_booking(booking_id)
            .ok_or(ReservationError::NotFound(booking_id))?;
        if !current.is_confirmed() {
            return Err(ReservationError::invalid(format!(
                "booking {booking_id} is already cancelled"
            )));
        }
        Ok(current)
    }

    /// Cancel a confirmed booking and free its seat. Refused inside the notice window.
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        swimmer_id: SwimmerId,
    ) -> Result<Booking, ReservationError> {
        let booking = self.owned_booking(booking_id, swimmer_id)?;

        let slot = self.slot(&booking.session_instance_id)?;
        let mut guard = slot.write().await;
        let current = self.confirmed_booking(booking_id)?;
        let now = self.now();
        self.check_notice(&current, now)?;

        let event = Event::BookingCancelled {
            id: booking_id,
            session_instance_id: current.session_instance_id,
            cancelled_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {booking_id} cancelled for swimmer {swimmer_id}");
        self.get_booking(booking_id)
            .ok_or(ReservationError::NotFound(booking_id))
    }

    /// Open slots a family could take instead of a full one: same weekday and
    /// time within two weeks either side, or any time on the same date.
    /// Nearest first.
    pub async fn suggest_alternatives(
        &self,
        instance_id: InstanceId,
        limit: usize,
    ) -> Result<Vec<SessionInstance>, ReservationError> {
        let wanted = self
            .get_instance(instance_id)
            .await
            .ok_or(ReservationError::NotFound(instance_id))?;
        let date = wanted.span.date();
        let window = Days::new(ALTERNATIVE_WINDOW_DAYS);
        let filter = InstanceFilter {
            range_start: date.checked_sub_days(window).unwrap_or(NaiveDate::MIN),
            range_end: date.checked_add_days(window).unwrap_or(NaiveDate::MAX),
            instructor_id: None,
            location: Some(wanted.location.clone()),
        };

        let mut candidates: Vec<SessionInstance> = self
            .list_instances(&filter)
            .await
            .into_iter()
            .filter(|i| i.id != instance_id && !i.is_full() && i.kind == wanted.kind)
            .filter(|i| {
                let same_slot = i.span.start.weekday() == wanted.span.start.weekday()
                    && i.span.start.time() == wanted.span.start.time();
                same_slot || i.span.date() == date
            })
            .collect();
        candidates.sort_by_key(|i| ((i.span.start - wanted.span.start).abs(), i.id));
        candidates.truncate(limit.min(MAX_ALTERNATIVES));
        Ok(candidates)
    }
}
