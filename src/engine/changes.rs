use std::collections::BTreeSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::to_local;
use crate::model::*;
use crate::observability;

use super::catalog::BookingHistory;
use super::conflict::find_conflict;
use super::holds::verify_hold;
use super::{Engine, ReservationError};

impl Engine {
    /// Move a confirmed booking to another session. The target is held first,
    /// then the old booking's cancellation and the new booking commit together
    /// under both instance locks. The moved booking keeps its series id.
    pub async fn reschedule_booking(
        &self,
        booking_id: BookingId,
        swimmer_id: SwimmerId,
        target_id: InstanceId,
    ) -> Result<Booking, ReservationError> {
        let booking = self.owned_booking(booking_id, swimmer_id)?;
        if !booking.is_confirmed() {
            return Err(ReservationError::invalid(format!(
                "booking {booking_id} is already cancelled"
            )));
        }
        if booking.session_instance_id == target_id {
            return Err(ReservationError::invalid(format!(
                "booking {booking_id} is already in session {target_id}"
            )));
        }
        self.check_notice(&booking, self.now())?;

        let swimmer_lock = self.swimmer_lock(swimmer_id);
        let _swimmer = swimmer_lock.lock().await;

        let holder = format!("reschedule:{booking_id}");
        self.acquire_hold(target_id, &holder).await?;
        match self.move_booking(&booking, target_id, &holder).await {
            Ok(moved) => {
                metrics::counter!(observability::BOOKINGS_RESCHEDULED_TOTAL).increment(1);
                info!(
                    "booking {booking_id} moved from {} to {target_id} as {}",
                    booking.session_instance_id, moved.id
                );
                Ok(moved)
            }
            Err(e) => {
                if let Err(release) = self.release_hold(target_id, &holder).await {
                    debug!("release of reschedule hold on {target_id} skipped: {release}");
                }
                Err(e)
            }
        }
    }

    async fn move_booking(
        &self,
        booking: &Booking,
        target_id: InstanceId,
        holder: &str,
    ) -> Result<Booking, ReservationError> {
        let target = self
            .get_instance(target_id)
            .await
            .ok_or(ReservationError::NotFound(target_id))?;
        let history: Vec<Booking> = self
            .list_confirmed_bookings(booking.swimmer_id)
            .await
            .into_iter()
            .filter(|b| b.id != booking.id)
            .collect();
        if let Some(existing) = find_conflict(&history, &target.span) {
            return Err(ReservationError::ConflictDetected {
                instance_id: target_id,
                conflicting_with: existing.id,
            });
        }

        let mut ids = [booking.session_instance_id, target_id];
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.slot(id)?.write_owned().await);
        }

        let now = self.now();
        let current = self.confirmed_booking(booking.id)?;
        self.check_notice(&current, now)?;
        let slot = guards
            .iter()
            .find(|g| g.instance.id == target_id)
            .ok_or(ReservationError::NotFound(target_id))?;
        verify_hold(slot, holder, now)?;
        if slot.instance.is_full() {
            return Err(ReservationError::SlotUnavailable(target_id));
        }

        let moved_id = Ulid::new();
        let events = [
            Event::BookingCancelled {
                id: current.id,
                session_instance_id: current.session_instance_id,
                cancelled_at: now,
            },
            Event::BookingConfirmed {
                id: moved_id,
                series_id: current.series_id,
                swimmer_id: current.swimmer_id,
                session_instance_id: target_id,
                span: slot.instance.span,
                created_at: now,
            },
        ];
        self.persist_and_apply_batch(&mut guards, &events).await?;
        self.get_booking(moved_id)
            .ok_or(ReservationError::NotFound(moved_id))
    }

    /// Cancel every remaining booking of a series in one commit. Sessions that
    /// have started, or that fall inside the notice window, are left booked and
    /// reported back.
    pub async fn cancel_series(
        &self,
        swimmer_id: SwimmerId,
        series_id: SeriesId,
    ) -> Result<SeriesCancellation, ReservationError> {
        let swimmer_lock = self.swimmer_lock(swimmer_id);
        let _swimmer = swimmer_lock.lock().await;

        let bookings: Vec<Booking> = self
            .list_confirmed_bookings(swimmer_id)
            .await
            .into_iter()
            .filter(|b| b.series_id == series_id)
            .collect();
        if bookings.is_empty() {
            return Err(ReservationError::NotFound(series_id));
        }

        let now = self.now();
        let local_now = to_local(now, self.policy.utc_offset);
        let mut skipped_past = Vec::new();
        let mut skipped_late = Vec::new();
        let mut due = Vec::new();
        for booking in bookings {
            if booking.span.start <= local_now {
                skipped_past.push(booking.id);
            } else if self.check_notice(&booking, now).is_err() {
                skipped_late.push(booking.id);
            } else {
                due.push(booking);
            }
        }

        let ids: BTreeSet<InstanceId> = due.iter().map(|b| b.session_instance_id).collect();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.slot(id)?.write_owned().await);
        }
        let events: Vec<Event> = due
            .iter()
            .filter(|b| self.confirmed_booking(b.id).is_ok())
            .map(|b| Event::BookingCancelled {
                id: b.id,
                session_instance_id: b.session_instance_id,
                cancelled_at: now,
            })
            .collect();
        if !events.is_empty() {
            self.persist_and_apply_batch(&mut guards, &events).await?;
        }
        drop(guards);

        let cancelled: Vec<Booking> = events
            .iter()
            .filter_map(|e| match e {
                Event::BookingCancelled { id, .. } => self.get_booking(*id),
                _ => None,
            })
            .collect();
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(cancelled.len() as u64);
        info!(
            "series {series_id} for swimmer {swimmer_id}: {} cancelled, {} past, {} inside notice",
            cancelled.len(),
            skipped_past.len(),
            skipped_late.len()
        );
        Ok(SeriesCancellation {
            series_id,
            cancelled,
            skipped_past,
            skipped_late,
        })
    }
}
