use chrono::TimeDelta;

use crate::limits::MAX_SESSION_DURATION_MS;
use crate::model::*;

use super::catalog::BookingHistory;
use super::{Engine, ReservationError};

/// Reject empty, inverted, or absurdly long candidate intervals before they reach
/// the detector.
pub fn validate_candidate(span: &Span) -> Result<(), ReservationError> {
    if span.start >= span.end {
        return Err(ReservationError::invalid(format!(
            "interval [{}, {}) is empty or inverted",
            span.start, span.end
        )));
    }
    if span.duration() > TimeDelta::milliseconds(MAX_SESSION_DURATION_MS) {
        return Err(ReservationError::invalid("interval too long"));
    }
    Ok(())
}

/// First confirmed booking whose `[start, end)` overlaps the candidate.
/// Cancelled bookings never conflict; back-to-back sessions never conflict.
pub fn find_conflict<'a>(bookings: &'a [Booking], candidate: &Span) -> Option<&'a Booking> {
    bookings
        .iter()
        .filter(|b| b.is_confirmed())
        .find(|b| b.span.overlaps(candidate))
}

pub(super) fn report(conflict: Option<&Booking>) -> ConflictReport {
    match conflict {
        Some(b) => ConflictReport {
            has_conflict: true,
            conflicting_booking_id: Some(b.id),
            message: format!(
                "This swimmer already has a lesson from {} to {}. Please pick a different time.",
                b.span.start.format("%a %b %-d %-I:%M %p"),
                b.span.end.format("%-I:%M %p"),
            ),
        },
        None => ConflictReport {
            has_conflict: false,
            conflicting_booking_id: None,
            message: "No scheduling conflicts.".to_string(),
        },
    }
}

/// Stateless per call: fetch the swimmer's confirmed bookings, test overlap.
pub async fn detect<H: BookingHistory + ?Sized>(
    history: &H,
    swimmer_id: SwimmerId,
    candidate: &Span,
) -> ConflictReport {
    let bookings = history.list_confirmed_bookings(swimmer_id).await;
    report(find_conflict(&bookings, candidate))
}

impl Engine {
    pub async fn check_conflict(
        &self,
        swimmer_id: SwimmerId,
        candidate: Span,
    ) -> Result<ConflictReport, ReservationError> {
        validate_candidate(&candidate)?;
        Ok(detect(self, swimmer_id, &candidate).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use ulid::Ulid;

    fn at(hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 8)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn booking(start: NaiveDateTime, end: NaiveDateTime, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            series_id: Ulid::new(),
            swimmer_id: Ulid::new(),
            session_instance_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            created_at: 0,
            cancelled_at: None,
        }
    }

    #[test]
    fn overlap_is_detected() {
        let existing = vec![booking(at(15, 0), at(15, 30), BookingStatus::Confirmed)];
        let hit = find_conflict(&existing, &Span::new(at(15, 15), at(15, 45)));
        assert_eq!(hit.map(|b| b.id), Some(existing[0].id));
    }

    #[test]
    fn back_to_back_is_not_a_conflict() {
        let existing = vec![booking(at(15, 0), at(15, 30), BookingStatus::Confirmed)];
        assert!(find_conflict(&existing, &Span::new(at(15, 30), at(16, 0))).is_none());
        assert!(find_conflict(&existing, &Span::new(at(14, 30), at(15, 0))).is_none());
    }

    #[test]
    fn cancelled_bookings_are_ignored() {
        let existing = vec![booking(at(15, 0), at(15, 30), BookingStatus::Cancelled)];
        assert!(find_conflict(&existing, &Span::new(at(15, 0), at(15, 30))).is_none());
    }

    #[test]
    fn one_minute_overlap_counts() {
        let existing = vec![booking(at(15, 0), at(15, 31), BookingStatus::Confirmed)];
        assert!(find_conflict(&existing, &Span::new(at(15, 30), at(16, 0))).is_some());
    }

    #[test]
    fn report_carries_booking_and_message() {
        let b = booking(at(15, 0), at(15, 30), BookingStatus::Confirmed);
        let r = report(Some(&b));
        assert!(r.has_conflict);
        assert_eq!(r.conflicting_booking_id, Some(b.id));
        assert!(r.message.contains("3:00 PM"));

        let clear = report(None);
        assert!(!clear.has_conflict);
        assert!(clear.conflicting_booking_id.is_none());
    }

    #[test]
    fn zero_length_and_inverted_candidates_rejected() {
        let zero = Span {
            start: at(15, 0),
            end: at(15, 0),
        };
        let inverted = Span {
            start: at(16, 0),
            end: at(15, 0),
        };
        assert!(matches!(validate_candidate(&zero), Err(ReservationError::Validation(_))));
        assert!(matches!(validate_candidate(&inverted), Err(ReservationError::Validation(_))));
        assert!(validate_candidate(&Span::new(at(15, 0), at(15, 30))).is_ok());
    }

    #[test]
    fn overlong_candidate_rejected() {
        let long = Span::new(at(0, 0), at(23, 0));
        assert!(validate_candidate(&long).is_err());
    }
}
