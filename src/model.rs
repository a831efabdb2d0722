use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Ms;

pub type InstanceId = Ulid;
pub type BookingId = Ulid;
pub type SwimmerId = Ulid;
pub type InstructorId = Ulid;
pub type SeriesId = Ulid;

/// Opaque holder identity: a swimmer id or a checkout session token.
pub type HolderId = String;

/// Half-open wall-clock interval `[start, end)` in facility-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Part of a weekly series; booked through recurring patterns.
    Recurring,
    /// One-off slot (often a cancelled weekly slot reopened for single booking).
    Floating,
}

/// One concrete bookable slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInstance {
    pub id: InstanceId,
    pub span: Span,
    pub instructor_id: InstructorId,
    pub location: String,
    pub capacity: u32,
    pub booked_count: u32,
    pub kind: SessionKind,
}

impl SessionInstance {
    pub fn is_full(&self) -> bool {
        self.booked_count >= self.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }
}

/// Time-boxed exclusive claim on a session instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub session_instance_id: InstanceId,
    pub holder_id: HolderId,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_active(&self, now: Ms) -> bool {
        now < self.expires_at
    }
}

/// Mutable per-instance state guarded by one lock: the catalog row plus its hold slot.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub instance: SessionInstance,
    /// Last written hold. May be stale; read it through `active_hold`.
    pub hold: Option<Hold>,
}

impl SlotState {
    pub fn new(instance: SessionInstance) -> Self {
        Self {
            instance,
            hold: None,
        }
    }

    pub fn active_hold(&self, now: Ms) -> Option<&Hold> {
        self.hold.as_ref().filter(|h| h.is_active(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    /// Shared by every booking confirmed in the same attempt.
    pub series_id: SeriesId,
    pub swimmer_id: SwimmerId,
    pub session_instance_id: InstanceId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Weekly day + time selection over an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub day_of_week: Weekday,
    pub time_of_day: NaiveTime,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub instructor_id: Option<InstructorId>,
}

impl RecurringPattern {
    /// Map a 0–6 day index (0 = Sunday) to a weekday.
    pub fn weekday_from_index(day: u8) -> Option<Weekday> {
        const DAYS: [Weekday; 7] = [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ];
        DAYS.get(day as usize).copied()
    }

    pub fn matches_slot(&self, start: &NaiveDateTime) -> bool {
        start.weekday() == self.day_of_week && start.time() == self.time_of_day
    }
}

/// Catalog listing filter. Dates are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub instructor_id: Option<InstructorId>,
    pub location: Option<String>,
}

impl InstanceFilter {
    pub fn dates(range_start: NaiveDate, range_end: NaiveDate) -> Self {
        Self {
            range_start,
            range_end,
            instructor_id: None,
            location: None,
        }
    }

    pub fn accepts(&self, instance: &SessionInstance) -> bool {
        let date = instance.span.date();
        date >= self.range_start
            && date <= self.range_end
            && self.instructor_id.is_none_or(|i| i == instance.instructor_id)
            && self.location.as_ref().is_none_or(|l| *l == instance.location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub conflicting_booking_id: Option<BookingId>,
    pub message: String,
}

/// Outcome of expanding a recurring pattern against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSeries {
    /// Matching instances, ascending by start.
    pub matched: Vec<SessionInstance>,
    pub expected_count: usize,
    /// Expected dates with no matching instance.
    pub gaps: Vec<NaiveDate>,
    /// Matched instances already at capacity.
    pub full: Vec<InstanceId>,
}

/// Outcome of cancelling the rest of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCancellation {
    pub series_id: SeriesId,
    pub cancelled: Vec<Booking>,
    /// Sessions that have already started.
    pub skipped_past: Vec<BookingId>,
    /// Sessions inside the cancellation notice window.
    pub skipped_late: Vec<BookingId>,
}

/// Journal record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    InstanceCreated {
        instance: SessionInstance,
    },
    HoldAcquired {
        session_instance_id: InstanceId,
        holder_id: HolderId,
        acquired_at: Ms,
        expires_at: Ms,
    },
    HoldReleased {
        session_instance_id: InstanceId,
        holder_id: HolderId,
        expired: bool,
    },
    BookingConfirmed {
        id: BookingId,
        series_id: SeriesId,
        swimmer_id: SwimmerId,
        session_instance_id: InstanceId,
        span: Span,
        created_at: Ms,
    },
    BookingCancelled {
        id: BookingId,
        session_instance_id: InstanceId,
        cancelled_at: Ms,
    },
}

impl Event {
    pub fn session_instance_id(&self) -> InstanceId {
        match self {
            Event::InstanceCreated { instance } => instance.id,
            Event::HoldAcquired { session_instance_id, .. }
            | Event::HoldReleased { session_instance_id, .. }
            | Event::BookingConfirmed { session_instance_id, .. }
            | Event::BookingCancelled { session_instance_id, .. } => *session_instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(at(1, 15, 0), at(1, 15, 30));
        let b = Span::new(at(1, 15, 15), at(1, 15, 45));
        let c = Span::new(at(1, 15, 30), at(1, 16, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back, not overlapping
        assert_eq!(a.duration(), TimeDelta::minutes(30));
    }

    #[test]
    fn span_containing_other_overlaps() {
        let outer = Span::new(at(1, 9, 0), at(1, 17, 0));
        let inner = Span::new(at(1, 12, 0), at(1, 12, 30));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn weekday_index_is_sunday_based() {
        assert_eq!(RecurringPattern::weekday_from_index(0), Some(Weekday::Sun));
        assert_eq!(RecurringPattern::weekday_from_index(1), Some(Weekday::Mon));
        assert_eq!(RecurringPattern::weekday_from_index(6), Some(Weekday::Sat));
        assert_eq!(RecurringPattern::weekday_from_index(7), None);
    }

    #[test]
    fn hold_expiry_is_exclusive_of_deadline() {
        let hold = Hold {
            session_instance_id: Ulid::new(),
            holder_id: "h".into(),
            acquired_at: 0,
            expires_at: 100,
        };
        assert!(hold.is_active(99));
        assert!(!hold.is_active(100));
    }

    #[test]
    fn stale_hold_is_not_active() {
        let instance = SessionInstance {
            id: Ulid::new(),
            span: Span::new(at(1, 15, 0), at(1, 15, 30)),
            instructor_id: Ulid::new(),
            location: String::new(),
            capacity: 1,
            booked_count: 0,
            kind: SessionKind::Recurring,
        };
        let mut slot = SlotState::new(instance.clone());
        assert!(slot.active_hold(0).is_none());
        slot.hold = Some(Hold {
            session_instance_id: instance.id,
            holder_id: "a".into(),
            acquired_at: 0,
            expires_at: 50,
        });
        assert!(slot.active_hold(49).is_some());
        assert!(slot.active_hold(50).is_none());
        assert!(slot.hold.is_some()); // record lingers until purged
    }

    #[test]
    fn filter_matches_inclusive_dates_and_optional_fields() {
        let instructor = Ulid::new();
        let instance = SessionInstance {
            id: Ulid::new(),
            span: Span::new(at(31, 15, 0), at(31, 15, 30)),
            instructor_id: instructor,
            location: "Turlock".into(),
            capacity: 1,
            booked_count: 0,
            kind: SessionKind::Recurring,
        };
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();

        assert!(InstanceFilter::dates(d(1), d(31)).accepts(&instance));
        assert!(!InstanceFilter::dates(d(1), d(30)).accepts(&instance));

        let mut f = InstanceFilter::dates(d(1), d(31));
        f.instructor_id = Some(Ulid::new());
        assert!(!f.accepts(&instance));
        f.instructor_id = Some(instructor);
        f.location = Some("Modesto".into());
        assert!(!f.accepts(&instance));
        f.location = Some("Turlock".into());
        assert!(f.accepts(&instance));
    }

    #[test]
    fn capacity_helpers() {
        let mut instance = SessionInstance {
            id: Ulid::new(),
            span: Span::new(at(1, 15, 0), at(1, 15, 30)),
            instructor_id: Ulid::new(),
            location: String::new(),
            capacity: 2,
            booked_count: 1,
            kind: SessionKind::Floating,
        };
        assert!(!instance.is_full());
        assert_eq!(instance.remaining(), 1);
        instance.booked_count = 2;
        assert!(instance.is_full());
        assert_eq!(instance.remaining(), 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldAcquired {
            session_instance_id: Ulid::new(),
            holder_id: "swimmer-1".into(),
            acquired_at: 1_000,
            expires_at: 301_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
