use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate};

use crate::limits::MAX_RANGE_DAYS;
use crate::model::*;

use super::catalog::SlotCatalog;
use super::{Engine, ReservationError};

fn validate_pattern(pattern: &RecurringPattern) -> Result<(), ReservationError> {
    if pattern.range_start > pattern.range_end {
        return Err(ReservationError::invalid("range start is after range end"));
    }
    if (pattern.range_end - pattern.range_start).num_days() > MAX_RANGE_DAYS {
        return Err(ReservationError::invalid("recurring range too long"));
    }
    Ok(())
}

/// Every date in `[range_start, range_end]` falling on the pattern's weekday.
pub fn expected_dates(pattern: &RecurringPattern) -> Vec<NaiveDate> {
    let offset = (7 + pattern.day_of_week.num_days_from_monday()
        - pattern.range_start.weekday().num_days_from_monday())
        % 7;
    let mut dates = Vec::new();
    let mut cur = pattern.range_start.checked_add_days(Days::new(offset as u64));
    while let Some(date) = cur
        && date <= pattern.range_end
    {
        dates.push(date);
        cur = date.checked_add_days(Days::new(7));
    }
    dates
}

/// Match a pattern against catalog instances. Exact weekday + time-of-day (and
/// instructor, when the pattern names one); weekly slots only. Expected dates
/// with no match are reported as gaps, not errors.
pub fn resolve(pattern: &RecurringPattern, instances: &[SessionInstance]) -> ResolvedSeries {
    let expected = expected_dates(pattern);
    let wanted: BTreeSet<NaiveDate> = expected.iter().copied().collect();

    let mut matched: Vec<SessionInstance> = instances
        .iter()
        .filter(|i| i.kind == SessionKind::Recurring)
        .filter(|i| wanted.contains(&i.span.date()))
        .filter(|i| pattern.matches_slot(&i.span.start))
        .filter(|i| pattern.instructor_id.is_none_or(|id| id == i.instructor_id))
        .cloned()
        .collect();
    matched.sort_by_key(|i| (i.span.start, i.id));

    let covered: BTreeSet<NaiveDate> = matched.iter().map(|i| i.span.date()).collect();
    let gaps = expected
        .iter()
        .copied()
        .filter(|d| !covered.contains(d))
        .collect();
    let full = matched.iter().filter(|i| i.is_full()).map(|i| i.id).collect();

    ResolvedSeries {
        matched,
        expected_count: expected.len(),
        gaps,
        full,
    }
}

/// Expand `pattern` against any catalog.
pub async fn resolve_recurring<C: SlotCatalog + ?Sized>(
    catalog: &C,
    pattern: &RecurringPattern,
) -> Result<ResolvedSeries, ReservationError> {
    validate_pattern(pattern)?;
    let filter = InstanceFilter {
        range_start: pattern.range_start,
        range_end: pattern.range_end,
        instructor_id: pattern.instructor_id,
        location: None,
    };
    let instances = catalog.list_instances(&filter).await;
    Ok(resolve(pattern, &instances))
}

impl Engine {
    pub async fn resolve_recurring(
        &self,
        pattern: &RecurringPattern,
    ) -> Result<ResolvedSeries, ReservationError> {
        let series = resolve_recurring(self, pattern).await?;
        tracing::debug!(
            "resolved {:?} {} over {}..={}: {} matched, {} gaps",
            pattern.day_of_week,
            pattern.time_of_day,
            pattern.range_start,
            pattern.range_end,
            series.matched.len(),
            series.gaps.len()
        );
        Ok(series)
    }
}
