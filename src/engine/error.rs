use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Ms;
use crate::model::{BookingId, InstanceId};

/// Machine-readable failure category carried on every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SlotUnavailable,
    SlotHeldByOther,
    NotHolder,
    ConflictDetected,
    ExpiredHold,
    ValidationError,
    NotFound,
    LateCancellation,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SlotUnavailable => "SlotUnavailable",
            ErrorKind::SlotHeldByOther => "SlotHeldByOther",
            ErrorKind::NotHolder => "NotHolder",
            ErrorKind::ConflictDetected => "ConflictDetected",
            ErrorKind::ExpiredHold => "ExpiredHold",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::LateCancellation => "LateCancellation",
            ErrorKind::Storage => "Storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("session {0} is full; please choose another time")]
    SlotUnavailable(InstanceId),

    #[error("session {instance_id} is being held by another family until {expires_at}; refresh and try again")]
    SlotHeldByOther { instance_id: InstanceId, expires_at: Ms },

    #[error("you do not hold session {0}")]
    NotHolder(InstanceId),

    /// `conflicting_with` is an existing booking, or another session in the same batch.
    #[error("session {instance_id} overlaps {conflicting_with}; please change your selection")]
    ConflictDetected {
        instance_id: InstanceId,
        conflicting_with: Ulid,
    },

    #[error("your hold on session {0} has expired; please select the session again")]
    ExpiredHold(InstanceId),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("booking {booking_id} starts in {hours_before}h; cancellations need {notice_hours}h notice")]
    LateCancellation {
        booking_id: BookingId,
        hours_before: i64,
        notice_hours: i64,
    },

    #[error("journal error: {0}")]
    Storage(String),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::SlotUnavailable(_) => ErrorKind::SlotUnavailable,
            ReservationError::SlotHeldByOther { .. } => ErrorKind::SlotHeldByOther,
            ReservationError::NotHolder(_) => ErrorKind::NotHolder,
            ReservationError::ConflictDetected { .. } => ErrorKind::ConflictDetected,
            ReservationError::ExpiredHold(_) => ErrorKind::ExpiredHold,
            ReservationError::Validation(_) => ErrorKind::ValidationError,
            ReservationError::NotFound(_) => ErrorKind::NotFound,
            ReservationError::LateCancellation { .. } => ErrorKind::LateCancellation,
            ReservationError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Malformed input or a broken journal, as opposed to an expected business outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReservationError::Validation(_) | ReservationError::Storage(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ReservationError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_by_name() {
        let json = serde_json::to_string(&ErrorKind::SlotHeldByOther).unwrap();
        assert_eq!(json, "\"SlotHeldByOther\"");
        assert_eq!(ErrorKind::ConflictDetected.as_str(), "ConflictDetected");
    }

    #[test]
    fn only_malformed_input_is_fatal() {
        let id = Ulid::new();
        assert!(ReservationError::invalid("bad").is_fatal());
        assert!(ReservationError::Storage("disk".into()).is_fatal());
        assert!(!ReservationError::SlotUnavailable(id).is_fatal());
        assert!(!ReservationError::NotHolder(id).is_fatal());
        assert!(
            !ReservationError::ConflictDetected {
                instance_id: id,
                conflicting_with: id
            }
            .is_fatal()
        );
    }

    #[test]
    fn messages_are_display_ready() {
        let id = Ulid::new();
        let msg = ReservationError::SlotUnavailable(id).to_string();
        assert!(msg.contains("full"));
        assert!(msg.contains(&id.to_string()));
    }
}
