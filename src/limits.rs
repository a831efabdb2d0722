//! Hard safety limits. Anything beyond these is rejected as a validation error.

use crate::clock::Ms;

/// Max session instances held by one engine.
pub const MAX_INSTANCES: usize = 100_000;

/// Max instances confirmed in one booking attempt (a season of weekly lessons).
pub const MAX_BATCH_SIZE: usize = 60;

/// Max days a recurring pattern may span.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Max days a catalog listing may span.
pub const MAX_QUERY_DAYS: i64 = 400;

/// Max length of a single session.
pub const MAX_SESSION_DURATION_MS: Ms = 8 * 3_600_000;

pub const MAX_HOLDER_LEN: usize = 128;
pub const MAX_LOCATION_LEN: usize = 256;

/// Days either side of a full slot searched for alternatives.
pub const ALTERNATIVE_WINDOW_DAYS: u64 = 14;

/// Max suggestions returned for a full slot.
pub const MAX_ALTERNATIVES: usize = 20;

/// Max bytes in one wire request line.
pub const MAX_LINE_LEN: usize = 64 * 1024;
