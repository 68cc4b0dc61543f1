//! Interval overlap rules for lab bookings.
//!
//! Intervals are half-open `[start, end)`: two bookings that only share an
//! endpoint do not conflict. Cancelled reservations never block a slot.

use chrono::{DateTime, Utc};

use crate::error::{ReservationError, Result};
use crate::model::ReservationId;
use crate::storage::Store;

/// True iff `[s1, e1)` and `[s2, e2)` share at least one instant.
#[must_use]
pub fn intervals_overlap(
    s1: DateTime<Utc>,
    e1: DateTime<Utc>,
    s2: DateTime<Utc>,
    e2: DateTime<Utc>,
) -> bool {
    s1 < e2 && s2 < e1
}

/// Reject empty or inverted intervals.
pub fn validate_interval(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Result<()> {
    if end_at <= start_at {
        return Err(ReservationError::Validation(format!(
            "end_at ({end_at}) must be after start_at ({start_at})"
        ))
        .into());
    }
    Ok(())
}

/// Read-only conflict lookups against the store.
///
/// Used for previews; the authoritative check is repeated inside the insert
/// transaction by [`Store::insert_reservation_if_free`].
#[derive(Debug, Clone)]
pub struct ConflictChecker {
    store: Store,
}

impl ConflictChecker {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn has_conflict(
        &self,
        lab_ref: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        exclude: Option<ReservationId>,
    ) -> Result<bool> {
        validate_interval(start_at, end_at)?;
        self.store.has_conflict(lab_ref, start_at, end_at, exclude)
    }
}
