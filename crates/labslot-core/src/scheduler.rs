//! Reservation creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::conflict::validate_interval;
use crate::error::{ReservationError, Result};
use crate::lifecycle::{AutoStartOutcome, LifecycleCoordinator};
use crate::model::{NewReservation, Reservation, estimate_cost_cents};
use crate::notifications::LifecycleEvent;
use crate::runtime::RuntimeContext;
use crate::storage::ReservationInsert;

/// Caller input for a new reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub user_id: String,
    pub lab_ref: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedReservation {
    pub reservation: Reservation,
    pub auto_start: AutoStartOutcome,
}

/// Validates, books and (for free slots close to their start) auto-starts
/// reservations.
#[derive(Debug, Clone)]
pub struct ReservationScheduler {
    lifecycle: LifecycleCoordinator,
}

impl ReservationScheduler {
    #[must_use]
    pub fn new(lifecycle: LifecycleCoordinator) -> Self {
        Self { lifecycle }
    }

    pub async fn create(
        &self,
        ctx: &RuntimeContext,
        request: &ReservationRequest,
    ) -> Result<CreatedReservation> {
        let now = self.lifecycle.now();
        validate_request(request, now)?;

        let store = self.lifecycle.store();
        let lab = store.get_lab(&request.lab_ref)?.ok_or_else(|| {
            ReservationError::Validation(format!("unknown lab {}", request.lab_ref))
        })?;
        let estimated_cost_cents =
            estimate_cost_cents(lab.hourly_rate_cents, request.start_at, request.end_at);

        let new = NewReservation {
            user_id: request.user_id.clone(),
            lab_ref: request.lab_ref.clone(),
            start_at: request.start_at,
            end_at: request.end_at,
            estimated_cost_cents,
            created_at: now,
        };
        let reservation = match store.insert_reservation_if_free(&new)? {
            ReservationInsert::Inserted(reservation) => reservation,
            ReservationInsert::Conflict { conflicting_id } => {
                info!(
                    lab_ref = %request.lab_ref,
                    user_id = %request.user_id,
                    conflicting_id,
                    "Reservation rejected: slot taken"
                );
                return Err(ReservationError::Conflict {
                    lab_ref: request.lab_ref.clone(),
                    start_at: request.start_at,
                    end_at: request.end_at,
                    conflicting_id,
                }
                .into());
            }
            ReservationInsert::UnknownLab => {
                return Err(ReservationError::Validation(format!(
                    "unknown lab {}",
                    request.lab_ref
                ))
                .into());
            }
        };
        info!(
            reservation_id = reservation.id,
            lab_ref = %reservation.lab_ref,
            user_id = %reservation.user_id,
            estimated_cost_cents,
            "Reservation created"
        );
        self.lifecycle
            .notifier()
            .notify(LifecycleEvent::ReservationCreated {
                reservation_id: reservation.id,
                user_id: reservation.user_id.clone(),
                lab_ref: reservation.lab_ref.clone(),
                start_at: reservation.start_at,
                end_at: reservation.end_at,
            })
            .await;

        let auto_start = self.lifecycle.auto_start(ctx, &reservation).await?;
        if let AutoStartOutcome::Failed { message } = &auto_start {
            warn!(
                reservation_id = reservation.id,
                error = %message,
                "Auto-start failed; a manual start is required"
            );
        }
        let reservation = self.lifecycle.load(reservation.id)?;
        Ok(CreatedReservation {
            reservation,
            auto_start,
        })
    }
}

fn validate_request(request: &ReservationRequest, now: DateTime<Utc>) -> Result<()> {
    if request.user_id.trim().is_empty() {
        return Err(ReservationError::Validation("user_id must not be empty".into()).into());
    }
    if request.lab_ref.trim().is_empty() {
        return Err(ReservationError::Validation("lab_ref must not be empty".into()).into());
    }
    validate_interval(request.start_at, request.end_at)?;
    if request.start_at <= now {
        return Err(ReservationError::Validation(format!(
            "start_at ({}) must be in the future",
            request.start_at
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;

    use crate::Error;
    use crate::clock::ManualClock;
    use crate::model::{Lab, ReservationStatus};
    use crate::notifications::Notifier;
    use crate::runtime::{RuntimeCredentials, RuntimeGateway, SimulatedLabRuntime};
    use crate::storage::Store;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn scheduler(rate: i64) -> ReservationScheduler {
        let store = Store::open_in_memory().unwrap();
        store.upsert_lab(&Lab::new("L1", "Lab", rate)).unwrap();
        let runtime = RuntimeGateway::new(
            Arc::new(SimulatedLabRuntime::new()),
            RuntimeCredentials::default(),
            std::time::Duration::from_secs(5),
        );
        ReservationScheduler::new(LifecycleCoordinator::new(
            store,
            Arc::new(ManualClock::new(t0())),
            runtime,
            Notifier::default(),
            Duration::minutes(15),
        ))
    }

    fn request(start_min: i64, end_min: i64) -> ReservationRequest {
        ReservationRequest {
            user_id: "alice".into(),
            lab_ref: "L1".into(),
            start_at: t0() + Duration::minutes(start_min),
            end_at: t0() + Duration::minutes(end_min),
        }
    }

    fn is_validation(err: &Error) -> bool {
        matches!(err, Error::Reservation(ReservationError::Validation(_)))
    }

    #[tokio::test]
    async fn validation_happens_before_side_effects() {
        let s = scheduler(0);
        let ctx = s.lifecycle.runtime().context();
        assert!(is_validation(&s.create(&ctx, &request(0, 10)).await.unwrap_err()));
        assert!(is_validation(&s.create(&ctx, &request(-5, 10)).await.unwrap_err()));
        assert!(is_validation(&s.create(&ctx, &request(20, 10)).await.unwrap_err()));
        let mut unknown = request(5, 10);
        unknown.lab_ref = "nope".into();
        assert!(is_validation(&s.create(&ctx, &unknown).await.unwrap_err()));
        let mut anonymous = request(5, 10);
        anonymous.user_id = " ".into();
        assert!(is_validation(&s.create(&ctx, &anonymous).await.unwrap_err()));
        assert!(
            s.lifecycle
                .store()
                .list_reservations(&Default::default())
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn cost_is_estimated_from_the_lab_rate() {
        let s = scheduler(600);
        let ctx = s.lifecycle.runtime().context();
        let created = s.create(&ctx, &request(60, 90)).await.unwrap();
        assert_eq!(created.reservation.estimated_cost_cents, 300);
        assert_eq!(created.auto_start, AutoStartOutcome::NotEligible);
        assert_eq!(created.reservation.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn paid_reservation_in_window_is_deferred() {
        let s = scheduler(600);
        let ctx = s.lifecycle.runtime().context();
        let created = s.create(&ctx, &request(5, 65)).await.unwrap();
        assert_eq!(created.auto_start, AutoStartOutcome::Deferred);
        assert_eq!(created.reservation.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn overlapping_request_conflicts() {
        let s = scheduler(0);
        let ctx = s.lifecycle.runtime().context();
        let first = s.create(&ctx, &request(60, 120)).await.unwrap();
        let err = s.create(&ctx, &request(90, 100)).await.unwrap_err();
        match err {
            Error::Reservation(ReservationError::Conflict { conflicting_id, .. }) => {
                assert_eq!(conflicting_id, first.reservation.id);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(err_status(&s, &ctx).await, 422);
    }

    async fn err_status(s: &ReservationScheduler, ctx: &RuntimeContext) -> u16 {
        s.create(ctx, &request(61, 62)).await.unwrap_err().http_status()
    }
}
