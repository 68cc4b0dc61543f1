//! Expiry reaper for unpaid reservations.
//!
//! A paid reservation that stays `pending` past the grace window holds a slot
//! nobody is paying for. The reaper cancels it. Each cancellation is a single
//! conditional UPDATE that re-checks every selection predicate, so a payment
//! that completes between selection and update always wins.
//!
//! Only reservations with `estimated_cost_cents > 0` are candidates. A free
//! reservation never waits on a payment, so it is never reaped even while it
//! sits `pending` ahead of its start window.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::ReservationId;
use crate::notifications::{LifecycleEvent, Notifier};
use crate::storage::Store;

/// Reaper tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    /// How long a pending reservation may wait for payment.
    pub grace: Duration,
    /// Default cap on cancellations per sweep (`None` = unbounded).
    pub batch_limit: Option<usize>,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            grace: Duration::minutes(15),
            batch_limit: None,
        }
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Reservations cancelled (or, in dry-run, that would be).
    pub count: usize,
    pub ids: Vec<ReservationId>,
    /// Candidates that no longer matched at update time.
    pub skipped: Vec<ReservationId>,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct ExpiryReaper {
    store: Store,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    settings: ReaperSettings,
}

impl std::fmt::Debug for ExpiryReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryReaper")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ExpiryReaper {
    #[must_use]
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> ReaperSettings {
        self.settings
    }

    /// Cancel unpaid pending reservations older than the grace window.
    /// With `dry_run` the candidates are returned and nothing changes.
    pub async fn sweep(&self, dry_run: bool, limit: Option<usize>) -> Result<SweepReport> {
        let now = self.clock.now();
        let cutoff = now - self.settings.grace;
        let limit = limit.or(self.settings.batch_limit);
        let candidates = self.store.expired_pending_reservations(cutoff, limit)?;

        let mut report = SweepReport {
            dry_run,
            ..SweepReport::default()
        };
        if dry_run {
            report.ids = candidates.iter().map(|r| r.id).collect();
            report.count = report.ids.len();
            debug!(count = report.count, cutoff = %cutoff, "Reaper dry run");
            return Ok(report);
        }

        let note = format!(
            "reaped at {}: unpaid after {} minutes",
            now.to_rfc3339(),
            self.settings.grace.num_minutes()
        );
        for reservation in candidates {
            if self
                .store
                .cancel_unpaid_reservation(reservation.id, cutoff, now, &note)?
            {
                info!(
                    reservation_id = reservation.id,
                    lab_ref = %reservation.lab_ref,
                    user_id = %reservation.user_id,
                    "Reservation reaped"
                );
                self.notifier
                    .notify(LifecycleEvent::ReservationExpired {
                        reservation_id: reservation.id,
                        user_id: reservation.user_id.clone(),
                    })
                    .await;
                report.ids.push(reservation.id);
            } else {
                debug!(
                    reservation_id = reservation.id,
                    "Reaper candidate changed before update; skipped"
                );
                report.skipped.push(reservation.id);
            }
        }
        report.count = report.ids.len();
        if report.count > 0 {
            warn!(
                count = report.count,
                ids = ?report.ids,
                "Reaper cancelled unpaid reservations"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::clock::ManualClock;
    use crate::model::{Lab, NewReservation, ReservationStatus};
    use crate::storage::ReservationInsert;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn setup() -> (Store, Arc<ManualClock>, ExpiryReaper) {
        let store = Store::open_in_memory().unwrap();
        store.upsert_lab(&Lab::new("L1", "Lab", 600)).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let reaper = ExpiryReaper::new(
            store.clone(),
            clock.clone(),
            Notifier::default(),
            ReaperSettings::default(),
        );
        (store, clock, reaper)
    }

    fn reserve(store: &Store, start_hours: i64, cost: i64) -> ReservationId {
        match store
            .insert_reservation_if_free(&NewReservation {
                user_id: "alice".into(),
                lab_ref: "L1".into(),
                start_at: t0() + Duration::hours(start_hours),
                end_at: t0() + Duration::hours(start_hours + 1),
                estimated_cost_cents: cost,
                created_at: t0(),
            })
            .unwrap()
        {
            ReservationInsert::Inserted(r) => r.id,
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn grace_window_is_respected() {
        let (store, clock, reaper) = setup();
        let id = reserve(&store, 2, 600);
        clock.advance(Duration::minutes(14));
        assert_eq!(reaper.sweep(false, None).await.unwrap().count, 0);
        clock.advance(Duration::minutes(2));
        let report = reaper.sweep(false, None).await.unwrap();
        assert_eq!(report.ids, vec![id]);
        let r = store.get_reservation(id).unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert!(r.notes[0].starts_with("reaped at "));
        assert!(r.notes[0].ends_with("unpaid after 15 minutes"));
    }

    #[tokio::test]
    async fn dry_run_does_not_mutate() {
        let (store, clock, reaper) = setup();
        let id = reserve(&store, 2, 600);
        clock.advance(Duration::minutes(20));
        let report = reaper.sweep(true, None).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.ids, vec![id]);
        assert_eq!(
            store.get_reservation(id).unwrap().unwrap().status,
            ReservationStatus::Pending
        );
    }

    #[tokio::test]
    async fn repeated_sweeps_are_idempotent_and_limited() {
        let (store, clock, reaper) = setup();
        reserve(&store, 2, 600);
        reserve(&store, 4, 600);
        reserve(&store, 6, 600);
        clock.advance(Duration::minutes(30));
        assert_eq!(reaper.sweep(false, Some(2)).await.unwrap().count, 2);
        assert_eq!(reaper.sweep(false, None).await.unwrap().count, 1);
        assert_eq!(reaper.sweep(false, None).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn free_reservations_are_never_reaped() {
        let (store, clock, reaper) = setup();
        let id = reserve(&store, 2, 0);
        clock.advance(Duration::hours(1));
        assert_eq!(reaper.sweep(false, None).await.unwrap().count, 0);
        assert_eq!(
            store.get_reservation(id).unwrap().unwrap().status,
            ReservationStatus::Pending
        );
    }
}
