//! Reservation state machine and runtime session control.
//!
//! ```text
//! pending --(payment completed | free and in window)--> active
//! pending --(expiry reaper)--> cancelled
//! active  --(end reached | explicit stop)--> completed
//! active|pending --(user cancel)--> cancelled
//! ```
//!
//! Every status write is a conditional update on the expected current status.
//! Remote runtime calls happen only after the local transition committed, and
//! a failed remote call never rolls a transition back: it is counted on the
//! reservation and surfaced to the caller.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, ReservationError, Result};
use crate::model::{Reservation, ReservationId, ReservationStatus, RuntimeState, UsageRecord};
use crate::notifications::{LifecycleEvent, Notifier};
use crate::runtime::{RuntimeContext, RuntimeGateway};
use crate::storage::{Store, UsageOpen};

/// Result of an automatic start attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoStartOutcome {
    /// Outside the lookahead window, already ended, or no longer startable.
    NotEligible,
    /// Paid reservation still waiting for its payment.
    Deferred,
    /// The lab is not stopped (cached or authoritative state).
    RuntimeBusy { state: RuntimeState },
    Started { usage: UsageRecord },
    /// Remote call failed; recorded on the reservation, not retried.
    Failed { message: String },
}

impl AutoStartOutcome {
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Result of stopping a lab session.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    /// The usage record closed by this stop, if one was open.
    pub usage: Option<UsageRecord>,
    /// Non-fatal remote stop failure.
    pub remote_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub reservation: Reservation,
    pub stop: StopOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub reservation: Reservation,
    /// Present when an open session of this reservation was stopped.
    pub stop: Option<StopOutcome>,
}

/// What a `start_due` pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartDueReport {
    pub started: Vec<ReservationId>,
    pub failed: Vec<ReservationId>,
    pub busy: Vec<ReservationId>,
}

/// What a `finish_due` pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FinishDueReport {
    pub completed: Vec<ReservationId>,
    pub stop_failures: Vec<ReservationId>,
}

/// Drives reservations through their lifecycle and owns usage accounting.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    store: Store,
    clock: Arc<dyn Clock>,
    runtime: RuntimeGateway,
    notifier: Notifier,
    lookahead: Duration,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("runtime", &self.runtime)
            .field("notifier", &self.notifier)
            .field("lookahead", &self.lookahead)
            .finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    #[must_use]
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        runtime: RuntimeGateway,
        notifier: Notifier,
        lookahead: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            runtime,
            notifier,
            lookahead,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeGateway {
        &self.runtime
    }

    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn lookahead(&self) -> Duration {
        self.lookahead
    }

    pub fn load(&self, id: ReservationId) -> Result<Reservation> {
        self.store
            .get_reservation(id)?
            .ok_or_else(|| ReservationError::NotFound(id).into())
    }

    /// Move `id` to `to` if the state machine allows it from its current
    /// status. Fails with `InvalidTransition` otherwise, including when a
    /// concurrent writer changed the status first.
    pub fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        note: Option<&str>,
    ) -> Result<Reservation> {
        let current = self.load(id)?;
        if !current.status.can_transition_to(to) {
            return Err(ReservationError::InvalidTransition {
                id,
                from: current.status,
                to,
            }
            .into());
        }
        let moved = self
            .store
            .transition_reservation(id, &[current.status], to, self.now(), note)?;
        let after = self.load(id)?;
        if !moved {
            return Err(ReservationError::InvalidTransition {
                id,
                from: after.status,
                to,
            }
            .into());
        }
        debug!(reservation_id = id, from = %current.status, to = %to, "Reservation transitioned");
        Ok(after)
    }

    /// Start the runtime for an active reservation and open its usage record.
    pub async fn start_session(
        &self,
        ctx: &RuntimeContext,
        reservation: &Reservation,
    ) -> Result<UsageRecord> {
        let reservation = self.load(reservation.id)?;
        if reservation.status != ReservationStatus::Active {
            return Err(ReservationError::InvalidTransition {
                id: reservation.id,
                from: reservation.status,
                to: ReservationStatus::Active,
            }
            .into());
        }
        if let Some(open) = self.store.open_usage_for_lab(&reservation.lab_ref)? {
            if open.reservation_id == Some(reservation.id) {
                return Ok(open);
            }
            return Err(ReservationError::SessionAlreadyOpen {
                lab_ref: reservation.lab_ref.clone(),
            }
            .into());
        }

        if let Err(err) = self.runtime.start(ctx, &reservation.lab_ref).await {
            self.record_runtime_failure(Some(reservation.id), &reservation.lab_ref, "start", &err)
                .await?;
            return Err(err);
        }

        let now = self.now();
        self.store
            .update_lab_state(&reservation.lab_ref, RuntimeState::Running, now)?;
        match self.store.open_usage(
            Some(reservation.id),
            &reservation.user_id,
            &reservation.lab_ref,
            now,
        )? {
            UsageOpen::Opened(usage) => {
                info!(
                    reservation_id = reservation.id,
                    lab_ref = %reservation.lab_ref,
                    usage_id = usage.id,
                    "Session started"
                );
                self.notifier
                    .notify(LifecycleEvent::SessionStarted {
                        usage: usage.clone(),
                    })
                    .await;
                Ok(usage)
            }
            UsageOpen::AlreadyOpen(existing) if existing.reservation_id == Some(reservation.id) => {
                Ok(existing)
            }
            UsageOpen::AlreadyOpen(existing) => {
                warn!(
                    reservation_id = reservation.id,
                    lab_ref = %reservation.lab_ref,
                    open_usage_id = existing.id,
                    "Runtime started but another session record is open"
                );
                Err(ReservationError::SessionAlreadyOpen {
                    lab_ref: reservation.lab_ref,
                }
                .into())
            }
        }
    }

    /// Start a lab outside of any reservation.
    pub async fn start_manual_session(
        &self,
        ctx: &RuntimeContext,
        user_id: &str,
        lab_ref: &str,
    ) -> Result<UsageRecord> {
        if user_id.trim().is_empty() {
            return Err(ReservationError::Validation("user_id must not be empty".into()).into());
        }
        if self.store.get_lab(lab_ref)?.is_none() {
            return Err(ReservationError::Validation(format!("unknown lab {lab_ref}")).into());
        }
        if self.store.open_usage_for_lab(lab_ref)?.is_some() {
            return Err(ReservationError::SessionAlreadyOpen {
                lab_ref: lab_ref.to_string(),
            }
            .into());
        }

        if let Err(err) = self.runtime.start(ctx, lab_ref).await {
            self.record_runtime_failure(None, lab_ref, "start", &err).await?;
            return Err(err);
        }
        let now = self.now();
        self.store
            .update_lab_state(lab_ref, RuntimeState::Running, now)?;
        match self.store.open_usage(None, user_id, lab_ref, now)? {
            UsageOpen::Opened(usage) => {
                info!(lab_ref, user_id, usage_id = usage.id, "Manual session started");
                self.notifier
                    .notify(LifecycleEvent::SessionStarted {
                        usage: usage.clone(),
                    })
                    .await;
                Ok(usage)
            }
            UsageOpen::AlreadyOpen(_) => Err(ReservationError::SessionAlreadyOpen {
                lab_ref: lab_ref.to_string(),
            }
            .into()),
        }
    }

    /// Stop the runtime for a reservation's lab and close the open usage
    /// record. A remote failure is logged and reported, never fatal.
    ///
    /// A session owned by another reservation, or a manual one, is left
    /// running and untouched.
    pub async fn stop_session(
        &self,
        ctx: &RuntimeContext,
        reservation: &Reservation,
    ) -> Result<StopOutcome> {
        if let Some(open) = self.store.open_usage_for_lab(&reservation.lab_ref)? {
            if open.reservation_id != Some(reservation.id) {
                debug!(
                    reservation_id = reservation.id,
                    lab_ref = %reservation.lab_ref,
                    usage_id = open.id,
                    "Open session belongs to someone else; not stopping"
                );
                return Ok(StopOutcome {
                    usage: None,
                    remote_error: None,
                });
            }
        }
        self.stop_and_close(ctx, &reservation.lab_ref, Some(reservation.id))
            .await
    }

    /// Stop whatever session is open on `lab_ref`.
    pub async fn stop_lab(&self, ctx: &RuntimeContext, lab_ref: &str) -> Result<StopOutcome> {
        let Some(open) = self.store.open_usage_for_lab(lab_ref)? else {
            return Err(ReservationError::NoOpenSession {
                lab_ref: lab_ref.to_string(),
            }
            .into());
        };
        self.stop_and_close(ctx, lab_ref, open.reservation_id).await
    }

    async fn stop_and_close(
        &self,
        ctx: &RuntimeContext,
        lab_ref: &str,
        reservation_id: Option<ReservationId>,
    ) -> Result<StopOutcome> {
        let remote_error = match self.runtime.stop(ctx, lab_ref).await {
            Ok(()) => {
                self.store
                    .update_lab_state(lab_ref, RuntimeState::Stopped, self.now())?;
                None
            }
            Err(err) => {
                warn!(
                    lab_ref,
                    reservation_id = ?reservation_id,
                    error = %err,
                    "Runtime stop failed; closing usage record anyway"
                );
                self.record_runtime_failure(reservation_id, lab_ref, "stop", &err)
                    .await?;
                Some(err.to_string())
            }
        };

        let usage = self.store.close_open_usage(lab_ref, self.now())?;
        if let Some(usage) = &usage {
            info!(
                lab_ref,
                usage_id = usage.id,
                duration_seconds = usage.duration_seconds,
                "Session stopped"
            );
            self.notifier
                .notify(LifecycleEvent::SessionStopped {
                    usage: usage.clone(),
                })
                .await;
        }
        Ok(StopOutcome {
            usage,
            remote_error,
        })
    }

    /// Automatic start used by creation, payment activation and the due-start
    /// pass. Promotes a free pending reservation to `active` first.
    pub async fn auto_start(
        &self,
        ctx: &RuntimeContext,
        reservation: &Reservation,
    ) -> Result<AutoStartOutcome> {
        let now = self.now();
        if reservation.status.is_terminal()
            || reservation.end_at <= now
            || reservation.start_at - now > self.lookahead
        {
            return Ok(AutoStartOutcome::NotEligible);
        }
        if reservation.status == ReservationStatus::Pending && !reservation.is_free() {
            return Ok(AutoStartOutcome::Deferred);
        }

        let cached = self
            .store
            .get_lab(&reservation.lab_ref)?
            .map_or(RuntimeState::Unknown, |lab| lab.runtime_state);
        if !cached.is_stopped() {
            debug!(
                reservation_id = reservation.id,
                lab_ref = %reservation.lab_ref,
                state = %cached,
                "Auto-start skipped: cached lab state is not stopped"
            );
            return Ok(AutoStartOutcome::RuntimeBusy { state: cached });
        }

        let authoritative = match self.runtime.get_state(ctx, &reservation.lab_ref).await {
            Ok(state) => state,
            Err(err) => {
                self.record_runtime_failure(
                    Some(reservation.id),
                    &reservation.lab_ref,
                    "get_state",
                    &err,
                )
                .await?;
                return Ok(AutoStartOutcome::Failed {
                    message: err.to_string(),
                });
            }
        };
        self.store
            .update_lab_state(&reservation.lab_ref, authoritative, self.now())?;
        if !authoritative.is_stopped() {
            return Ok(AutoStartOutcome::RuntimeBusy {
                state: authoritative,
            });
        }

        let reservation = if reservation.status == ReservationStatus::Pending {
            match self.transition(
                reservation.id,
                ReservationStatus::Active,
                Some("activated: free reservation in start window"),
            ) {
                Ok(active) => {
                    self.notifier
                        .notify(LifecycleEvent::ReservationActivated {
                            reservation_id: active.id,
                        })
                        .await;
                    active
                }
                Err(Error::Reservation(ReservationError::InvalidTransition { .. })) => {
                    return Ok(AutoStartOutcome::NotEligible);
                }
                Err(err) => return Err(err),
            }
        } else {
            reservation.clone()
        };

        match self.start_session(ctx, &reservation).await {
            Ok(usage) => {
                self.store
                    .set_auto_started(reservation.id, true, self.now())?;
                Ok(AutoStartOutcome::Started { usage })
            }
            Err(err @ Error::External(_)) => Ok(AutoStartOutcome::Failed {
                message: err.to_string(),
            }),
            Err(Error::Reservation(ReservationError::SessionAlreadyOpen { .. })) => {
                Ok(AutoStartOutcome::RuntimeBusy {
                    state: RuntimeState::Running,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Explicit stop: commit `active -> completed`, then stop the runtime.
    pub async fn complete(&self, ctx: &RuntimeContext, id: ReservationId) -> Result<CompletionOutcome> {
        let reservation = self.transition(id, ReservationStatus::Completed, Some("completed"))?;
        self.notifier
            .notify(LifecycleEvent::ReservationCompleted { reservation_id: id })
            .await;
        let stop = self.stop_session(ctx, &reservation).await?;
        let reservation = self.load(id)?;
        Ok(CompletionOutcome { reservation, stop })
    }

    /// Owner cancel from `pending` or `active`. Pending payments are
    /// cancelled with the reservation; an open session is stopped.
    pub async fn cancel(
        &self,
        ctx: &RuntimeContext,
        id: ReservationId,
        user_id: &str,
    ) -> Result<CancelOutcome> {
        let current = self.load(id)?;
        if current.user_id != user_id {
            return Err(ReservationError::NotOwner {
                id,
                user_id: user_id.to_string(),
            }
            .into());
        }
        if !current.status.can_transition_to(ReservationStatus::Cancelled) {
            return Err(ReservationError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Cancelled,
            }
            .into());
        }
        let note = format!("cancelled by {user_id} at {}", self.now().to_rfc3339());
        if !self
            .store
            .cancel_reservation(id, &[current.status], self.now(), &note)?
        {
            let after = self.load(id)?;
            return Err(ReservationError::InvalidTransition {
                id,
                from: after.status,
                to: ReservationStatus::Cancelled,
            }
            .into());
        }
        info!(reservation_id = id, user_id, "Reservation cancelled");
        self.notifier
            .notify(LifecycleEvent::ReservationCancelled {
                reservation_id: id,
                reason: "user cancelled".to_string(),
            })
            .await;

        let owns_session = self
            .store
            .open_usage_for_lab(&current.lab_ref)?
            .is_some_and(|open| open.reservation_id == Some(id));
        let stop = if owns_session {
            Some(self.stop_session(ctx, &current).await?)
        } else {
            None
        };
        Ok(CancelOutcome {
            reservation: self.load(id)?,
            stop,
        })
    }

    /// Complete every active reservation whose slot has ended.
    pub async fn finish_due(
        &self,
        ctx: &RuntimeContext,
        limit: Option<usize>,
    ) -> Result<FinishDueReport> {
        let mut report = FinishDueReport::default();
        for reservation in self.store.active_reservations_ended_by(self.now(), limit)? {
            match self.complete(ctx, reservation.id).await {
                Ok(outcome) => {
                    if outcome.stop.remote_error.is_some() {
                        report.stop_failures.push(reservation.id);
                    }
                    report.completed.push(reservation.id);
                }
                Err(Error::Reservation(ReservationError::InvalidTransition { .. })) => {
                    debug!(reservation_id = reservation.id, "Already finished elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Re-evaluate automatic starts for reservations entering the lookahead
    /// window: free pending ones and paid ones whose start was deferred.
    pub async fn start_due(
        &self,
        ctx: &RuntimeContext,
        limit: Option<usize>,
    ) -> Result<StartDueReport> {
        let now = self.now();
        let horizon = now + self.lookahead;
        let mut candidates = self
            .store
            .free_pending_reservations_starting_by(now, horizon, limit)?;
        candidates.extend(
            self.store
                .active_reservations_awaiting_start(now, horizon, limit)?,
        );
        candidates.sort_by_key(|r| (r.start_at, r.id));
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }

        let mut report = StartDueReport::default();
        for reservation in candidates {
            match self.auto_start(ctx, &reservation).await? {
                AutoStartOutcome::Started { .. } => report.started.push(reservation.id),
                AutoStartOutcome::Failed { .. } => report.failed.push(reservation.id),
                AutoStartOutcome::RuntimeBusy { .. } => report.busy.push(reservation.id),
                AutoStartOutcome::NotEligible | AutoStartOutcome::Deferred => {}
            }
        }
        Ok(report)
    }

    async fn record_runtime_failure(
        &self,
        reservation_id: Option<ReservationId>,
        lab_ref: &str,
        operation: &str,
        err: &Error,
    ) -> Result<()> {
        let now = self.now();
        if let Some(id) = reservation_id {
            let note = format!("{operation} failed at {}: {err}", now.to_rfc3339());
            self.store.record_failed_attempt(id, now, &note)?;
        }
        self.notifier
            .notify(LifecycleEvent::RuntimeActionFailed {
                reservation_id,
                lab_ref: lab_ref.to_string(),
                operation: operation.to_string(),
                message: err.to_string(),
            })
            .await;
        Ok(())
    }
}
