//! Domain records shared by the scheduler, payment gateway, lifecycle
//! coordinator and reaper.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ReservationId = i64;
pub type PaymentId = i64;
pub type UsageId = i64;

// =============================================================================
// Lab
// =============================================================================

/// Runtime state reported by the lab-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    Stopped,
    Starting,
    Started,
    Running,
    Stopping,
    Unknown,
}

impl RuntimeState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parse; anything unrecognised is `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "STOPPED" | "SHUTOFF" => Self::Stopped,
            "STARTING" => Self::Starting,
            "STARTED" => Self::Started,
            "RUNNING" | "ACTIVE" => Self::Running,
            "STOPPING" => Self::Stopping,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable lab environment. Owned by the catalog; the engine only reads
/// `lab_ref`/rate and refreshes the cached runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lab {
    pub lab_ref: String,
    pub name: String,
    /// Advisory cache of the external runtime state.
    pub runtime_state: RuntimeState,
    pub hourly_rate_cents: i64,
    pub state_refreshed_at: Option<DateTime<Utc>>,
}

impl Lab {
    #[must_use]
    pub fn new(lab_ref: impl Into<String>, name: impl Into<String>, hourly_rate_cents: i64) -> Self {
        Self {
            lab_ref: lab_ref.into(),
            name: name.into(),
            runtime_state: RuntimeState::Stopped,
            hourly_rate_cents,
            state_refreshed_at: None,
        }
    }
}

/// Cost of `[start_at, end_at)` at an hourly rate, rounded up to the cent.
#[must_use]
pub fn estimate_cost_cents(
    hourly_rate_cents: i64,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> i64 {
    let seconds = (end_at - start_at).num_seconds().max(0);
    if hourly_rate_cents <= 0 || seconds == 0 {
        return 0;
    }
    let numerator = i128::from(hourly_rate_cents) * i128::from(seconds);
    let cents = (numerator + 3599) / 3600;
    i64::try_from(cents).unwrap_or(i64::MAX)
}

// =============================================================================
// Reservation
// =============================================================================

/// Reservation lifecycle status.
///
/// `pending` and `active` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Active, Self::Completed, Self::Cancelled];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Edges of the lifecycle state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Cancelled)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Cancelled)
        )
    }

    /// Statuses a reservation may be in for a move to `next`.
    #[must_use]
    pub fn allowed_sources(next: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: String,
    pub lab_ref: String,
    /// Inclusive start of the slot.
    pub start_at: DateTime<Utc>,
    /// Exclusive end of the slot.
    pub end_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub auto_started: bool,
    pub estimated_cost_cents: i64,
    /// Remote start/stop failures recorded against this reservation.
    pub failed_attempts: u32,
    /// Append-only audit lines.
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.estimated_cost_cents == 0
    }

    #[must_use]
    pub fn overlaps(&self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> bool {
        crate::conflict::intervals_overlap(self.start_at, self.end_at, start_at, end_at)
    }
}

/// Insert payload for a reservation row.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub user_id: String,
    pub lab_ref: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub estimated_cost_cents: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Payment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    /// `None` for purchases that are not tied to a reservation.
    pub reservation_id: Option<ReservationId>,
    pub user_id: String,
    /// Locally generated, globally unique.
    pub transaction_id: String,
    /// Assigned by the processor once known.
    pub external_transaction_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Verbatim processor payloads, grouped by kind and appended.
    pub processor_payloads: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reservation_id: Option<ReservationId>,
    pub user_id: String,
    pub transaction_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Usage
// =============================================================================

/// One actual runtime session on a lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageId,
    /// `None` for manual starts outside a reservation.
    pub reservation_id: Option<ReservationId>,
    pub user_id: String,
    pub lab_ref: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    /// Filled in by downstream billing.
    pub cost_cents: Option<i64>,
}

impl UsageRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Billed duration of a session; never below one second.
#[must_use]
pub fn session_duration_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_seconds().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [ReservationStatus::Completed, ReservationStatus::Cancelled] {
            for to in ReservationStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be closed");
            }
        }
    }

    #[test]
    fn lifecycle_edges() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn allowed_sources_for_cancel() {
        let sources = ReservationStatus::allowed_sources(ReservationStatus::Cancelled);
        assert_eq!(
            sources,
            vec![ReservationStatus::Pending, ReservationStatus::Active]
        );
    }

    #[test]
    fn status_string_roundtrip() {
        for status in ReservationStatus::ALL {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("expired"), None);
        assert_eq!(PaymentStatus::parse("completed"), Some(PaymentStatus::Completed));
    }

    #[test]
    fn runtime_state_parse_is_lenient() {
        assert_eq!(RuntimeState::parse("stopped"), RuntimeState::Stopped);
        assert_eq!(RuntimeState::parse(" RUNNING "), RuntimeState::Running);
        assert_eq!(RuntimeState::parse("SHUTOFF"), RuntimeState::Stopped);
        assert_eq!(RuntimeState::parse("weird"), RuntimeState::Unknown);
    }

    #[test]
    fn runtime_state_serializes_uppercase() {
        let json = serde_json::to_string(&RuntimeState::Stopped).unwrap();
        assert_eq!(json, "\"STOPPED\"");
    }

    #[test]
    fn cost_rounds_up_to_the_cent() {
        assert_eq!(estimate_cost_cents(600, at(0), at(3600)), 600);
        assert_eq!(estimate_cost_cents(600, at(0), at(60)), 10);
        assert_eq!(estimate_cost_cents(1, at(0), at(1)), 1);
        assert_eq!(estimate_cost_cents(0, at(0), at(7200)), 0);
        assert_eq!(estimate_cost_cents(500, at(10), at(10)), 0);
    }

    #[test]
    fn duration_floor_is_one_second() {
        let start = at(0);
        assert_eq!(session_duration_seconds(start, start), 1);
        assert_eq!(
            session_duration_seconds(start, start + Duration::milliseconds(900)),
            1
        );
        assert_eq!(session_duration_seconds(start, start + Duration::seconds(90)), 90);
    }
}
