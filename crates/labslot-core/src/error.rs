//! Error types for labslot-core

use std::fmt::Write;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{ReservationId, ReservationStatus};

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for labslot-core
#[derive(Error, Debug)]
pub enum Error {
    /// Reservation lifecycle errors (validation, conflicts, transitions)
    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    /// Inbound payment notification errors
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    /// Lab runtime or payment processor failures
    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Reservation(err) => Some(err.remediation()),
            Self::Webhook(err) => Some(err.remediation()),
            Self::External(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "labslot config show")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .command("Reservation list", "labslot list")
                    .alternative("If the issue persists, restart labslot watch."),
            ),
        }
    }

    /// HTTP status class an API surface should answer with for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Reservation(err) => err.http_status(),
            Self::Webhook(err) => err.http_status(),
            Self::External(ExternalError::Timeout { .. }) => 504,
            Self::External(_) => 502,
            Self::Storage(StorageError::NotFound(_)) => 404,
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Runtime(_) => 500,
            Self::Json(_) => 400,
        }
    }

    /// True when the caller may retry the same remote action later.
    #[must_use]
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, Self::External(_))
    }
}

/// Reservation-specific errors
#[derive(Error, Debug)]
pub enum ReservationError {
    /// Malformed or logically impossible input
    #[error("Invalid reservation request: {0}")]
    Validation(String),

    /// Requested slot overlaps an existing non-cancelled reservation
    #[error(
        "Slot [{start_at}, {end_at}) on lab {lab_ref} conflicts with reservation {conflicting_id}"
    )]
    Conflict {
        lab_ref: String,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        conflicting_id: ReservationId,
    },

    #[error("Reservation not found: {0}")]
    NotFound(ReservationId),

    /// Status change not allowed by the lifecycle state machine
    #[error("Reservation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("Reservation {id} is not owned by {user_id}")]
    NotOwner { id: ReservationId, user_id: String },

    /// Another usage record is still open for the lab
    #[error("A session is already open on lab {lab_ref}")]
    SessionAlreadyOpen { lab_ref: String },

    #[error("No open session on lab {lab_ref}")]
    NoOpenSession { lab_ref: String },
}

impl ReservationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Validation(_) => Remediation::new("Fix the request and submit it again.")
                .command("List labs", "labslot lab list")
                .alternative("Start time must be in the future and end must follow start."),
            Self::Conflict { lab_ref, .. } => Remediation::new(format!(
                "The slot is taken. Pick a different interval on lab {lab_ref}."
            ))
            .command("Show bookings", format!("labslot list --lab {lab_ref}"))
            .alternative("Back-to-back slots sharing only an endpoint are allowed."),
            Self::NotFound(id) => Remediation::new(format!("Reservation {id} does not exist."))
                .command("List reservations", "labslot list"),
            Self::InvalidTransition { id, .. } => Remediation::new(format!(
                "Reservation {id} is not in a state that allows this action."
            ))
            .command("Show reservation", format!("labslot show {id}"))
            .alternative("Completed and cancelled reservations are final."),
            Self::NotOwner { id, .. } => {
                Remediation::new("Only the user who created a reservation can change it.")
                    .command("Show reservation", format!("labslot show {id}"))
            }
            Self::SessionAlreadyOpen { lab_ref } => Remediation::new(format!(
                "Stop the running session on lab {lab_ref} before starting another."
            ))
            .command("List sessions", format!("labslot usage --lab {lab_ref}")),
            Self::NoOpenSession { lab_ref } => {
                Remediation::new(format!("Lab {lab_ref} has no running session to stop."))
                    .command("List labs", "labslot lab list")
            }
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Conflict { .. } => 422,
            Self::NotFound(_) => 404,
            Self::NotOwner { .. } => 403,
            Self::InvalidTransition { .. }
            | Self::SessionAlreadyOpen { .. }
            | Self::NoOpenSession { .. } => 409,
        }
    }
}

/// Payment webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Missing webhook signature header")]
    MissingSignature,

    #[error("Webhook signature mismatch")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown payment transaction: {0}")]
    UnknownTransaction(String),
}

impl WebhookError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MissingSignature | Self::InvalidSignature => Remediation::new(
                "Webhook rejected. Verify the shared secret configured on both sides.",
            )
            .command("Sign a payload", "labslot sign-webhook --body-file payload.json")
            .alternative("Check payments.webhook_secret in labslot.toml."),
            Self::MalformedPayload(_) => Remediation::new(
                "The processor sent a body that could not be parsed. Inspect the raw payload.",
            )
            .command("Replay webhook", "labslot webhook --body-file payload.json --signature <sig>"),
            Self::UnknownTransaction(tx) => {
                Remediation::new(format!("No local payment matches transaction {tx}."))
                    .command("Check status", format!("labslot payment-status {tx}"))
                    .alternative("The payment may belong to another environment.")
            }
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingSignature | Self::InvalidSignature => 401,
            Self::MalformedPayload(_) => 400,
            Self::UnknownTransaction(_) => 404,
        }
    }

    /// True for authenticity failures (forged or unsigned deliveries).
    #[must_use]
    pub fn is_authenticity_failure(&self) -> bool {
        matches!(self, Self::MissingSignature | Self::InvalidSignature)
    }
}

/// Failures talking to the lab-control service or the payment processor
#[derive(Error, Debug)]
pub enum ExternalError {
    #[error("{service} call '{operation}' timed out after {timeout_ms} ms")]
    Timeout {
        service: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    /// The remote side answered but refused the operation
    #[error("{service} rejected request (status {status:?}): {message}")]
    Rejected {
        service: String,
        status: Option<u16>,
        message: String,
    },
}

impl ExternalError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Timeout { service, .. } | Self::Unavailable { service, .. } => {
                Remediation::new(format!(
                    "{service} did not answer. Local state is saved; retry the remote action."
                ))
                .command("Retry start", "labslot start <reservation-id>")
                .alternative("Raise runtime.timeout_seconds if the service is slow.")
            }
            Self::Rejected { service, .. } => Remediation::new(format!(
                "{service} refused the request. Check the lab state before retrying."
            ))
            .command("Show labs", "labslot lab list")
            .alternative("A manual reconciliation of the remote lab may be needed."),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        match self {
            Self::Timeout { service, .. }
            | Self::Unavailable { service, .. }
            | Self::Rejected { service, .. } => service,
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::LockPoisoned => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Show config", "labslot config show")
            .alternative("Ensure the database directory is writable."),
            Self::MigrationFailed(_) => {
                Remediation::new("Database migration failed. Check logs and retry after backup.")
                    .command("Show config", "labslot config show")
                    .alternative("Backup the database file before retrying.")
            }
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade labslot."
            ))
            .command("Upgrade", "cargo install labslot")
            .alternative("Restore a database created by this labslot version."),
            Self::Duplicate(_) => Remediation::new("A record with the same key already exists.")
                .command("List reservations", "labslot list"),
            Self::NotFound(_) => Remediation::new("The requested record was not found.")
                .command("List reservations", "labslot list")
                .alternative("Verify the identifier before retrying."),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show config", "labslot config show")
                .alternative("Validate the TOML syntax."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "labslot config show")
                    .alternative("Review validation errors and adjust labslot.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conflict() -> ReservationError {
        ReservationError::Conflict {
            lab_ref: "L1".to_string(),
            start_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            end_at: DateTime::from_timestamp(1_700_003_600, 0).unwrap(),
            conflicting_id: 7,
        }
    }

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Reservation(ReservationError::Validation("end before start".to_string())),
            Error::Reservation(sample_conflict()),
            Error::Reservation(ReservationError::NotFound(3)),
            Error::Reservation(ReservationError::InvalidTransition {
                id: 3,
                from: ReservationStatus::Completed,
                to: ReservationStatus::Active,
            }),
            Error::Reservation(ReservationError::NotOwner {
                id: 3,
                user_id: "mallory".to_string(),
            }),
            Error::Reservation(ReservationError::SessionAlreadyOpen {
                lab_ref: "L1".to_string(),
            }),
            Error::Reservation(ReservationError::NoOpenSession {
                lab_ref: "L1".to_string(),
            }),
            Error::Webhook(WebhookError::MissingSignature),
            Error::Webhook(WebhookError::InvalidSignature),
            Error::Webhook(WebhookError::MalformedPayload("not json".to_string())),
            Error::Webhook(WebhookError::UnknownTransaction("tx-1".to_string())),
            Error::External(ExternalError::Timeout {
                service: "lab-runtime".to_string(),
                operation: "start".to_string(),
                timeout_ms: 20_000,
            }),
            Error::External(ExternalError::Unavailable {
                service: "lab-runtime".to_string(),
                message: "connection refused".to_string(),
            }),
            Error::External(ExternalError::Rejected {
                service: "processor".to_string(),
                status: Some(400),
                message: "bad amount".to_string(),
            }),
            Error::Storage(StorageError::Database("db error".to_string())),
            Error::Storage(StorageError::MigrationFailed("migrate".to_string())),
            Error::Storage(StorageError::SchemaTooNew {
                current: 9,
                supported: 1,
            }),
            Error::Storage(StorageError::Duplicate("tx".to_string())),
            Error::Storage(StorageError::NotFound("payment".to_string())),
            Error::Storage(StorageError::LockPoisoned),
            Error::Config(ConfigError::FileNotFound("labslot.toml".to_string())),
            Error::Config(ConfigError::ReadFailed(
                "labslot.toml".to_string(),
                "io".to_string(),
            )),
            Error::Config(ConfigError::ParseFailed("parse".to_string())),
            Error::Config(ConfigError::ValidationError("invalid".to_string())),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Runtime("runtime".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(
                !remediation.summary.is_empty(),
                "remediation summary empty for {error:?}"
            );
            assert!(
                !remediation.commands.is_empty(),
                "remediation commands empty for {error:?}"
            );
        }
    }

    #[test]
    fn http_status_matches_external_interface() {
        assert_eq!(Error::from(sample_conflict()).http_status(), 422);
        assert_eq!(
            Error::from(ReservationError::Validation("x".into())).http_status(),
            422
        );
        assert_eq!(Error::from(WebhookError::MissingSignature).http_status(), 401);
        assert_eq!(Error::from(WebhookError::InvalidSignature).http_status(), 401);
        assert_eq!(
            Error::from(WebhookError::UnknownTransaction("t".into())).http_status(),
            404
        );
        assert_eq!(
            Error::from(ExternalError::Timeout {
                service: "lab-runtime".into(),
                operation: "stop".into(),
                timeout_ms: 10,
            })
            .http_status(),
            504
        );
    }

    #[test]
    fn only_external_errors_are_retryable() {
        let external = Error::from(ExternalError::Unavailable {
            service: "lab-runtime".into(),
            message: "down".into(),
        });
        assert!(external.is_retryable_by_caller());
        assert!(!Error::from(sample_conflict()).is_retryable_by_caller());
        assert!(!Error::from(WebhookError::InvalidSignature).is_retryable_by_caller());
    }

    #[test]
    fn authenticity_failures_are_classified() {
        assert!(WebhookError::MissingSignature.is_authenticity_failure());
        assert!(WebhookError::InvalidSignature.is_authenticity_failure());
        assert!(!WebhookError::UnknownTransaction("x".into()).is_authenticity_failure());
    }

    #[test]
    fn conflict_display_names_the_lab_and_blocker() {
        let msg = sample_conflict().to_string();
        assert!(msg.contains("L1"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn render_plain_omits_empty_sections() {
        let r = Remediation::new("Fix it");
        let output = r.render_plain();
        assert!(output.contains("To fix:"));
        assert!(!output.contains("Commands:"));
        assert!(!output.contains("Alternatives:"));
    }

    #[test]
    fn format_error_includes_remediation() {
        let err = Error::from(WebhookError::InvalidSignature);
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error: Webhook error"));
        assert!(text.contains("To fix:"));
    }

    #[test]
    fn from_rusqlite_error_is_storage() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }
}
