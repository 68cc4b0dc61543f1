//! SQLite persistence for labs, reservations, payments and usage records.
//!
//! The store is the only shared mutable resource in the engine. Every
//! check-then-write sequence runs inside a `BEGIN IMMEDIATE` transaction so
//! that concurrent writers (other tasks through the same handle, or other
//! processes on the same file) serialize on the SQLite write lock:
//!
//! - reservation insert re-runs the overlap query inside the transaction
//! - payment completion is a conditional update on `status != 'completed'`
//! - reaper cancellation re-checks "no completed payment" in the UPDATE
//! - at most one open usage record per lab is a partial UNIQUE index

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::model::{
    Lab, NewPayment, NewReservation, Payment, PaymentId, PaymentStatus, Reservation,
    ReservationId, ReservationStatus, RuntimeState, UsageRecord, session_duration_seconds,
};

/// Current schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS labs (
  lab_ref TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  runtime_state TEXT NOT NULL DEFAULT 'STOPPED',
  hourly_rate_cents INTEGER NOT NULL DEFAULT 0 CHECK (hourly_rate_cents >= 0),
  state_refreshed_at_ms INTEGER NULL
);
CREATE TABLE IF NOT EXISTS reservations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  lab_ref TEXT NOT NULL REFERENCES labs(lab_ref),
  start_at_ms INTEGER NOT NULL,
  end_at_ms INTEGER NOT NULL,
  status TEXT NOT NULL,
  auto_started INTEGER NOT NULL DEFAULT 0,
  estimated_cost_cents INTEGER NOT NULL DEFAULT 0,
  failed_attempts INTEGER NOT NULL DEFAULT 0,
  notes TEXT NOT NULL DEFAULT '',
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  CHECK (start_at_ms < end_at_ms)
);
CREATE TABLE IF NOT EXISTS payments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  reservation_id INTEGER NULL REFERENCES reservations(id),
  user_id TEXT NOT NULL,
  transaction_id TEXT NOT NULL UNIQUE,
  external_transaction_id TEXT NULL,
  amount_cents INTEGER NOT NULL,
  currency TEXT NOT NULL,
  status TEXT NOT NULL,
  processor_payloads TEXT NOT NULL DEFAULT '{}',
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  completed_at_ms INTEGER NULL
);
CREATE TABLE IF NOT EXISTS usage_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  reservation_id INTEGER NULL REFERENCES reservations(id),
  user_id TEXT NOT NULL,
  lab_ref TEXT NOT NULL,
  started_at_ms INTEGER NOT NULL,
  ended_at_ms INTEGER NULL,
  duration_seconds INTEGER NULL,
  cost_cents INTEGER NULL
);
CREATE INDEX IF NOT EXISTS idx_reservations_lab_window ON reservations(lab_ref, start_at_ms, end_at_ms);
CREATE INDEX IF NOT EXISTS idx_reservations_status_created ON reservations(status, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_payments_reservation ON payments(reservation_id, status);
CREATE INDEX IF NOT EXISTS idx_payments_external ON payments(external_transaction_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_one_completed
  ON payments(reservation_id) WHERE status = 'completed' AND reservation_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_one_open_per_lab
  ON usage_records(lab_ref) WHERE ended_at_ms IS NULL;
"#;

const RESERVATION_COLUMNS: &str = "id, user_id, lab_ref, start_at_ms, end_at_ms, status, \
     auto_started, estimated_cost_cents, failed_attempts, notes, created_at_ms, updated_at_ms";

const PAYMENT_COLUMNS: &str = "id, reservation_id, user_id, transaction_id, \
     external_transaction_id, amount_cents, currency, status, processor_payloads, \
     created_at_ms, updated_at_ms, completed_at_ms";

const USAGE_COLUMNS: &str = "id, reservation_id, user_id, lab_ref, started_at_ms, ended_at_ms, \
     duration_seconds, cost_cents";

const NO_COMPLETED_PAYMENT: &str = "NOT EXISTS (SELECT 1 FROM payments p \
     WHERE p.reservation_id = reservations.id AND p.status = 'completed')";

/// Outcome of the atomic check-and-insert.
#[derive(Debug, Clone)]
pub enum ReservationInsert {
    Inserted(Reservation),
    Conflict { conflicting_id: ReservationId },
    UnknownLab,
}

/// Outcome of applying a successful payment result.
#[derive(Debug, Clone)]
pub enum PaymentCompletion {
    /// The payment moved to `completed` in this call.
    Completed {
        payment: Payment,
        /// Linked reservation after the same transaction.
        reservation: Option<Reservation>,
        /// True when the reservation moved `pending -> active` here.
        activated: bool,
    },
    /// Duplicate delivery: nothing changed.
    AlreadyCompleted(Payment),
    /// Another payment of the same reservation completed first. This one
    /// was moved to `cancelled` and its capture needs a refund.
    Superseded(Payment),
}

/// Outcome of opening a usage record.
#[derive(Debug, Clone)]
pub enum UsageOpen {
    Opened(UsageRecord),
    /// Another record is still open for the lab.
    AlreadyOpen(UsageRecord),
}

/// Filter for reservation listings. Empty filter lists everything.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReservationFilter {
    pub user_id: Option<String>,
    pub lab_ref: Option<String>,
    pub status: Option<ReservationStatus>,
    pub limit: Option<usize>,
}

/// Cloneable handle to the SQLite database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    // -------------------------------------------------------------------------
    // Labs
    // -------------------------------------------------------------------------

    pub fn upsert_lab(&self, lab: &Lab) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO labs (lab_ref, name, runtime_state, hourly_rate_cents, state_refreshed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lab_ref) DO UPDATE SET
               name = excluded.name,
               hourly_rate_cents = excluded.hourly_rate_cents",
            params![
                lab.lab_ref,
                lab.name,
                lab.runtime_state.as_str(),
                lab.hourly_rate_cents,
                lab.state_refreshed_at.map(dt_to_ms)
            ],
        )?;
        Ok(())
    }

    pub fn get_lab(&self, lab_ref: &str) -> Result<Option<Lab>> {
        let conn = self.lock()?;
        let lab = conn
            .query_row(
                "SELECT lab_ref, name, runtime_state, hourly_rate_cents, state_refreshed_at_ms
                 FROM labs WHERE lab_ref = ?1",
                params![lab_ref],
                lab_from_row,
            )
            .optional()?;
        Ok(lab)
    }

    pub fn list_labs(&self) -> Result<Vec<Lab>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT lab_ref, name, runtime_state, hourly_rate_cents, state_refreshed_at_ms
             FROM labs ORDER BY lab_ref",
        )?;
        let rows = stmt.query_map([], lab_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Refresh the advisory runtime-state cache.
    pub fn update_lab_state(
        &self,
        lab_ref: &str,
        state: RuntimeState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE labs SET runtime_state = ?2, state_refreshed_at_ms = ?3 WHERE lab_ref = ?1",
            params![lab_ref, state.as_str(), dt_to_ms(at)],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Overlap check and insert as one immediate transaction.
    pub fn insert_reservation_if_free(&self, new: &NewReservation) -> Result<ReservationInsert> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let lab_exists = tx
            .query_row(
                "SELECT 1 FROM labs WHERE lab_ref = ?1",
                params![new.lab_ref],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !lab_exists {
            return Ok(ReservationInsert::UnknownLab);
        }

        let conflicting: Option<ReservationId> = tx
            .query_row(
                "SELECT id FROM reservations
                 WHERE lab_ref = ?1 AND status != 'cancelled'
                   AND start_at_ms < ?3 AND ?2 < end_at_ms
                 ORDER BY start_at_ms ASC LIMIT 1",
                params![new.lab_ref, dt_to_ms(new.start_at), dt_to_ms(new.end_at)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(conflicting_id) = conflicting {
            return Ok(ReservationInsert::Conflict { conflicting_id });
        }

        let created_ms = dt_to_ms(new.created_at);
        tx.execute(
            "INSERT INTO reservations
             (user_id, lab_ref, start_at_ms, end_at_ms, status, auto_started,
              estimated_cost_cents, failed_attempts, notes, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, 0, '', ?6, ?6)",
            params![
                new.user_id,
                new.lab_ref,
                dt_to_ms(new.start_at),
                dt_to_ms(new.end_at),
                new.estimated_cost_cents,
                created_ms
            ],
        )?;
        let id = tx.last_insert_rowid();
        let reservation = query_reservation(&tx, id)?
            .ok_or_else(|| StorageError::NotFound(format!("reservation {id}")))?;
        tx.commit()?;
        debug!(reservation_id = id, lab_ref = %new.lab_ref, "Reservation inserted");
        Ok(ReservationInsert::Inserted(reservation))
    }

    /// Read-only overlap check against non-cancelled reservations.
    pub fn has_conflict(
        &self,
        lab_ref: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        exclude: Option<ReservationId>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM reservations
                 WHERE lab_ref = ?1 AND status != 'cancelled'
                   AND start_at_ms < ?3 AND ?2 < end_at_ms
                   AND (?4 IS NULL OR id != ?4)
                 LIMIT 1",
                params![lab_ref, dt_to_ms(start_at), dt_to_ms(end_at), exclude],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let conn = self.lock()?;
        query_reservation(&conn, id)
    }

    pub fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR lab_ref = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY start_at_ms ASC, id ASC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.user_id,
                filter.lab_ref,
                filter.status.map(ReservationStatus::as_str),
                sql_limit(filter.limit)
            ],
            reservation_from_row,
        )?;
        collect_rows(rows)
    }

    /// Conditional status change. Returns false when the row was not in any
    /// of `from` (or does not exist).
    pub fn transition_reservation(
        &self,
        id: ReservationId,
        from: &[ReservationStatus],
        to: ReservationStatus,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE reservations
             SET status = ?2, updated_at_ms = ?3, notes = {}
             WHERE id = ?1 AND status IN ({})",
            APPEND_NOTE_SQL,
            status_list(from)
        );
        let changed = conn.execute(&sql, params![id, to.as_str(), dt_to_ms(at), note])?;
        Ok(changed > 0)
    }

    /// Cancel a reservation and any of its pending payments atomically.
    pub fn cancel_reservation(
        &self,
        id: ReservationId,
        from: &[ReservationStatus],
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "UPDATE reservations
             SET status = 'cancelled', updated_at_ms = ?2, notes = {}
             WHERE id = ?1 AND status IN ({})",
            APPEND_NOTE_SQL.replace("?4", "?3"),
            status_list(from)
        );
        let changed = tx.execute(&sql, params![id, dt_to_ms(at), note])?;
        if changed > 0 {
            cancel_pending_payments(&tx, id, at)?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn set_auto_started(&self, id: ReservationId, auto_started: bool, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE reservations SET auto_started = ?2, updated_at_ms = ?3 WHERE id = ?1",
            params![id, auto_started, dt_to_ms(at)],
        )?;
        Ok(())
    }

    /// Count a remote start/stop failure against the reservation.
    pub fn record_failed_attempt(
        &self,
        id: ReservationId,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE reservations
             SET failed_attempts = failed_attempts + 1, updated_at_ms = ?2, notes = {}
             WHERE id = ?1",
            APPEND_NOTE_SQL.replace("?4", "?3"),
        );
        conn.execute(&sql, params![id, dt_to_ms(at), note])?;
        Ok(())
    }

    pub fn append_reservation_note(
        &self,
        id: ReservationId,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE reservations SET updated_at_ms = ?2, notes = {} WHERE id = ?1",
            APPEND_NOTE_SQL.replace("?4", "?3"),
        );
        conn.execute(&sql, params![id, dt_to_ms(at), note])?;
        Ok(())
    }

    /// Active reservations whose slot has ended.
    pub fn active_reservations_ended_by(
        &self,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE status = 'active' AND end_at_ms <= ?1
             ORDER BY end_at_ms ASC, id ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![dt_to_ms(now), sql_limit(limit)], reservation_from_row)?;
        collect_rows(rows)
    }

    /// Pending zero-cost reservations that start before `horizon` and have not ended.
    pub fn free_pending_reservations_starting_by(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE status = 'pending' AND estimated_cost_cents = 0
               AND start_at_ms <= ?2 AND end_at_ms > ?1
             ORDER BY start_at_ms ASC, id ASC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![dt_to_ms(now), dt_to_ms(horizon), sql_limit(limit)],
            reservation_from_row,
        )?;
        collect_rows(rows)
    }

    /// Active reservations inside the start window that never had a session
    /// and never recorded a failed remote attempt.
    pub fn active_reservations_awaiting_start(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE status = 'active' AND failed_attempts = 0
               AND start_at_ms <= ?2 AND end_at_ms > ?1
               AND NOT EXISTS (SELECT 1 FROM usage_records u
                               WHERE u.reservation_id = reservations.id)
             ORDER BY start_at_ms ASC, id ASC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![dt_to_ms(now), dt_to_ms(horizon), sql_limit(limit)],
            reservation_from_row,
        )?;
        collect_rows(rows)
    }

    /// Reaper candidates: unpaid pending reservations created at or before `cutoff`.
    pub fn expired_pending_reservations(
        &self,
        cutoff: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE status = 'pending' AND created_at_ms <= ?1 AND estimated_cost_cents > 0
               AND {NO_COMPLETED_PAYMENT}
             ORDER BY created_at_ms ASC, id ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![dt_to_ms(cutoff), sql_limit(limit)], reservation_from_row)?;
        collect_rows(rows)
    }

    /// Cancel one reaper candidate, re-checking every selection predicate in
    /// the UPDATE itself. A payment that completed after selection wins.
    pub fn cancel_unpaid_reservation(
        &self,
        id: ReservationId,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "UPDATE reservations
             SET status = 'cancelled', updated_at_ms = ?3, notes = {}
             WHERE id = ?1 AND status = 'pending' AND created_at_ms <= ?2
               AND estimated_cost_cents > 0 AND {NO_COMPLETED_PAYMENT}",
            APPEND_NOTE_SQL,
        );
        let changed = tx.execute(&sql, params![id, dt_to_ms(cutoff), dt_to_ms(at), note])?;
        if changed > 0 {
            cancel_pending_payments(&tx, id, at)?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    pub fn insert_payment(&self, new: &NewPayment) -> Result<Payment> {
        let conn = self.lock()?;
        let created_ms = dt_to_ms(new.created_at);
        let insert = conn.execute(
            "INSERT INTO payments
             (reservation_id, user_id, transaction_id, amount_cents, currency, status,
              processor_payloads, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', '{}', ?6, ?6)",
            params![
                new.reservation_id,
                new.user_id,
                new.transaction_id,
                new.amount_cents,
                new.currency,
                created_ms
            ],
        );
        match insert {
            Ok(_) => {}
            Err(err) if is_constraint_violation(&err) => {
                return Err(StorageError::Duplicate(format!(
                    "transaction_id {}",
                    new.transaction_id
                ))
                .into());
            }
            Err(err) => return Err(err.into()),
        }
        let id = conn.last_insert_rowid();
        query_payment(&conn, id)?
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")).into())
    }

    pub fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let conn = self.lock()?;
        query_payment(&conn, id)
    }

    /// Correlate by the local transaction id, falling back to the
    /// processor-assigned id.
    pub fn find_payment_by_transaction(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE transaction_id = ?1 OR external_transaction_id = ?1
             ORDER BY CASE WHEN transaction_id = ?1 THEN 0 ELSE 1 END, id ASC
             LIMIT 1"
        );
        let payment = conn
            .query_row(&sql, params![transaction_id], payment_from_row)
            .optional()?;
        Ok(payment)
    }

    pub fn payments_for_reservation(&self, reservation_id: ReservationId) -> Result<Vec<Payment>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE reservation_id = ?1 ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![reservation_id], payment_from_row)?;
        collect_rows(rows)
    }

    pub fn has_completed_payment(&self, reservation_id: ReservationId) -> Result<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM payments WHERE reservation_id = ?1 AND status = 'completed' LIMIT 1",
                params![reservation_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record the processor-assigned id if none is known yet.
    pub fn set_external_transaction_id(
        &self,
        id: PaymentId,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE payments SET external_transaction_id = ?2, updated_at_ms = ?3
             WHERE id = ?1 AND external_transaction_id IS NULL",
            params![id, external_id, dt_to_ms(at)],
        )?;
        Ok(())
    }

    /// Append a verbatim processor payload under `kind` (merge, never overwrite).
    pub fn append_payment_payload(
        &self,
        id: PaymentId,
        kind: &str,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: String = tx
            .query_row(
                "SELECT processor_payloads FROM payments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        let mut doc: serde_json::Value =
            serde_json::from_str(&current).unwrap_or_else(|_| serde_json::json!({}));
        merge_payload(&mut doc, kind, payload);
        tx.execute(
            "UPDATE payments SET processor_payloads = ?2, updated_at_ms = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(&doc)?, dt_to_ms(at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Idempotent success application: payment to `completed` and, in the
    /// same transaction, the linked reservation `pending -> active`.
    pub fn complete_payment(&self, id: PaymentId, at: DateTime<Utc>) -> Result<PaymentCompletion> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at_ms = dt_to_ms(at);

        let changed = match tx.execute(
            "UPDATE payments SET status = 'completed', completed_at_ms = ?2, updated_at_ms = ?2
             WHERE id = ?1 AND status != 'completed'",
            params![id, at_ms],
        ) {
            Ok(changed) => changed,
            Err(err) if is_constraint_violation(&err) => {
                tx.execute(
                    "UPDATE payments SET status = 'cancelled', updated_at_ms = ?2
                     WHERE id = ?1 AND status != 'completed'",
                    params![id, at_ms],
                )?;
                let payment = query_payment(&tx, id)?
                    .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
                tx.commit()?;
                return Ok(PaymentCompletion::Superseded(payment));
            }
            Err(err) => return Err(err.into()),
        };

        let payment = query_payment(&tx, id)?
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        if changed == 0 {
            return Ok(PaymentCompletion::AlreadyCompleted(payment));
        }

        let mut activated = false;
        let mut reservation = None;
        if let Some(reservation_id) = payment.reservation_id {
            activated = tx.execute(
                "UPDATE reservations SET status = 'active', updated_at_ms = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![reservation_id, at_ms],
            )? > 0;
            reservation = query_reservation(&tx, reservation_id)?;
        }
        tx.commit()?;
        Ok(PaymentCompletion::Completed {
            payment,
            reservation,
            activated,
        })
    }

    /// `pending -> failed`. Returns false for any other current status.
    pub fn fail_payment(&self, id: PaymentId, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE payments SET status = 'failed', updated_at_ms = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, dt_to_ms(at)],
        )?;
        Ok(changed > 0)
    }

    // -------------------------------------------------------------------------
    // Usage records
    // -------------------------------------------------------------------------

    /// Open a session record; the partial unique index rejects a second open
    /// record for the same lab.
    pub fn open_usage(
        &self,
        reservation_id: Option<ReservationId>,
        user_id: &str,
        lab_ref: &str,
        started_at: DateTime<Utc>,
    ) -> Result<UsageOpen> {
        let conn = self.lock()?;
        let insert = conn.execute(
            "INSERT INTO usage_records (reservation_id, user_id, lab_ref, started_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![reservation_id, user_id, lab_ref, dt_to_ms(started_at)],
        );
        match insert {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                let record = query_usage(&conn, id)?
                    .ok_or_else(|| StorageError::NotFound(format!("usage record {id}")))?;
                Ok(UsageOpen::Opened(record))
            }
            Err(err) if is_constraint_violation(&err) => {
                let existing = query_open_usage(&conn, lab_ref)?.ok_or_else(|| {
                    StorageError::Database(format!("open usage for {lab_ref} vanished"))
                })?;
                Ok(UsageOpen::AlreadyOpen(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn open_usage_for_lab(&self, lab_ref: &str) -> Result<Option<UsageRecord>> {
        let conn = self.lock()?;
        query_open_usage(&conn, lab_ref)
    }

    /// Close the open record for `lab_ref`, if any, with a duration floor of
    /// one second.
    pub fn close_open_usage(
        &self,
        lab_ref: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(open) = query_open_usage(&tx, lab_ref)? else {
            return Ok(None);
        };
        let duration = session_duration_seconds(open.started_at, ended_at);
        tx.execute(
            "UPDATE usage_records SET ended_at_ms = ?2, duration_seconds = ?3
             WHERE id = ?1 AND ended_at_ms IS NULL",
            params![open.id, dt_to_ms(ended_at), duration],
        )?;
        let closed = query_usage(&tx, open.id)?;
        tx.commit()?;
        Ok(closed)
    }

    pub fn list_usage(&self, lab_ref: Option<&str>, limit: Option<usize>) -> Result<Vec<UsageRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records
             WHERE (?1 IS NULL OR lab_ref = ?1)
             ORDER BY started_at_ms DESC, id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![lab_ref, sql_limit(limit)], usage_from_row)?;
        collect_rows(rows)
    }
}

/// Create tables and indexes, and stamp the schema version.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Append `entry` to the array stored under `kind`, creating it as needed.
/// A non-object document or non-array slot is preserved under `legacy`.
pub fn merge_payload(doc: &mut serde_json::Value, kind: &str, entry: serde_json::Value) {
    if !doc.is_object() {
        let previous = std::mem::replace(doc, serde_json::json!({}));
        if !previous.is_null() {
            doc["legacy"] = previous;
        }
    }
    let slot = &mut doc[kind];
    match slot {
        serde_json::Value::Array(items) => items.push(entry),
        serde_json::Value::Null => *slot = serde_json::Value::Array(vec![entry]),
        other => {
            let previous = other.take();
            *other = serde_json::Value::Array(vec![previous, entry]);
        }
    }
}

// Appends `?4` as a new line to `notes` when non-null.
const APPEND_NOTE_SQL: &str =
    "CASE WHEN ?4 IS NULL THEN notes WHEN notes = '' THEN ?4 ELSE notes || char(10) || ?4 END";

fn status_list(statuses: &[ReservationStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn cancel_pending_payments(
    conn: &Connection,
    reservation_id: ReservationId,
    at: DateTime<Utc>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE payments SET status = 'cancelled', updated_at_ms = ?2
         WHERE reservation_id = ?1 AND status = 'pending'",
        params![reservation_id, dt_to_ms(at)],
    )?;
    Ok(changed)
}

fn query_reservation(conn: &Connection, id: ReservationId) -> Result<Option<Reservation>> {
    let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1");
    let reservation = conn
        .query_row(&sql, params![id], reservation_from_row)
        .optional()?;
    Ok(reservation)
}

fn query_payment(conn: &Connection, id: PaymentId) -> Result<Option<Payment>> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1");
    let payment = conn.query_row(&sql, params![id], payment_from_row).optional()?;
    Ok(payment)
}

fn query_usage(conn: &Connection, id: i64) -> Result<Option<UsageRecord>> {
    let sql = format!("SELECT {USAGE_COLUMNS} FROM usage_records WHERE id = ?1");
    let record = conn.query_row(&sql, params![id], usage_from_row).optional()?;
    Ok(record)
}

fn query_open_usage(conn: &Connection, lab_ref: &str) -> Result<Option<UsageRecord>> {
    let sql = format!(
        "SELECT {USAGE_COLUMNS} FROM usage_records WHERE lab_ref = ?1 AND ended_at_ms IS NULL"
    );
    let record = conn
        .query_row(&sql, params![lab_ref], usage_from_row)
        .optional()?;
    Ok(record)
}

fn lab_from_row(row: &Row<'_>) -> rusqlite::Result<Lab> {
    Ok(Lab {
        lab_ref: row.get(0)?,
        name: row.get(1)?,
        runtime_state: RuntimeState::parse(&row.get::<_, String>(2)?),
        hourly_rate_cents: row.get(3)?,
        state_refreshed_at: row.get::<_, Option<i64>>(4)?.map(ms_to_dt),
    })
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    let status: String = row.get(5)?;
    let status = ReservationStatus::parse(&status)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "status".to_string(), Type::Text))?;
    let notes: String = row.get(9)?;
    Ok(Reservation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        lab_ref: row.get(2)?,
        start_at: ms_to_dt(row.get(3)?),
        end_at: ms_to_dt(row.get(4)?),
        status,
        auto_started: row.get(6)?,
        estimated_cost_cents: row.get(7)?,
        failed_attempts: u32::try_from(row.get::<_, i64>(8)?).unwrap_or(u32::MAX),
        notes: notes
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        created_at: ms_to_dt(row.get(10)?),
        updated_at: ms_to_dt(row.get(11)?),
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(7)?;
    let status = PaymentStatus::parse(&status)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(7, "status".to_string(), Type::Text))?;
    let payloads: String = row.get(8)?;
    Ok(Payment {
        id: row.get(0)?,
        reservation_id: row.get(1)?,
        user_id: row.get(2)?,
        transaction_id: row.get(3)?,
        external_transaction_id: row.get(4)?,
        amount_cents: row.get(5)?,
        currency: row.get(6)?,
        status,
        processor_payloads: serde_json::from_str(&payloads)
            .unwrap_or_else(|_| serde_json::Value::String(payloads)),
        created_at: ms_to_dt(row.get(9)?),
        updated_at: ms_to_dt(row.get(10)?),
        completed_at: row.get::<_, Option<i64>>(11)?.map(ms_to_dt),
    })
}

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        reservation_id: row.get(1)?,
        user_id: row.get(2)?,
        lab_ref: row.get(3)?,
        started_at: ms_to_dt(row.get(4)?),
        ended_at: row.get::<_, Option<i64>>(5)?.map(ms_to_dt),
        duration_seconds: row.get(6)?,
        cost_cents: row.get(7)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn store_with_lab(rate: i64) -> Store {
        let store = Store::open_in_memory().expect("open store");
        store.upsert_lab(&Lab::new("L1", "Lab one", rate)).expect("lab");
        store
    }

    fn new_reservation(start_min: i64, end_min: i64, cost: i64) -> NewReservation {
        NewReservation {
            user_id: "alice".to_string(),
            lab_ref: "L1".to_string(),
            start_at: t0() + Duration::minutes(start_min),
            end_at: t0() + Duration::minutes(end_min),
            estimated_cost_cents: cost,
            created_at: t0(),
        }
    }

    fn insert(store: &Store, start_min: i64, end_min: i64, cost: i64) -> Reservation {
        match store
            .insert_reservation_if_free(&new_reservation(start_min, end_min, cost))
            .expect("insert")
        {
            ReservationInsert::Inserted(r) => r,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    fn payment_for(store: &Store, reservation: &Reservation, tx: &str) -> Payment {
        store
            .insert_payment(&NewPayment {
                reservation_id: Some(reservation.id),
                user_id: reservation.user_id.clone(),
                transaction_id: tx.to_string(),
                amount_cents: reservation.estimated_cost_cents,
                currency: "USD".to_string(),
                created_at: t0(),
            })
            .expect("payment")
    }

    #[test]
    fn schema_initializes_twice() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = initialize_schema(&conn).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::SchemaTooNew { .. })
        ));
    }

    #[test]
    fn insert_rejects_overlap_but_allows_back_to_back() {
        let store = store_with_lab(0);
        let first = insert(&store, 10, 70, 0);
        assert_eq!(first.status, ReservationStatus::Pending);

        let overlap = store
            .insert_reservation_if_free(&new_reservation(40, 50, 0))
            .unwrap();
        assert!(matches!(
            overlap,
            ReservationInsert::Conflict { conflicting_id } if conflicting_id == first.id
        ));

        let adjacent = store
            .insert_reservation_if_free(&new_reservation(70, 90, 0))
            .unwrap();
        assert!(matches!(adjacent, ReservationInsert::Inserted(_)));
    }

    #[test]
    fn cancelled_reservations_free_the_slot() {
        let store = store_with_lab(0);
        let first = insert(&store, 0, 60, 0);
        assert!(
            store
                .cancel_reservation(first.id, &[ReservationStatus::Pending], t0(), "user cancel")
                .unwrap()
        );
        assert!(!store.has_conflict("L1", t0(), t0() + Duration::minutes(60), None).unwrap());
        insert(&store, 0, 60, 0);
    }

    #[test]
    fn unknown_lab_is_reported() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store
            .insert_reservation_if_free(&new_reservation(0, 10, 0))
            .unwrap();
        assert!(matches!(outcome, ReservationInsert::UnknownLab));
    }

    #[test]
    fn has_conflict_honours_exclusion() {
        let store = store_with_lab(0);
        let r = insert(&store, 0, 60, 0);
        let (s, e) = (t0() + Duration::minutes(30), t0() + Duration::minutes(40));
        assert!(store.has_conflict("L1", s, e, None).unwrap());
        assert!(!store.has_conflict("L1", s, e, Some(r.id)).unwrap());
        assert!(!store.has_conflict("L2", s, e, None).unwrap());
    }

    #[test]
    fn transition_is_conditional_and_appends_notes() {
        let store = store_with_lab(0);
        let r = insert(&store, 0, 60, 0);
        assert!(
            store
                .transition_reservation(
                    r.id,
                    &[ReservationStatus::Pending],
                    ReservationStatus::Active,
                    t0(),
                    Some("activated"),
                )
                .unwrap()
        );
        assert!(
            !store
                .transition_reservation(
                    r.id,
                    &[ReservationStatus::Pending],
                    ReservationStatus::Active,
                    t0(),
                    None,
                )
                .unwrap()
        );
        store.append_reservation_note(r.id, t0(), "second").unwrap();
        let loaded = store.get_reservation(r.id).unwrap().unwrap();
        assert_eq!(loaded.status, ReservationStatus::Active);
        assert_eq!(loaded.notes, vec!["activated", "second"]);
    }

    #[test]
    fn failed_attempts_accumulate() {
        let store = store_with_lab(0);
        let r = insert(&store, 0, 60, 0);
        store.record_failed_attempt(r.id, t0(), "start failed").unwrap();
        store.record_failed_attempt(r.id, t0(), "stop failed").unwrap();
        let loaded = store.get_reservation(r.id).unwrap().unwrap();
        assert_eq!(loaded.failed_attempts, 2);
        assert_eq!(loaded.notes.len(), 2);
    }

    #[test]
    fn duplicate_transaction_id_is_rejected() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        payment_for(&store, &r, "tx-1");
        let err = store
            .insert_payment(&NewPayment {
                reservation_id: Some(r.id),
                user_id: "alice".to_string(),
                transaction_id: "tx-1".to_string(),
                amount_cents: 600,
                currency: "USD".to_string(),
                created_at: t0(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::Duplicate(_))
        ));
    }

    #[test]
    fn complete_payment_is_idempotent_and_activates_once() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let p = payment_for(&store, &r, "tx-1");

        match store.complete_payment(p.id, t0()).unwrap() {
            PaymentCompletion::Completed {
                activated,
                reservation,
                payment,
            } => {
                assert!(activated);
                assert_eq!(payment.status, PaymentStatus::Completed);
                assert_eq!(reservation.unwrap().status, ReservationStatus::Active);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(matches!(
            store.complete_payment(p.id, t0()).unwrap(),
            PaymentCompletion::AlreadyCompleted(_)
        ));
        assert!(store.has_completed_payment(r.id).unwrap());
        assert!(!store.fail_payment(p.id, t0()).unwrap());
    }

    #[test]
    fn second_completion_for_a_reservation_is_superseded() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let first = payment_for(&store, &r, "tx-1");
        let second = payment_for(&store, &r, "tx-2");
        store.complete_payment(first.id, t0()).unwrap();

        match store.complete_payment(second.id, t0()).unwrap() {
            PaymentCompletion::Superseded(payment) => {
                assert_eq!(payment.id, second.id);
                assert_eq!(payment.status, PaymentStatus::Cancelled);
            }
            other => panic!("expected superseded, got {other:?}"),
        }
        // redelivery stays superseded and the first payment is untouched
        assert!(matches!(
            store.complete_payment(second.id, t0()).unwrap(),
            PaymentCompletion::Superseded(_)
        ));
        assert_eq!(
            store.get_payment(first.id).unwrap().unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[test]
    fn find_payment_by_external_id() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let p = payment_for(&store, &r, "tx-1");
        store.set_external_transaction_id(p.id, "proc-99", t0()).unwrap();
        store.set_external_transaction_id(p.id, "proc-100", t0()).unwrap();
        let found = store.find_payment_by_transaction("proc-99").unwrap().unwrap();
        assert_eq!(found.id, p.id);
        assert!(store.find_payment_by_transaction("proc-100").unwrap().is_none());
        assert!(store.find_payment_by_transaction("tx-1").unwrap().is_some());
    }

    #[test]
    fn payloads_are_appended_not_overwritten() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let p = payment_for(&store, &r, "tx-1");
        store
            .append_payment_payload(p.id, "webhooks", serde_json::json!({"n": 1}), t0())
            .unwrap();
        store
            .append_payment_payload(p.id, "webhooks", serde_json::json!({"n": 2}), t0())
            .unwrap();
        store
            .append_payment_payload(p.id, "intent", serde_json::json!({"url": "x"}), t0())
            .unwrap();
        let loaded = store.get_payment(p.id).unwrap().unwrap();
        assert_eq!(loaded.processor_payloads["webhooks"].as_array().unwrap().len(), 2);
        assert_eq!(loaded.processor_payloads["intent"][0]["url"], "x");
    }

    #[test]
    fn merge_payload_keeps_scalar_history() {
        let mut doc = serde_json::json!({"webhooks": "raw"});
        merge_payload(&mut doc, "webhooks", serde_json::json!("next"));
        assert_eq!(doc["webhooks"], serde_json::json!(["raw", "next"]));

        let mut legacy = serde_json::json!("old text");
        merge_payload(&mut legacy, "webhooks", serde_json::json!(1));
        assert_eq!(legacy["legacy"], "old text");
        assert_eq!(legacy["webhooks"], serde_json::json!([1]));
    }

    #[test]
    fn reaper_update_loses_to_completed_payment() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let p = payment_for(&store, &r, "tx-1");
        let cutoff = t0() + Duration::minutes(5);

        let candidates = store.expired_pending_reservations(cutoff, None).unwrap();
        assert_eq!(candidates.len(), 1);

        // payment completes between selection and update
        store.complete_payment(p.id, t0()).unwrap();
        assert!(!store.cancel_unpaid_reservation(r.id, cutoff, cutoff, "reaped").unwrap());
        assert_eq!(
            store.get_reservation(r.id).unwrap().unwrap().status,
            ReservationStatus::Active
        );
    }

    #[test]
    fn reaper_cancel_also_cancels_pending_payments() {
        let store = store_with_lab(600);
        let r = insert(&store, 0, 60, 600);
        let p = payment_for(&store, &r, "tx-1");
        let cutoff = t0() + Duration::minutes(5);
        assert!(store.cancel_unpaid_reservation(r.id, cutoff, cutoff, "reaped").unwrap());
        assert_eq!(
            store.get_payment(p.id).unwrap().unwrap().status,
            PaymentStatus::Cancelled
        );
    }

    #[test]
    fn free_reservations_are_not_reaper_candidates() {
        let store = store_with_lab(0);
        insert(&store, 0, 60, 0);
        let candidates = store
            .expired_pending_reservations(t0() + Duration::hours(1), None)
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn one_open_usage_per_lab() {
        let store = store_with_lab(0);
        let first = store.open_usage(None, "alice", "L1", t0()).unwrap();
        let UsageOpen::Opened(first) = first else {
            panic!("expected open");
        };
        match store.open_usage(None, "bob", "L1", t0()).unwrap() {
            UsageOpen::AlreadyOpen(existing) => assert_eq!(existing.id, first.id),
            UsageOpen::Opened(_) => panic!("second open must be rejected"),
        }
        // other labs are independent
        assert!(matches!(
            store.open_usage(None, "bob", "L2", t0()).unwrap(),
            UsageOpen::Opened(_)
        ));
    }

    #[test]
    fn closing_usage_applies_duration_floor() {
        let store = store_with_lab(0);
        store.open_usage(None, "alice", "L1", t0()).unwrap();
        let closed = store
            .close_open_usage("L1", t0() + Duration::milliseconds(400))
            .unwrap()
            .unwrap();
        assert_eq!(closed.duration_seconds, Some(1));
        assert!(!closed.is_open());
        assert!(store.close_open_usage("L1", t0()).unwrap().is_none());
        // a new session can open once the previous one closed
        assert!(matches!(
            store.open_usage(None, "alice", "L1", t0()).unwrap(),
            UsageOpen::Opened(_)
        ));
    }

    #[test]
    fn list_filters_by_status_and_user() {
        let store = store_with_lab(0);
        let a = insert(&store, 0, 10, 0);
        insert(&store, 10, 20, 0);
        store
            .transition_reservation(
                a.id,
                &[ReservationStatus::Pending],
                ReservationStatus::Active,
                t0(),
                None,
            )
            .unwrap();
        let active = store
            .list_reservations(&ReservationFilter {
                status: Some(ReservationStatus::Active),
                ..ReservationFilter::default()
            })
            .unwrap();
        assert_eq!(active.len(), 1);
        let bobs = store
            .list_reservations(&ReservationFilter {
                user_id: Some("bob".to_string()),
                ..ReservationFilter::default()
            })
            .unwrap();
        assert!(bobs.is_empty());
    }

    #[test]
    fn awaiting_start_skips_started_and_failed() {
        let store = store_with_lab(600);
        let a = insert(&store, 0, 60, 600);
        let b = insert(&store, 60, 120, 600);
        let c = insert(&store, 120, 180, 600);
        for r in [&a, &b, &c] {
            store
                .transition_reservation(
                    r.id,
                    &[ReservationStatus::Pending],
                    ReservationStatus::Active,
                    t0(),
                    None,
                )
                .unwrap();
        }
        store.open_usage(Some(a.id), "alice", "L1", t0()).unwrap();
        store.record_failed_attempt(b.id, t0(), "start failed").unwrap();
        let due = store
            .active_reservations_awaiting_start(t0(), t0() + Duration::hours(3), None)
            .unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c.id]);
    }

    #[test]
    fn lab_state_cache_updates() {
        let store = store_with_lab(0);
        store
            .update_lab_state("L1", RuntimeState::Running, t0())
            .unwrap();
        let lab = store.get_lab("L1").unwrap().unwrap();
        assert_eq!(lab.runtime_state, RuntimeState::Running);
        assert_eq!(lab.state_refreshed_at, Some(t0()));
        // catalog upsert does not clobber the cached state
        store.upsert_lab(&Lab::new("L1", "Renamed", 100)).unwrap();
        let lab = store.get_lab("L1").unwrap().unwrap();
        assert_eq!(lab.runtime_state, RuntimeState::Running);
        assert_eq!(lab.name, "Renamed");
    }
}
