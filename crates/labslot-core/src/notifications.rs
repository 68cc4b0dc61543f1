//! Lifecycle notifications.
//!
//! Delivery is fire-and-forget: a dispatcher failure is logged and never
//! affects the operation that produced the event.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{PaymentId, ReservationId, UsageRecord};

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ReservationCreated {
        reservation_id: ReservationId,
        user_id: String,
        lab_ref: String,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    },
    PaymentCompleted {
        payment_id: PaymentId,
        reservation_id: Option<ReservationId>,
        transaction_id: String,
    },
    PaymentFailed {
        payment_id: PaymentId,
        reservation_id: Option<ReservationId>,
        transaction_id: String,
        reason: String,
    },
    ReservationActivated {
        reservation_id: ReservationId,
    },
    SessionStarted {
        usage: UsageRecord,
    },
    SessionStopped {
        usage: UsageRecord,
    },
    ReservationCompleted {
        reservation_id: ReservationId,
    },
    ReservationCancelled {
        reservation_id: ReservationId,
        reason: String,
    },
    ReservationExpired {
        reservation_id: ReservationId,
        user_id: String,
    },
    RuntimeActionFailed {
        reservation_id: Option<ReservationId>,
        lab_ref: String,
        operation: String,
        message: String,
    },
}

impl LifecycleEvent {
    /// Stable event name (matches the serialized tag).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ReservationCreated { .. } => "reservation_created",
            Self::PaymentCompleted { .. } => "payment_completed",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::ReservationActivated { .. } => "reservation_activated",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionStopped { .. } => "session_stopped",
            Self::ReservationCompleted { .. } => "reservation_completed",
            Self::ReservationCancelled { .. } => "reservation_cancelled",
            Self::ReservationExpired { .. } => "reservation_expired",
            Self::RuntimeActionFailed { .. } => "runtime_action_failed",
        }
    }
}

/// Delivery outcome for one dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationDelivery {
    pub dispatcher: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Notification future type.
pub type NotificationFuture<'a> = Pin<Box<dyn Future<Output = NotificationDelivery> + Send + 'a>>;

/// Async notification dispatcher interface.
pub trait NotificationDispatcher: Send + Sync {
    /// Dispatcher identifier used in logs and delivery records.
    fn name(&self) -> &'static str;

    fn dispatch<'a>(&'a self, event: &'a LifecycleEvent) -> NotificationFuture<'a>;
}

/// Writes every event to the tracing pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

impl NotificationDispatcher for TracingDispatcher {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn dispatch<'a>(&'a self, event: &'a LifecycleEvent) -> NotificationFuture<'a> {
        Box::pin(async move {
            let payload = serde_json::to_string(event).unwrap_or_default();
            info!(event = event.kind(), payload = %payload, "Lifecycle event");
            NotificationDelivery {
                dispatcher: self.name().to_string(),
                success: true,
                error: None,
            }
        })
    }
}

/// Fans an event out to every registered dispatcher.
#[derive(Clone, Default)]
pub struct Notifier {
    dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.dispatchers.iter().map(|d| d.name()).collect();
        f.debug_struct("Notifier").field("dispatchers", &names).finish()
    }
}

impl Notifier {
    #[must_use]
    pub fn new(dispatchers: Vec<Arc<dyn NotificationDispatcher>>) -> Self {
        Self { dispatchers }
    }

    #[must_use]
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    /// Deliver `event`; failures are logged and swallowed.
    pub async fn notify(&self, event: LifecycleEvent) -> Vec<NotificationDelivery> {
        let mut deliveries = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in &self.dispatchers {
            let delivery = dispatcher.dispatch(&event).await;
            if !delivery.success {
                warn!(
                    dispatcher = dispatcher.name(),
                    event = event.kind(),
                    error = delivery.error.as_deref().unwrap_or("unknown"),
                    "Notification delivery failed"
                );
            }
            deliveries.push(delivery);
        }
        deliveries
    }
}
