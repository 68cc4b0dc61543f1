//! Payment initiation and processor result handling.
//!
//! A payment is created locally as `pending` before the processor is called.
//! Processor results (webhooks or status polls) are applied idempotently: the
//! payment moves to `completed` at most once, and only that transition may
//! activate the linked reservation and start its session.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ExternalError, ReservationError, Result, StorageError, WebhookError};
use crate::lifecycle::{AutoStartOutcome, LifecycleCoordinator};
use crate::model::{NewPayment, Payment, PaymentId, PaymentStatus, ReservationId, ReservationStatus};
use crate::notifications::LifecycleEvent;
use crate::runtime::RuntimeContext;
use crate::storage::{PaymentCompletion, Store};
use crate::webhook::{
    ParsedNotification, ProcessorResult, WebhookVerifier, parse_notification, payload_preview,
};

/// Service name used in errors and logs.
pub const PROCESSOR_SERVICE: &str = "payment-processor";

/// Characters of a rejected body kept in logs.
const REJECTED_PREVIEW_CHARS: usize = 64;

/// Failure code recorded when a success reports less than the expected amount.
pub const UNDERPAID_CODE: &str = "amount_mismatch";

/// Request sent to the processor to open a checkout.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub transaction_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer: String,
    pub description: String,
}

/// Processor answer to a checkout request.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorIntent {
    pub external_transaction_id: Option<String>,
    pub checkout_url: String,
    /// Verbatim processor response, kept for audit.
    pub raw: serde_json::Value,
}

/// Processor answer to a status poll.
#[derive(Debug, Clone)]
pub struct StatusCheck {
    /// `None` while the processor has no final result.
    pub result: Option<ProcessorResult>,
    pub raw: serde_json::Value,
}

/// Payment processor future type.
pub type ProcessorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outbound payment processor interface.
pub trait PaymentProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_intent<'a>(&'a self, request: &'a CheckoutRequest) -> ProcessorFuture<'a, ProcessorIntent>;

    fn check_status<'a>(&'a self, transaction_id: &'a str) -> ProcessorFuture<'a, StatusCheck>;
}

/// Redirect-style checkout: the user is sent to a hosted page whose URL
/// carries the order and an HMAC over it. The result arrives by webhook.
#[derive(Clone)]
pub struct RedirectCheckoutProcessor {
    checkout_base_url: url::Url,
    signer: WebhookVerifier,
}

impl fmt::Debug for RedirectCheckoutProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectCheckoutProcessor")
            .field("checkout_base_url", &self.checkout_base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl RedirectCheckoutProcessor {
    pub fn new(checkout_base_url: &str, signer: WebhookVerifier) -> Result<Self> {
        let checkout_base_url = url::Url::parse(checkout_base_url).map_err(|e| {
            crate::error::ConfigError::ValidationError(format!(
                "payments.checkout_base_url is not a valid URL: {e}"
            ))
        })?;
        Ok(Self {
            checkout_base_url,
            signer,
        })
    }

    /// Material covered by the URL signature.
    fn signing_material(request: &CheckoutRequest) -> String {
        format!(
            "{}:{}:{}",
            request.transaction_id, request.amount_cents, request.currency
        )
    }
}

impl PaymentProcessor for RedirectCheckoutProcessor {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn create_intent<'a>(&'a self, request: &'a CheckoutRequest) -> ProcessorFuture<'a, ProcessorIntent> {
        Box::pin(async move {
            let signature = self
                .signer
                .sign(Self::signing_material(request).as_bytes());
            let mut url = self.checkout_base_url.clone();
            url.query_pairs_mut()
                .append_pair("transaction_id", &request.transaction_id)
                .append_pair("amount_cents", &request.amount_cents.to_string())
                .append_pair("currency", &request.currency)
                .append_pair("description", &request.description)
                .append_pair("signature", &signature);
            let checkout_url = url.to_string();
            Ok(ProcessorIntent {
                external_transaction_id: None,
                raw: serde_json::json!({
                    "processor": "redirect",
                    "checkout_url": checkout_url,
                }),
                checkout_url,
            })
        })
    }

    fn check_status<'a>(&'a self, transaction_id: &'a str) -> ProcessorFuture<'a, StatusCheck> {
        Box::pin(async move {
            Ok(StatusCheck {
                result: None,
                raw: serde_json::json!({
                    "processor": "redirect",
                    "transaction_id": transaction_id,
                    "status": "unknown",
                    "detail": "redirect checkout reports results by webhook only",
                }),
            })
        })
    }
}

/// Returned by [`PaymentGateway::initiate`].
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub payment_id: PaymentId,
    pub reservation_id: ReservationId,
    pub transaction_id: String,
    pub external_transaction_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub checkout_url: String,
}

/// Effect of one processor result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Completed {
        payment_id: PaymentId,
        reservation_id: Option<ReservationId>,
        /// True when this result moved the reservation to `active`.
        activated: bool,
        /// Session start triggered by the activation, if any.
        session: Option<AutoStartOutcome>,
    },
    /// Already completed: acknowledged without side effects.
    Duplicate { payment_id: PaymentId },
    /// Captured after another payment of the same reservation completed.
    /// The payment is cancelled and needs a refund.
    Superseded {
        payment_id: PaymentId,
        reservation_id: Option<ReservationId>,
    },
    Failed {
        payment_id: PaymentId,
        code: String,
        message: String,
    },
    /// Result did not apply to the current payment status.
    Ignored {
        payment_id: PaymentId,
        status: PaymentStatus,
    },
}

/// Acknowledgement for a durably recorded webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub status_code: u16,
    pub transaction_id: String,
    pub outcome: WebhookOutcome,
}

/// Returned by [`PaymentGateway::refresh_status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusRefresh {
    pub payment: Payment,
    /// `None` while the processor has no final result.
    pub outcome: Option<WebhookOutcome>,
}

/// Settings for [`PaymentGateway`].
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub currency: String,
    pub processor_timeout: Duration,
}

/// Adapter between the reservation lifecycle and a payment processor.
#[derive(Clone)]
pub struct PaymentGateway {
    lifecycle: LifecycleCoordinator,
    processor: Arc<dyn PaymentProcessor>,
    verifier: WebhookVerifier,
    settings: PaymentSettings,
}

impl fmt::Debug for PaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentGateway")
            .field("processor", &self.processor.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PaymentGateway {
    #[must_use]
    pub fn new(
        lifecycle: LifecycleCoordinator,
        processor: Arc<dyn PaymentProcessor>,
        verifier: WebhookVerifier,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            lifecycle,
            processor,
            verifier,
            settings,
        }
    }

    #[must_use]
    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    fn store(&self) -> &Store {
        self.lifecycle.store()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.lifecycle.now()
    }

    /// Open a checkout for a pending, unpaid, non-free reservation.
    pub async fn initiate(
        &self,
        reservation_id: ReservationId,
        customer: &str,
    ) -> Result<PaymentIntent> {
        let reservation = self.lifecycle.load(reservation_id)?;
        if reservation.user_id != customer {
            return Err(ReservationError::NotOwner {
                id: reservation_id,
                user_id: customer.to_string(),
            }
            .into());
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(ReservationError::Validation(format!(
                "reservation {reservation_id} is {}, only pending reservations can be paid",
                reservation.status
            ))
            .into());
        }
        if reservation.is_free() {
            return Err(ReservationError::Validation(format!(
                "reservation {reservation_id} is free and needs no payment"
            ))
            .into());
        }
        if self.store().has_completed_payment(reservation_id)? {
            return Err(ReservationError::Validation(format!(
                "reservation {reservation_id} is already paid"
            ))
            .into());
        }

        let transaction_id = format!("lab-{reservation_id}-{}", uuid::Uuid::new_v4().simple());
        let payment = self.store().insert_payment(&NewPayment {
            reservation_id: Some(reservation_id),
            user_id: customer.to_string(),
            transaction_id: transaction_id.clone(),
            amount_cents: reservation.estimated_cost_cents,
            currency: self.settings.currency.clone(),
            created_at: self.now(),
        })?;
        let request = CheckoutRequest {
            transaction_id: transaction_id.clone(),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            customer: customer.to_string(),
            description: format!(
                "Lab {} from {} to {}",
                reservation.lab_ref,
                reservation.start_at.to_rfc3339(),
                reservation.end_at.to_rfc3339()
            ),
        };

        let intent = match self
            .with_timeout("create_intent", self.processor.create_intent(&request))
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                let now = self.now();
                self.store().fail_payment(payment.id, now)?;
                self.store().append_payment_payload(
                    payment.id,
                    "errors",
                    serde_json::json!({
                        "at": now.to_rfc3339(),
                        "operation": "create_intent",
                        "error": err.to_string(),
                    }),
                    now,
                )?;
                warn!(
                    payment_id = payment.id,
                    transaction_id = %transaction_id,
                    error = %err,
                    "Payment initiation failed"
                );
                return Err(err);
            }
        };

        let now = self.now();
        self.store()
            .append_payment_payload(payment.id, "intent", intent.raw.clone(), now)?;
        if let Some(external) = &intent.external_transaction_id {
            self.store()
                .set_external_transaction_id(payment.id, external, now)?;
        }
        info!(
            payment_id = payment.id,
            reservation_id,
            transaction_id = %transaction_id,
            amount_cents = payment.amount_cents,
            "Payment initiated"
        );
        Ok(PaymentIntent {
            payment_id: payment.id,
            reservation_id,
            transaction_id,
            external_transaction_id: intent.external_transaction_id,
            amount_cents: payment.amount_cents,
            currency: payment.currency,
            checkout_url: intent.checkout_url,
        })
    }

    /// Authenticate, parse, correlate and apply one webhook delivery.
    pub async fn handle_webhook(
        &self,
        ctx: &RuntimeContext,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck> {
        if let Err(err) = self.verifier.verify(body, signature) {
            warn!(
                error = %err,
                payload_prefix = %payload_preview(body, REJECTED_PREVIEW_CHARS),
                "Webhook rejected"
            );
            return Err(err);
        }

        let ParsedNotification { result, raw } = match parse_notification(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    error = %err,
                    payload_prefix = %payload_preview(body, REJECTED_PREVIEW_CHARS),
                    "Webhook body could not be parsed"
                );
                return Err(err);
            }
        };

        let payment = self.correlate(&result)?;
        let now = self.now();
        self.store()
            .append_payment_payload(payment.id, "webhooks", raw, now)?;
        if let Some(external) = result.external_transaction_id() {
            if external != payment.transaction_id {
                self.store()
                    .set_external_transaction_id(payment.id, external, now)?;
            }
        }

        let outcome = self.apply_result(ctx, &payment, &result).await?;
        Ok(WebhookAck {
            status_code: 200,
            transaction_id: payment.transaction_id,
            outcome,
        })
    }

    /// Poll the processor for a payment's status and apply any final result.
    pub async fn refresh_status(
        &self,
        ctx: &RuntimeContext,
        transaction_id: &str,
    ) -> Result<StatusRefresh> {
        let payment = self
            .store()
            .find_payment_by_transaction(transaction_id)?
            .ok_or_else(|| WebhookError::UnknownTransaction(transaction_id.to_string()))?;

        let check = self
            .with_timeout(
                "check_status",
                self.processor.check_status(&payment.transaction_id),
            )
            .await?;
        self.store()
            .append_payment_payload(payment.id, "status_checks", check.raw, self.now())?;

        let outcome = match &check.result {
            Some(result) => Some(self.apply_result(ctx, &payment, result).await?),
            None => None,
        };
        let payment = self
            .store()
            .get_payment(payment.id)?
            .ok_or_else(|| StorageError::NotFound(format!("payment {}", payment.id)))?;
        Ok(StatusRefresh { payment, outcome })
    }

    fn correlate(&self, result: &ProcessorResult) -> Result<Payment> {
        if let Some(payment) = self
            .store()
            .find_payment_by_transaction(result.transaction_id())?
        {
            return Ok(payment);
        }
        if let Some(external) = result.external_transaction_id() {
            if let Some(payment) = self.store().find_payment_by_transaction(external)? {
                return Ok(payment);
            }
        }
        warn!(
            transaction_id = %result.transaction_id(),
            "Webhook for unknown transaction"
        );
        Err(WebhookError::UnknownTransaction(result.transaction_id().to_string()).into())
    }

    async fn apply_result(
        &self,
        ctx: &RuntimeContext,
        payment: &Payment,
        result: &ProcessorResult,
    ) -> Result<WebhookOutcome> {
        match result {
            ProcessorResult::Success { amount_cents, .. } => {
                if let Some(reported) = *amount_cents {
                    if reported != payment.amount_cents {
                        warn!(
                            payment_id = payment.id,
                            expected = payment.amount_cents,
                            reported,
                            "Processor reported a different amount"
                        );
                        self.store().append_payment_payload(
                            payment.id,
                            "errors",
                            serde_json::json!({
                                "at": self.now().to_rfc3339(),
                                "error": "amount mismatch",
                                "expected_cents": payment.amount_cents,
                                "reported_cents": reported,
                            }),
                            self.now(),
                        )?;
                    }
                    if reported < payment.amount_cents {
                        // an underpaid capture never activates the reservation
                        return self
                            .apply_failure(
                                payment,
                                UNDERPAID_CODE,
                                &format!(
                                    "paid {reported} cents of {} expected",
                                    payment.amount_cents
                                ),
                            )
                            .await;
                    }
                }
                self.apply_success(ctx, payment.id).await
            }
            ProcessorResult::Failure { code, message, .. } => {
                self.apply_failure(payment, code, message).await
            }
        }
    }

    async fn apply_failure(
        &self,
        payment: &Payment,
        code: &str,
        message: &str,
    ) -> Result<WebhookOutcome> {
        if self.store().fail_payment(payment.id, self.now())? {
            info!(
                payment_id = payment.id,
                transaction_id = %payment.transaction_id,
                code = %code,
                "Payment failed"
            );
            self.lifecycle
                .notifier()
                .notify(LifecycleEvent::PaymentFailed {
                    payment_id: payment.id,
                    reservation_id: payment.reservation_id,
                    transaction_id: payment.transaction_id.clone(),
                    reason: message.to_string(),
                })
                .await;
            return Ok(WebhookOutcome::Failed {
                payment_id: payment.id,
                code: code.to_string(),
                message: message.to_string(),
            });
        }
        let status = self
            .store()
            .get_payment(payment.id)?
            .map_or(payment.status, |p| p.status);
        info!(
            payment_id = payment.id,
            status = %status,
            "Failure notification ignored for non-pending payment"
        );
        Ok(WebhookOutcome::Ignored {
            payment_id: payment.id,
            status,
        })
    }

    async fn apply_success(&self, ctx: &RuntimeContext, payment_id: PaymentId) -> Result<WebhookOutcome> {
        let (payment, reservation, activated) =
            match self.store().complete_payment(payment_id, self.now())? {
                PaymentCompletion::AlreadyCompleted(payment) => {
                    info!(
                        payment_id,
                        transaction_id = %payment.transaction_id,
                        "Duplicate payment result acknowledged"
                    );
                    return Ok(WebhookOutcome::Duplicate { payment_id });
                }
                PaymentCompletion::Superseded(payment) => {
                    warn!(
                        payment_id,
                        transaction_id = %payment.transaction_id,
                        reservation_id = ?payment.reservation_id,
                        "Reservation already paid by another payment; refund required"
                    );
                    self.store().append_payment_payload(
                        payment_id,
                        "errors",
                        serde_json::json!({
                            "at": self.now().to_rfc3339(),
                            "error": "superseded by another completed payment; refund required",
                        }),
                        self.now(),
                    )?;
                    return Ok(WebhookOutcome::Superseded {
                        payment_id,
                        reservation_id: payment.reservation_id,
                    });
                }
                PaymentCompletion::Completed {
                    payment,
                    reservation,
                    activated,
                } => (payment, reservation, activated),
            };

        info!(
            payment_id,
            transaction_id = %payment.transaction_id,
            reservation_id = ?payment.reservation_id,
            activated,
            "Payment completed"
        );
        let notifier = self.lifecycle.notifier();
        notifier
            .notify(LifecycleEvent::PaymentCompleted {
                payment_id,
                reservation_id: payment.reservation_id,
                transaction_id: payment.transaction_id.clone(),
            })
            .await;

        if let Some(reservation) = &reservation {
            if !activated && reservation.status == ReservationStatus::Cancelled {
                warn!(
                    payment_id,
                    reservation_id = reservation.id,
                    "Payment completed for a cancelled reservation; refund required"
                );
            }
        }

        let session = match reservation.filter(|_| activated) {
            Some(reservation) => {
                notifier
                    .notify(LifecycleEvent::ReservationActivated {
                        reservation_id: reservation.id,
                    })
                    .await;
                Some(self.lifecycle.auto_start(ctx, &reservation).await?)
            }
            None => None,
        };

        Ok(WebhookOutcome::Completed {
            payment_id,
            reservation_id: payment.reservation_id,
            activated,
            session,
        })
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        future: ProcessorFuture<'_, T>,
    ) -> Result<T> {
        let timeout = self.settings.processor_timeout;
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout {
                service: PROCESSOR_SERVICE.to_string(),
                operation: operation.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()),
        }
    }
}
