//! Wiring for the reservation, payment and session services.
//!
//! An [`Engine`] owns one store, one clock and one lab runtime gateway and
//! hands out the services built on them. The maintenance loop runs the
//! periodic passes: expiry sweep, due completions, due starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::{FinishDueReport, LifecycleCoordinator, StartDueReport};
use crate::notifications::{NotificationDispatcher, Notifier, TracingDispatcher};
use crate::payment::{PaymentGateway, PaymentProcessor, PaymentSettings, RedirectCheckoutProcessor};
use crate::reaper::{ExpiryReaper, ReaperSettings, SweepReport};
use crate::runtime::{LabRuntimeClient, RuntimeContext, RuntimeCredentials, RuntimeGateway};
use crate::scheduler::ReservationScheduler;
use crate::storage::Store;
use crate::webhook::WebhookVerifier;

/// One maintenance pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub reaped: SweepReport,
    pub finished: FinishDueReport,
    pub started: StartDueReport,
}

impl MaintenanceReport {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.reaped.count == 0
            && self.finished.completed.is_empty()
            && self.started.started.is_empty()
            && self.started.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Store,
    clock: Arc<dyn Clock>,
    credentials: RuntimeCredentials,
    lifecycle: LifecycleCoordinator,
    scheduler: ReservationScheduler,
    payments: PaymentGateway,
    reaper: ExpiryReaper,
    maintenance_interval: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("lifecycle", &self.lifecycle)
            .field("payments", &self.payments)
            .field("reaper", &self.reaper)
            .field("maintenance_interval", &self.maintenance_interval)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`]; everything but the runtime client has a default
/// derived from [`Config`].
pub struct EngineBuilder {
    config: Config,
    runtime: Arc<dyn LabRuntimeClient>,
    store: Option<Store>,
    clock: Option<Arc<dyn Clock>>,
    processor: Option<Arc<dyn PaymentProcessor>>,
    dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: Config, runtime: Arc<dyn LabRuntimeClient>) -> Self {
        Self {
            config,
            runtime,
            store: None,
            clock: None,
            processor: None,
            dispatchers: Vec::new(),
        }
    }

    /// Use an already opened store instead of `storage.db_path`.
    #[must_use]
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the redirect checkout processor.
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Add a dispatcher next to the tracing one.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Store::open(
                &config.storage.db_path,
                Duration::from_millis(config.storage.busy_timeout_ms),
            )?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let credentials = RuntimeCredentials::new(config.runtime.token.clone());
        let runtime = RuntimeGateway::new(
            self.runtime,
            credentials.clone(),
            Duration::from_secs(config.runtime.timeout_seconds),
        );

        let mut dispatchers: Vec<Arc<dyn NotificationDispatcher>> =
            vec![Arc::new(TracingDispatcher)];
        dispatchers.extend(self.dispatchers);
        let notifier = Notifier::new(dispatchers);

        let lifecycle = LifecycleCoordinator::new(
            store.clone(),
            clock.clone(),
            runtime,
            notifier.clone(),
            chrono::Duration::minutes(config.scheduler.lookahead_minutes),
        );

        let verifier = WebhookVerifier::new(config.payments.webhook_secret.as_bytes());
        if config.payments.webhook_secret.is_empty() {
            warn!("payments.webhook_secret is empty; webhook signatures are trivially forgeable");
        }
        let processor: Arc<dyn PaymentProcessor> = match self.processor {
            Some(processor) => processor,
            None => Arc::new(RedirectCheckoutProcessor::new(
                &config.payments.checkout_base_url,
                verifier.clone(),
            )?),
        };
        let payments = PaymentGateway::new(
            lifecycle.clone(),
            processor,
            verifier,
            PaymentSettings {
                currency: config.payments.currency.clone(),
                processor_timeout: Duration::from_secs(config.payments.processor_timeout_seconds),
            },
        );

        let reaper = ExpiryReaper::new(
            store.clone(),
            clock.clone(),
            notifier,
            ReaperSettings {
                grace: chrono::Duration::minutes(config.reaper.grace_minutes),
                batch_limit: config.reaper_batch_limit(),
            },
        );

        debug!(
            runtime_mode = %config.runtime.mode,
            lookahead_minutes = config.scheduler.lookahead_minutes,
            grace_minutes = config.reaper.grace_minutes,
            "Engine built"
        );
        Ok(Engine {
            store,
            clock,
            credentials,
            scheduler: ReservationScheduler::new(lifecycle.clone()),
            lifecycle,
            payments,
            reaper,
            maintenance_interval: Duration::from_secs(config.reaper.interval_seconds),
        })
    }
}

impl Engine {
    #[must_use]
    pub fn builder(config: Config, runtime: Arc<dyn LabRuntimeClient>) -> EngineBuilder {
        EngineBuilder::new(config, runtime)
    }

    /// Engine with every default from `config`.
    pub fn from_config(config: Config, runtime: Arc<dyn LabRuntimeClient>) -> Result<Self> {
        EngineBuilder::new(config, runtime).build()
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    #[must_use]
    pub fn scheduler(&self) -> &ReservationScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn payments(&self) -> &PaymentGateway {
        &self.payments
    }

    #[must_use]
    pub fn reaper(&self) -> &ExpiryReaper {
        &self.reaper
    }

    /// Fresh context for a batch of runtime calls.
    #[must_use]
    pub fn context(&self) -> RuntimeContext {
        RuntimeContext::new(self.credentials.clone())
    }

    /// Run the expiry sweep, then finish ended reservations, then start due
    /// ones. A failing pass is logged and the remaining passes still run.
    pub async fn run_maintenance_once(&self) -> MaintenanceReport {
        let ctx = self.context();
        let mut report = MaintenanceReport::default();

        match self.reaper.sweep(false, None).await {
            Ok(sweep) => report.reaped = sweep,
            Err(err) => warn!(error = %err, "Expiry sweep failed"),
        }
        match self.lifecycle.finish_due(&ctx, None).await {
            Ok(finished) => report.finished = finished,
            Err(err) => warn!(error = %err, "Finishing due reservations failed"),
        }
        match self.lifecycle.start_due(&ctx, None).await {
            Ok(started) => report.started = started,
            Err(err) => warn!(error = %err, "Starting due reservations failed"),
        }
        report
    }

    /// Periodic maintenance until `shutdown` is set. An interval of zero
    /// disables the loop.
    pub async fn run_maintenance_loop(&self, shutdown: Arc<AtomicBool>) {
        if self.maintenance_interval.is_zero() {
            info!("Maintenance loop disabled (reaper.interval_seconds = 0)");
            return;
        }
        info!(
            interval_secs = self.maintenance_interval.as_secs(),
            "Maintenance loop started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Maintenance loop shutting down");
                break;
            }

            let report = self.run_maintenance_once().await;
            if report.is_idle() {
                debug!("Maintenance pass: nothing to do");
            } else {
                info!(
                    reaped = report.reaped.count,
                    completed = report.finished.completed.len(),
                    started = report.started.started.len(),
                    start_failures = report.started.failed.len(),
                    "Maintenance pass finished"
                );
            }

            tokio::time::sleep(self.maintenance_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::clock::ManualClock;
    use crate::model::{Lab, ReservationStatus};
    use crate::runtime::SimulatedLabRuntime;
    use crate::scheduler::ReservationRequest;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Store::open_in_memory().unwrap();
        store.upsert_lab(&Lab::new("FREE", "Free lab", 0)).unwrap();
        store.upsert_lab(&Lab::new("PAID", "Paid lab", 600)).unwrap();
        let engine = Engine::builder(Config::default(), Arc::new(SimulatedLabRuntime::new()))
            .store(store)
            .clock(clock.clone())
            .build()
            .unwrap();
        (engine, clock)
    }

    fn request(lab: &str, start_min: i64, end_min: i64) -> ReservationRequest {
        ReservationRequest {
            user_id: "alice".into(),
            lab_ref: lab.into(),
            start_at: t0() + chrono::Duration::minutes(start_min),
            end_at: t0() + chrono::Duration::minutes(end_min),
        }
    }

    #[tokio::test]
    async fn maintenance_pass_reaps_finishes_and_starts() {
        let (engine, clock) = engine();
        let ctx = engine.context();
        let unpaid = engine
            .scheduler()
            .create(&ctx, &request("PAID", 60, 120))
            .await
            .unwrap()
            .reservation;
        let running = engine
            .scheduler()
            .create(&ctx, &request("FREE", 5, 30))
            .await
            .unwrap();
        assert!(running.auto_start.is_started());
        let later = engine
            .scheduler()
            .create(&ctx, &request("FREE", 40, 60))
            .await
            .unwrap()
            .reservation;

        clock.advance(chrono::Duration::minutes(30));
        let report = engine.run_maintenance_once().await;
        assert_eq!(report.reaped.ids, vec![unpaid.id]);
        assert_eq!(report.finished.completed, vec![running.reservation.id]);
        assert_eq!(report.started.started, vec![later.id]);
        assert!(!report.is_idle());

        let store = engine.store();
        assert_eq!(
            store.get_reservation(unpaid.id).unwrap().unwrap().status,
            ReservationStatus::Cancelled
        );
        assert_eq!(
            store.get_reservation(later.id).unwrap().unwrap().status,
            ReservationStatus::Active
        );
        assert!(engine.run_maintenance_once().await.is_idle());
    }

    #[tokio::test]
    async fn zero_interval_disables_loop() {
        let mut config = Config::default();
        config.reaper.interval_seconds = 0;
        let engine = Engine::builder(config, Arc::new(SimulatedLabRuntime::new()))
            .store(Store::open_in_memory().unwrap())
            .build()
            .unwrap();
        engine
            .run_maintenance_loop(Arc::new(AtomicBool::new(false)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let (engine, _clock) = engine();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run_maintenance_loop(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(400)).await;
        handle.await.unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.reaper.grace_minutes = 0;
        let err = Engine::builder(config, Arc::new(SimulatedLabRuntime::new()))
            .store(Store::open_in_memory().unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
