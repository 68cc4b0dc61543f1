//! Shared test infrastructure for labslot-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use labslot_core::clock::ManualClock;
use labslot_core::config::Config;
use labslot_core::engine::Engine;
use labslot_core::error::{ExternalError, Result};
use labslot_core::model::Lab;
use labslot_core::payment::{
    CheckoutRequest, PaymentProcessor, ProcessorFuture, ProcessorIntent, StatusCheck,
};
use labslot_core::runtime::SimulatedLabRuntime;
use labslot_core::scheduler::ReservationRequest;
use labslot_core::storage::Store;
use labslot_core::webhook::ProcessorResult;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Fixed test epoch.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.payments.webhook_secret = WEBHOOK_SECRET.to_string();
    config
}

/// Engine over a manual clock and the simulated runtime.
pub struct TestEngine {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub sim: SimulatedLabRuntime,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_store(Store::open_in_memory().unwrap(), None)
    }

    pub fn with_processor(processor: Arc<dyn PaymentProcessor>) -> Self {
        Self::with_store(Store::open_in_memory().unwrap(), Some(processor))
    }

    pub fn with_store(store: Store, processor: Option<Arc<dyn PaymentProcessor>>) -> Self {
        store.upsert_lab(&Lab::new("L1", "Free lab", 0)).unwrap();
        store.upsert_lab(&Lab::new("P1", "Paid lab", 1200)).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let sim = SimulatedLabRuntime::new();
        let mut builder = Engine::builder(test_config(), Arc::new(sim.clone()))
            .store(store)
            .clock(clock.clone());
        if let Some(processor) = processor {
            builder = builder.processor(processor);
        }
        Self {
            engine: builder.build().unwrap(),
            clock,
            sim,
        }
    }

    pub fn signature(&self, body: &str) -> String {
        self.engine
            .payments()
            .verifier()
            .signature_header(body.as_bytes())
    }
}

pub fn request(lab_ref: &str, start_min: i64, end_min: i64) -> ReservationRequest {
    ReservationRequest {
        user_id: "alice".to_string(),
        lab_ref: lab_ref.to_string(),
        start_at: t0() + Duration::minutes(start_min),
        end_at: t0() + Duration::minutes(end_min),
    }
}

pub fn paid_webhook(transaction_id: &str) -> String {
    format!(r#"{{"transaction_id":"{transaction_id}","status":"paid"}}"#)
}

/// Processor whose answers are set by the test.
#[derive(Default)]
pub struct ScriptedProcessor {
    pub fail_create: bool,
    status: Mutex<Option<ProcessorResult>>,
    pub status_calls: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn set_status(&self, result: Option<ProcessorResult>) {
        *self.status.lock().unwrap() = result;
    }
}

impl PaymentProcessor for ScriptedProcessor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create_intent<'a>(
        &'a self,
        request: &'a CheckoutRequest,
    ) -> ProcessorFuture<'a, ProcessorIntent> {
        Box::pin(async move {
            if self.fail_create {
                return Err(ExternalError::Unavailable {
                    service: "payment-processor".to_string(),
                    message: "connection refused".to_string(),
                }
                .into());
            }
            Ok(ProcessorIntent {
                external_transaction_id: Some(format!("ext-{}", request.transaction_id)),
                checkout_url: format!("https://pay.test/{}", request.transaction_id),
                raw: serde_json::json!({ "id": format!("ext-{}", request.transaction_id) }),
            })
        })
    }

    fn check_status<'a>(&'a self, transaction_id: &'a str) -> ProcessorFuture<'a, StatusCheck> {
        Box::pin(async move {
            self.status_calls
                .lock()
                .unwrap()
                .push(transaction_id.to_string());
            let result = self.status.lock().unwrap().clone();
            let result: Result<StatusCheck> = Ok(StatusCheck {
                raw: serde_json::json!({
                    "transaction_id": transaction_id,
                    "final": result.is_some(),
                }),
                result,
            });
            result
        })
    }
}
