//! labslot-core: Core library for labslot
//!
//! This crate provides the reservation, payment and session lifecycle engine
//! behind the `labslot` CLI: users book time slots on shared virtual labs,
//! pay for them through an external processor, and the engine starts and
//! stops the lab runtime around each slot.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──► Store (SQLite) ◄── Payment gateway ◄── Webhooks
//!     │              ▲                   │
//!     └──► Lifecycle coordinator ◄───────┘
//!                │          ▲
//!                ▼          │
//!          Lab runtime   Expiry reaper
//! ```
//!
//! # Modules
//!
//! - `model`: Labs, reservations, payments and usage records
//! - `storage`: SQLite persistence with atomic conditional updates
//! - `conflict`: Half-open interval overlap checks
//! - `scheduler`: Reservation creation
//! - `lifecycle`: Reservation state machine and session control
//! - `runtime`: Lab runtime client interface and simulator
//! - `payment`: Payment initiation and processor result handling
//! - `webhook`: Webhook signatures and payload parsing
//! - `reaper`: Expiry of unpaid reservations
//! - `notifications`: Lifecycle event fan-out
//! - `engine`: Service wiring and the maintenance loop
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `clock`: Injectable time source
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod notifications;
pub mod payment;
pub mod reaper;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod webhook;

pub use error::{Error, Result};

/// Version of the labslot-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
