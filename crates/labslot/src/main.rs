//! labslot CLI
//!
//! Every command prints one JSON document on stdout. Failures print a JSON
//! error on stdout and remediation text on stderr, with a stable exit code:
//!
//! | code | meaning                                  |
//! |------|------------------------------------------|
//! | 0    | success                                  |
//! | 1    | internal, storage or configuration error |
//! | 2    | invalid request, conflict, wrong state   |
//! | 3    | authentication or ownership failure      |
//! | 4    | not found                                |
//! | 5    | remote service unavailable or timed out  |

mod http_runtime;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::{debug, info};

use labslot_core::config::{Config, LogFormat, RuntimeMode};
use labslot_core::engine::Engine;
use labslot_core::error::{Error, ReservationError, format_error_with_remediation};
use labslot_core::logging::init_logging;
use labslot_core::model::{Lab, ReservationStatus};
use labslot_core::runtime::{LabRuntimeClient, SimulatedLabRuntime};
use labslot_core::scheduler::ReservationRequest;
use labslot_core::storage::{ReservationFilter, Store};
use labslot_core::webhook::{SIGNATURE_HEADER, WebhookVerifier};

use crate::http_runtime::HttpLabRuntime;

#[derive(Parser)]
#[command(name = "labslot", version, about = "Reserve, pay for and run shared virtual labs")]
struct Cli {
    /// Path to labslot.toml
    #[arg(long, global = true, env = "LABSLOT_CONFIG")]
    config: Option<PathBuf>,

    /// Override storage.db_path
    #[arg(long, global = true, env = "LABSLOT_DB")]
    db: Option<PathBuf>,

    /// Override general.log_level
    #[arg(long, global = true, env = "LABSLOT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override general.log_format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the lab catalog
    Lab {
        #[command(subcommand)]
        command: LabCommand,
    },
    /// Book a lab slot
    Reserve(ReserveArgs),
    /// Show one reservation with its payments and sessions
    Show { id: i64 },
    /// List reservations
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        lab: Option<String>,
        #[arg(long, value_parser = parse_status)]
        status: Option<ReservationStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Open a checkout for a pending paid reservation
    Pay {
        id: i64,
        #[arg(long)]
        user: String,
    },
    /// Apply a payment processor notification
    Webhook {
        #[command(flatten)]
        body: BodyArgs,
        /// Value of the X-Labslot-Signature header
        #[arg(long)]
        signature: Option<String>,
    },
    /// Compute the signature header for a webhook body
    SignWebhook {
        #[command(flatten)]
        body: BodyArgs,
    },
    /// Poll the processor for a payment's status
    PaymentStatus { transaction_id: String },
    /// Start the session of an active reservation, or a manual session
    Start {
        /// Reservation id
        id: Option<i64>,
        /// Lab for a manual session
        #[arg(long, conflicts_with = "id", requires = "user")]
        lab: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// Stop the open session on a lab
    Stop { lab_ref: String },
    /// Complete an active reservation and stop its session
    Complete { id: i64 },
    /// Cancel a reservation as its owner
    Cancel {
        id: i64,
        #[arg(long)]
        user: String,
    },
    /// Cancel unpaid reservations past the grace window
    Reap {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run one maintenance pass: reap, finish due, start due
    Tick,
    /// Run maintenance passes until interrupted
    Watch {
        /// Override reaper.interval_seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List usage records
    Usage {
        #[arg(long)]
        lab: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum LabCommand {
    /// Add or update a lab
    Add {
        lab_ref: String,
        #[arg(long)]
        name: Option<String>,
        /// Hourly rate in cents; 0 makes the lab free
        #[arg(long, default_value_t = 0)]
        rate_cents: i64,
    },
    List,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with secrets redacted
    Show,
}

#[derive(Args)]
struct ReserveArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    lab: String,
    /// Start time (RFC 3339)
    #[arg(long, value_parser = parse_time, required_unless_present = "start_in", conflicts_with = "start_in")]
    start: Option<DateTime<Utc>>,
    /// Start this many minutes from now
    #[arg(long)]
    start_in: Option<i64>,
    /// End time (RFC 3339)
    #[arg(long, value_parser = parse_time, required_unless_present = "minutes", conflicts_with = "minutes")]
    end: Option<DateTime<Utc>>,
    /// Slot length in minutes
    #[arg(long)]
    minutes: Option<i64>,
}

#[derive(Args)]
struct BodyArgs {
    /// Raw request body
    #[arg(long, required_unless_present = "body_file", conflicts_with = "body_file")]
    body: Option<String>,
    /// File holding the raw request body
    #[arg(long)]
    body_file: Option<PathBuf>,
}

impl BodyArgs {
    fn read(&self) -> anyhow::Result<Vec<u8>> {
        match (&self.body, &self.body_file) {
            (Some(body), _) => Ok(body.clone().into_bytes()),
            (None, Some(path)) => std::fs::read(path)
                .with_context(|| format!("failed to read body file {}", path.display())),
            (None, None) => anyhow::bail!("either --body or --body-file is required"),
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn parse_status(value: &str) -> Result<ReservationStatus, String> {
    ReservationStatus::parse(value).ok_or_else(|| {
        format!("unknown status {value}; expected pending, active, completed or cancelled")
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(value) => {
            print_json(&value);
            ExitCode::SUCCESS
        }
        Err(err) => report_failure(&err),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<Error>() {
        Some(engine_err) => {
            let status = engine_err.http_status();
            print_json(&json!({
                "error": engine_err.to_string(),
                "status": status,
            }));
            eprintln!("{}", format_error_with_remediation(engine_err));
            ExitCode::from(exit_code_for_status(status))
        }
        None => {
            print_json(&json!({ "error": format!("{err:#}") }));
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn exit_code_for_status(status: u16) -> u8 {
    match status {
        400 | 409 | 422 => 2,
        401 | 403 => 3,
        404 => 4,
        502 | 504 => 5,
        _ => 1,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(db) = &cli.db {
        config.storage.db_path.clone_from(db);
    }
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    config.validate()?;
    Ok(config)
}

/// Open the store and the configured runtime client. The simulated runtime
/// starts from the lab states cached in the store so state carries across
/// invocations.
fn open_engine(config: &Config) -> anyhow::Result<Engine> {
    let store = Store::open(
        &config.storage.db_path,
        Duration::from_millis(config.storage.busy_timeout_ms),
    )?;
    let runtime: Arc<dyn LabRuntimeClient> = match config.runtime.mode {
        RuntimeMode::Simulated => {
            let sim = SimulatedLabRuntime::new();
            for lab in store.list_labs()? {
                sim.set_state(&lab.lab_ref, lab.runtime_state);
            }
            Arc::new(sim)
        }
        RuntimeMode::Http => {
            let base_url = config
                .runtime
                .base_url
                .as_deref()
                .context("runtime.base_url is required in http mode")?;
            Arc::new(HttpLabRuntime::new(
                base_url,
                Duration::from_secs(config.runtime.timeout_seconds),
            )?)
        }
    };
    debug!(
        db_path = %config.storage.db_path.display(),
        runtime = runtime.name(),
        "Opening engine"
    );
    Ok(Engine::builder(config.clone(), runtime).store(store).build()?)
}

async fn run(cli: Cli) -> anyhow::Result<Value> {
    let mut config = load_config(&cli)?;
    init_logging(&config.log_config())?;

    match cli.command {
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let source = cli.config.clone().or_else(Config::default_path);
            redacted_config(&config, source.as_deref())
        }
        Command::SignWebhook { body } => {
            let body = body.read()?;
            let verifier = WebhookVerifier::new(config.payments.webhook_secret.as_bytes());
            Ok(json!({
                "header": SIGNATURE_HEADER,
                "signature": verifier.signature_header(&body),
            }))
        }
        command => {
            if let Command::Watch {
                interval: Some(seconds),
            } = &command
            {
                config.reaper.interval_seconds = *seconds;
            }
            let engine = open_engine(&config)?;
            run_with_engine(command, &engine).await
        }
    }
}

fn validation(message: impl Into<String>) -> anyhow::Error {
    Error::from(ReservationError::Validation(message.into())).into()
}

async fn run_with_engine(command: Command, engine: &Engine) -> anyhow::Result<Value> {
    let ctx = engine.context();
    let value = match command {
        Command::Lab { command } => match command {
            LabCommand::Add {
                lab_ref,
                name,
                rate_cents,
            } => {
                if lab_ref.trim().is_empty() {
                    return Err(validation("lab_ref must not be empty"));
                }
                if rate_cents < 0 {
                    return Err(validation("rate_cents must not be negative"));
                }
                let name = name.unwrap_or_else(|| lab_ref.clone());
                engine
                    .store()
                    .upsert_lab(&Lab::new(lab_ref.clone(), name, rate_cents))?;
                info!(lab_ref = %lab_ref, rate_cents, "Lab saved");
                serde_json::to_value(engine.store().get_lab(&lab_ref)?)?
            }
            LabCommand::List => serde_json::to_value(engine.store().list_labs()?)?,
        },
        Command::Reserve(args) => {
            let now = engine.clock().now();
            let start_at = match (args.start, args.start_in) {
                (Some(start), _) => start,
                (None, Some(minutes)) => now + chrono::Duration::minutes(minutes),
                (None, None) => return Err(validation("either --start or --start-in is required")),
            };
            let end_at = match (args.end, args.minutes) {
                (Some(end), _) => end,
                (None, Some(minutes)) => start_at + chrono::Duration::minutes(minutes),
                (None, None) => return Err(validation("either --end or --minutes is required")),
            };
            let created = engine
                .scheduler()
                .create(
                    &ctx,
                    &ReservationRequest {
                        user_id: args.user,
                        lab_ref: args.lab,
                        start_at,
                        end_at,
                    },
                )
                .await?;
            serde_json::to_value(created)?
        }
        Command::Show { id } => {
            let reservation = engine.lifecycle().load(id)?;
            let payments = engine.store().payments_for_reservation(id)?;
            let sessions: Vec<_> = engine
                .store()
                .list_usage(Some(&reservation.lab_ref), None)?
                .into_iter()
                .filter(|usage| usage.reservation_id == Some(id))
                .collect();
            json!({
                "reservation": reservation,
                "payments": payments,
                "sessions": sessions,
            })
        }
        Command::List {
            user,
            lab,
            status,
            limit,
        } => serde_json::to_value(engine.store().list_reservations(&ReservationFilter {
            user_id: user,
            lab_ref: lab,
            status,
            limit,
        })?)?,
        Command::Pay { id, user } => {
            serde_json::to_value(engine.payments().initiate(id, &user).await?)?
        }
        Command::Webhook { body, signature } => {
            let body = body.read()?;
            let ack = engine
                .payments()
                .handle_webhook(&ctx, &body, signature.as_deref())
                .await?;
            serde_json::to_value(ack)?
        }
        Command::PaymentStatus { transaction_id } => serde_json::to_value(
            engine
                .payments()
                .refresh_status(&ctx, &transaction_id)
                .await?,
        )?,
        Command::Start { id, lab, user } => match (id, lab, user) {
            (Some(id), _, _) => {
                let reservation = engine.lifecycle().load(id)?;
                serde_json::to_value(engine.lifecycle().start_session(&ctx, &reservation).await?)?
            }
            (None, Some(lab), Some(user)) => serde_json::to_value(
                engine
                    .lifecycle()
                    .start_manual_session(&ctx, &user, &lab)
                    .await?,
            )?,
            _ => {
                return Err(validation(
                    "pass a reservation id, or --lab with --user for a manual session",
                ));
            }
        },
        Command::Stop { lab_ref } => {
            serde_json::to_value(engine.lifecycle().stop_lab(&ctx, &lab_ref).await?)?
        }
        Command::Complete { id } => {
            serde_json::to_value(engine.lifecycle().complete(&ctx, id).await?)?
        }
        Command::Cancel { id, user } => {
            serde_json::to_value(engine.lifecycle().cancel(&ctx, id, &user).await?)?
        }
        Command::Reap { dry_run, limit } => {
            serde_json::to_value(engine.reaper().sweep(dry_run, limit).await?)?
        }
        Command::Tick => serde_json::to_value(engine.run_maintenance_once().await)?,
        Command::Watch { .. } => {
            watch(engine).await;
            json!({ "stopped": true })
        }
        Command::Usage { lab, limit } => {
            serde_json::to_value(engine.store().list_usage(lab.as_deref(), limit)?)?
        }
        Command::Config { .. } | Command::SignWebhook { .. } => {
            anyhow::bail!("command does not use the engine")
        }
    };
    Ok(value)
}

async fn watch(engine: &Engine) {
    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::select! {
        () = engine.run_maintenance_loop(shutdown.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            shutdown.store(true, Ordering::Relaxed);
            if let Err(err) = result {
                tracing::warn!(error = %err, "Signal handler failed");
            }
            info!("Interrupted; stopping maintenance loop");
        }
    }
}

fn redacted_config(config: &Config, source: Option<&Path>) -> anyhow::Result<Value> {
    let mut value = serde_json::to_value(config)?;
    redact(&mut value, &["payments", "webhook_secret"]);
    redact(&mut value, &["runtime", "token"]);
    if let Some(path) = source {
        value["source"] = json!(path.display().to_string());
    }
    Ok(value)
}

fn redact(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = value;
    for key in parents {
        match cursor.get_mut(*key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(slot) = cursor.get_mut(*last) {
        let present = match slot {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        };
        if present {
            *slot = json!("[REDACTED]");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(exit_code_for_status(422), 2);
        assert_eq!(exit_code_for_status(409), 2);
        assert_eq!(exit_code_for_status(401), 3);
        assert_eq!(exit_code_for_status(403), 3);
        assert_eq!(exit_code_for_status(404), 4);
        assert_eq!(exit_code_for_status(504), 5);
        assert_eq!(exit_code_for_status(500), 1);
    }

    #[test]
    fn redaction_only_touches_present_secrets() {
        let mut config = Config::default();
        config.payments.webhook_secret = "whsec".into();
        let value = redacted_config(&config, None).unwrap();
        assert!(value.get("source").is_none());
        assert_eq!(value["payments"]["webhook_secret"], "[REDACTED]");
        assert_eq!(value["runtime"]["token"], Value::Null);
        assert_eq!(value["payments"]["currency"], "USD");
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn times_parse_as_rfc3339() {
        let t = parse_time("2030-01-01T10:00:00+02:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2030-01-01T08:00:00+00:00");
        assert!(parse_time("tomorrow").is_err());
        assert_eq!(parse_status("active").unwrap(), ReservationStatus::Active);
        assert!(parse_status("done").is_err());
    }
}
