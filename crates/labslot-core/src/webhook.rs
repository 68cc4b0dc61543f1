//! Payment webhook authentication and payload parsing.
//!
//! Deliveries are authenticated with HMAC-SHA256 over the raw body before any
//! parsing happens. The header carries lowercase hex, optionally prefixed with
//! `sha256=`.

use std::collections::HashMap;

use serde::Serialize;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, WebhookError};

/// Header that carries the delivery signature.
pub const SIGNATURE_HEADER: &str = "X-Labslot-Signature";

/// Result codes the processor uses for a successful charge.
const SUCCESS_CODES: &[&str] = &["0", "00", "success", "succeeded", "paid", "completed", "ok"];

const TRANSACTION_KEYS: &[&str] = &["transaction_id", "merchant_transaction_id", "order_id"];
const EXTERNAL_KEYS: &[&str] = &["external_transaction_id", "processor_transaction_id", "payment_id"];
const CODE_KEYS: &[&str] = &["status", "result_code", "code"];
const MESSAGE_KEYS: &[&str] = &["message", "error", "reason"];
const AMOUNT_KEYS: &[&str] = &["amount_cents", "amount"];

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies webhook bodies with a shared secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    mac: HmacSha256,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl WebhookVerifier {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mac =
            HmacSha256::new_from_slice(secret.as_ref()).expect("HMAC accepts any key length");
        Self { mac }
    }

    /// Lowercase hex HMAC of `body`.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        hex::encode(self.mac.clone().chain_update(body).finalize().into_bytes())
    }

    /// Header value in `sha256=<hex>` form.
    #[must_use]
    pub fn signature_header(&self, body: &[u8]) -> String {
        format!("sha256={}", self.sign(body))
    }

    /// Check `header` against `body`. An absent or blank header is
    /// `MissingSignature`; anything else that does not match is
    /// `InvalidSignature`.
    pub fn verify(&self, body: &[u8], header: Option<&str>) -> Result<()> {
        let header = header.map(str::trim).filter(|h| !h.is_empty());
        let Some(header) = header else {
            return Err(WebhookError::MissingSignature.into());
        };
        let provided_hex = header.strip_prefix("sha256=").unwrap_or(header);
        let Ok(provided) = hex::decode(provided_hex) else {
            return Err(WebhookError::InvalidSignature.into());
        };
        // verify_slice compares in constant time
        self.mac
            .clone()
            .chain_update(body)
            .verify_slice(&provided)
            .map_err(|_| WebhookError::InvalidSignature.into())
    }
}

/// First `max` characters of a payload, for rejection logs.
#[must_use]
pub fn payload_preview(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let mut preview: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        preview.push_str("...");
    }
    preview
}

/// Normalized processor outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessorResult {
    Success {
        transaction_id: String,
        external_transaction_id: Option<String>,
        amount_cents: Option<i64>,
    },
    Failure {
        transaction_id: String,
        external_transaction_id: Option<String>,
        code: String,
        message: String,
    },
}

impl ProcessorResult {
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Success { transaction_id, .. } | Self::Failure { transaction_id, .. } => {
                transaction_id
            }
        }
    }

    #[must_use]
    pub fn external_transaction_id(&self) -> Option<&str> {
        match self {
            Self::Success {
                external_transaction_id,
                ..
            }
            | Self::Failure {
                external_transaction_id,
                ..
            } => external_transaction_id.as_deref(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Parsed notification: the normalized result plus the body kept verbatim
/// for the audit trail. JSON bodies are stored as received; form bodies as
/// `{"content_type", "body"}` with the undecoded text.
#[derive(Debug, Clone)]
pub struct ParsedNotification {
    pub result: ProcessorResult,
    pub raw: serde_json::Value,
}

/// Parse a JSON object or form-encoded body.
pub fn parse_notification(body: &[u8]) -> Result<ParsedNotification> {
    let (fields, raw) = decode_fields(body)?;

    let transaction_id = first_field(&fields, TRANSACTION_KEYS);
    let external_transaction_id = first_field(&fields, EXTERNAL_KEYS);
    let transaction_id = match (transaction_id, &external_transaction_id) {
        (Some(tx), _) => tx,
        (None, Some(external)) => external.clone(),
        (None, None) => {
            return Err(WebhookError::MalformedPayload(
                "missing transaction identifier".to_string(),
            )
            .into());
        }
    };
    let code = first_field(&fields, CODE_KEYS).ok_or_else(|| {
        WebhookError::MalformedPayload("missing status or result code".to_string())
    })?;

    let result = if is_success_code(&code) {
        let amount_cents = match first_field(&fields, AMOUNT_KEYS) {
            Some(amount) => Some(amount.parse::<i64>().map_err(|_| {
                WebhookError::MalformedPayload(format!("amount is not an integer: {amount}"))
            })?),
            None => None,
        };
        ProcessorResult::Success {
            transaction_id,
            external_transaction_id,
            amount_cents,
        }
    } else {
        ProcessorResult::Failure {
            transaction_id,
            external_transaction_id,
            message: first_field(&fields, MESSAGE_KEYS).unwrap_or_else(|| code.clone()),
            code,
        }
    };
    Ok(ParsedNotification { result, raw })
}

fn is_success_code(code: &str) -> bool {
    let code = code.trim().to_ascii_lowercase();
    SUCCESS_CODES.contains(&code.as_str())
}

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Flattened lookup fields plus the verbatim audit value.
fn decode_fields(body: &[u8]) -> Result<(HashMap<String, String>, serde_json::Value)> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WebhookError::MalformedPayload("body is not UTF-8".to_string()))?;
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(WebhookError::MalformedPayload("empty body".to_string()).into());
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| WebhookError::MalformedPayload(format!("invalid JSON: {e}")))?;
        let serde_json::Value::Object(map) = &value else {
            return Err(
                WebhookError::MalformedPayload("JSON body is not an object".to_string()).into(),
            );
        };
        let mut fields = HashMap::with_capacity(map.len());
        for (key, field) in map {
            let text = match field {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            fields.insert(key.clone(), text);
        }
        return Ok((fields, value));
    }

    if !trimmed.contains('=') {
        return Err(WebhookError::MalformedPayload(
            "body is neither JSON nor form-encoded".to_string(),
        )
        .into());
    }
    let fields = url::form_urlencoded::parse(trimmed.as_bytes())
        .into_owned()
        .collect();
    let raw = serde_json::json!({
        "content_type": FORM_CONTENT_TYPE,
        "body": text,
    });
    Ok((fields, raw))
}

fn first_field(fields: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}
