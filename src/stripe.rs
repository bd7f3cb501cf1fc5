//! Payment processor integration.
//!
//! A [`PaymentProcessor`] creates payment intents; the wire types and
//! signature scheme follow Stripe so the real client is a thin form POST.
//! [`MockProcessor`] stands in for local development and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{PaymentState, PaymentStatus},
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_CURRENCY: &str = "usd";
/// Maximum age of a signed webhook before it is rejected as stale.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Course prices are decimal currency; the processor wants integer minor
/// units. Halves round away from zero.
pub fn to_minor_units(price: Decimal) -> Result<i64> {
    (price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| AppError::internal("price out of range for minor units"))
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[derive(Debug, Clone, Copy)]
pub struct IntentMetadata {
    pub enrollment_id: Uuid,
    pub user_id: Uuid,
}

/// Processor response for a created intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<PaymentIntent>;
}

pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
        }
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<PaymentIntent> {
        let params = [
            ("amount", amount_cents.to_string()),
            ("currency", currency.to_string()),
            ("metadata[enrollment_id]", metadata.enrollment_id.to_string()),
            ("metadata[user_id]", metadata.user_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let res = self
            .http
            .post(format!("{API_BASE}/payment_intents"))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&params)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "payment intent creation rejected");
            return Err(AppError::internal("payment processor rejected the request"));
        }

        Ok(res.json().await?)
    }
}

/// In-process processor that records every intent it hands out.
#[derive(Default)]
pub struct MockProcessor {
    created: Mutex<Vec<MockIntent>>,
}

#[derive(Debug, Clone)]
pub struct MockIntent {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub enrollment_id: Uuid,
    pub user_id: Uuid,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<MockIntent> {
        self.created
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<PaymentIntent> {
        let mut created = self
            .created
            .lock()
            .map_err(|_| AppError::internal("mock processor lock poisoned"))?;
        let id = format!("pi_mock_{}", created.len() + 1);
        created.push(MockIntent {
            id: id.clone(),
            amount_cents,
            currency: currency.to_string(),
            enrollment_id: metadata.enrollment_id,
            user_id: metadata.user_id,
        });
        Ok(PaymentIntent {
            client_secret: format!("{id}_secret_test"),
            id,
            status: "requires_payment_method".to_string(),
        })
    }
}

// --- webhook signatures ---

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Malformed,
    Expired,
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        let msg = match err {
            SignatureError::Malformed => "Malformed signature header",
            SignatureError::Expired => "Signature timestamp outside tolerance",
            SignatureError::Mismatch => "Signature verification failed",
        };
        AppError::bad_request(msg)
    }
}

fn signing_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
    // signed message is "{timestamp}.{payload}"
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

/// Produce a `t=...,v1=...` header for a payload. Counterpart of
/// [`verify_signature`]; also what the test suites sign with.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    match signing_mac(secret, timestamp, payload) {
        Some(mac) => format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ),
        None => String::new(),
    }
}

/// Check a `t=...,v1=...` header against the raw request body. Multiple `v1`
/// entries are allowed; any match passes. Comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> std::result::Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => candidates.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    for candidate in candidates {
        let Ok(sig) = hex::decode(candidate) else {
            continue;
        };
        let Some(mac) = signing_mac(secret, timestamp, payload) else {
            continue;
        };
        if mac.verify_slice(&sig).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

// --- webhook payload ---

/// Incoming event, reduced to the fields reconciliation reads.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: EventObject,
}

/// The `data.object` of an event. Intents and charges share this shape;
/// fields the other kind lacks stay `None`.
#[derive(Debug, Deserialize)]
pub struct EventObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub amount_refunded: Option<i64>,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

impl EventObject {
    /// `(user_id, enrollment_id)` when both metadata keys are present and
    /// parse as UUIDs.
    pub fn parties(&self) -> Option<(Uuid, Uuid)> {
        let user_id = self.metadata.get("user_id")?.parse().ok()?;
        let enrollment_id = self.metadata.get("enrollment_id")?.parse().ok()?;
        Some((user_id, enrollment_id))
    }
}

pub fn is_intent_event(event_type: &str) -> bool {
    event_type.starts_with("payment_intent.")
}

/// Enrollment-side payment state implied by an intent event.
pub fn payment_state_for(event_type: &str) -> PaymentState {
    match event_type {
        "payment_intent.succeeded" => PaymentState::Paid,
        "payment_intent.payment_failed" | "payment_intent.canceled" => PaymentState::Failed,
        _ => PaymentState::Pending,
    }
}

/// Fallback intent status when the event object carries none.
pub fn status_for_event(event_type: &str) -> PaymentStatus {
    match event_type {
        "payment_intent.succeeded" => PaymentStatus::Succeeded,
        "payment_intent.payment_failed" => PaymentStatus::Failed,
        "payment_intent.canceled" => PaymentStatus::Canceled,
        "payment_intent.processing" => PaymentStatus::Processing,
        _ => PaymentStatus::Failed,
    }
}
