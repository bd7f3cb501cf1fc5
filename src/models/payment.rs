use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::enrollment::PaymentState;

/// Processor-side lifecycle of a payment intent.
#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Canceled,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Map a raw intent status string; anything unrecognized counts as
    /// failed rather than being rejected.
    pub fn from_intent_status(status: &str) -> Self {
        match status {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "processing" => Self::Processing,
            "succeeded" => Self::Succeeded,
            "canceled" => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub enrollment_id: Uuid,
    pub stripe_payment_intent_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub amount_refunded_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row written when an intent is created locally.
#[derive(Debug, Clone)]
pub struct PaymentIntentRecord {
    pub user_id: Uuid,
    pub enrollment_id: Uuid,
    pub intent_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
}

/// Effect of one webhook event on the ledger. Applied as an upsert so
/// replayed and reordered deliveries stay safe; `None` amounts leave the
/// stored values untouched.
#[derive(Debug, Clone)]
pub struct IntentEventUpdate {
    pub user_id: Uuid,
    pub enrollment_id: Uuid,
    pub intent_id: String,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub amount_refunded_cents: Option<i64>,
    pub status: PaymentStatus,
    pub payment_state: PaymentState,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CreateIntentReq {
    pub enrollment_id: Uuid,
}
