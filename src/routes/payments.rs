use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    auth::Actor,
    error::{AppError, Result},
    models::{
        CreateIntentReq, EnrollmentStatus, IntentEventUpdate, PaymentIntentRecord, PaymentState,
        PaymentStatus,
    },
    routes::ok,
    stripe::{
        is_intent_event, payment_state_for, status_for_event, verify_signature, IntentMetadata,
        StripeEvent, DEFAULT_CURRENCY, SIGNATURE_HEADER, SIGNATURE_TOLERANCE_SECS,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create-intent", post(create_intent))
        .route("/webhook", post(webhook))
}

/// Creates (or refreshes) the payment intent for an enrollment. Retrying
/// replaces the previous intent; one payment row per enrollment.
async fn create_intent(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateIntentReq>,
) -> Result<(StatusCode, Json<Value>)> {
    let detail = state
        .store
        .enrollment_detail(req.enrollment_id)
        .await?
        .ok_or(AppError::NotFound("enrollment"))?;
    if detail.enrollment.user_id != actor.id {
        return Err(AppError::forbidden(
            "You can only pay for your own enrollment",
        ));
    }
    if detail.enrollment.payment_status == PaymentState::Paid {
        return Err(AppError::conflict("Enrollment is already paid"));
    }
    if detail.enrollment.status == EnrollmentStatus::Dropped {
        return Err(AppError::conflict("Enrollment has been cancelled"));
    }

    let amount_cents = crate::stripe::to_minor_units(detail.course_price)?;
    let intent = state
        .processor
        .create_intent(
            amount_cents,
            DEFAULT_CURRENCY,
            &IntentMetadata {
                enrollment_id: req.enrollment_id,
                user_id: actor.id,
            },
        )
        .await?;

    let payment = state
        .store
        .upsert_payment_intent(PaymentIntentRecord {
            user_id: actor.id,
            enrollment_id: req.enrollment_id,
            intent_id: intent.id,
            amount_cents,
            currency: DEFAULT_CURRENCY.to_string(),
            status: PaymentStatus::from_intent_status(&intent.status),
        })
        .await?;
    info!(enrollment = %req.enrollment_id, intent = %payment.stripe_payment_intent_id, "created payment intent");

    Ok((
        StatusCode::CREATED,
        ok(json!({
            "client_secret": intent.client_secret,
            "payment_intent_id": payment.stripe_payment_intent_id,
            "amount_cents": payment.amount_cents,
            "currency": payment.currency,
        })),
    ))
}

/// Processor webhook. The signature is checked against the raw body before
/// anything is parsed; unverifiable deliveries get a 400 so the processor
/// retries, while verified-but-unusable events are logged and acknowledged.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::bad_request("Webhook signing secret not configured"))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("Missing stripe-signature header"))?;
    verify_signature(
        secret,
        signature,
        &body,
        Utc::now().timestamp(),
        SIGNATURE_TOLERANCE_SECS,
    )?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|_| AppError::bad_request("Malformed webhook payload"))?;

    if is_intent_event(&event.event_type) {
        apply_intent(&state, &event).await?;
    } else if event.event_type == "charge.refunded" {
        apply_refund(&state, &event).await?;
    } else {
        info!(event = %event.id, kind = %event.event_type, "ignoring webhook event");
    }

    Ok(Json(json!({ "received": true })))
}

async fn apply_intent(state: &AppState, event: &StripeEvent) -> Result<()> {
    let object = &event.data.object;
    let Some((user_id, enrollment_id)) = object.parties() else {
        warn!(event = %event.id, kind = %event.event_type, "intent event without enrollment metadata");
        return Ok(());
    };

    let status = object
        .status
        .as_deref()
        .map(PaymentStatus::from_intent_status)
        .unwrap_or_else(|| status_for_event(&event.event_type));
    let applied = state
        .store
        .apply_intent_event(IntentEventUpdate {
            user_id,
            enrollment_id,
            intent_id: object.id.clone(),
            amount_cents: object.amount,
            currency: object.currency.clone(),
            amount_refunded_cents: object.amount_refunded,
            status,
            payment_state: payment_state_for(&event.event_type),
        })
        .await?;
    match applied {
        Some(payment) => {
            info!(event = %event.id, enrollment = %enrollment_id, status = ?payment.status, "applied intent event")
        }
        None => warn!(event = %event.id, enrollment = %enrollment_id, "intent event for unknown enrollment"),
    }
    Ok(())
}

/// Refund charges carry the intent id; metadata is only present when the
/// charge was created through our own intents.
async fn apply_refund(state: &AppState, event: &StripeEvent) -> Result<()> {
    let object = &event.data.object;

    if let Some((user_id, enrollment_id)) = object.parties() {
        let intent_id = object
            .payment_intent
            .clone()
            .unwrap_or_else(|| object.id.clone());
        let applied = state
            .store
            .apply_intent_event(IntentEventUpdate {
                user_id,
                enrollment_id,
                intent_id,
                amount_cents: object.amount,
                currency: object.currency.clone(),
                amount_refunded_cents: object.amount_refunded,
                status: PaymentStatus::Refunded,
                payment_state: PaymentState::Refunded,
            })
            .await?;
        if applied.is_none() {
            warn!(event = %event.id, enrollment = %enrollment_id, "refund for unknown enrollment");
        }
        return Ok(());
    }

    match object.payment_intent.as_deref() {
        Some(intent_id) => {
            let applied = state
                .store
                .apply_refund_by_intent(intent_id, object.amount_refunded)
                .await?;
            if applied.is_none() {
                warn!(event = %event.id, intent = %intent_id, "refund for unknown payment intent");
            }
        }
        None => warn!(event = %event.id, "refund without an intent reference"),
    }
    Ok(())
}
