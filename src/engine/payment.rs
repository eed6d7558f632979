use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;

use crate::limits::{MAX_WEBHOOK_PAYLOAD_BYTES, WEBHOOK_TOLERANCE_SECS};
use crate::model::*;

use super::conflict::check_no_conflict;
use super::lifecycle::initial_status;
use super::mutations::{validate_new_booking, BookingDraft, PaidSession};
use super::reference::{random_reference, reserve_unique};
use super::{Engine, EngineError};

type HmacSha256 = Hmac<Sha256>;

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway refused checkout: {0}")]
    Refused(String),
}

/// What the gateway is asked to charge for.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub booking_reference: String,
    pub description: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Echoed back verbatim on the completion event.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySession {
    pub id: String,
    pub url: Option<String>,
}

/// External checkout-session provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<GatewaySession, GatewayError>;
}

/// Local stand-in for a hosted checkout. Always succeeds, and remembers each
/// session so it can later produce the provider's webhook payloads.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    sessions: DashMap<String, CheckoutRequest>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `checkout.session.completed` body the provider would send once
    /// the customer pays in full.
    pub fn completed_payload(&self, session_id: &str) -> Option<Vec<u8>> {
        let request = self.sessions.get(session_id)?;
        Some(
            serde_json::json!({
                "type": "checkout.session.completed",
                "data": {"object": {
                    "id": session_id,
                    "amount_total": request.amount_cents,
                    "currency": request.currency,
                    "metadata": request.metadata,
                }}
            })
            .to_string()
            .into_bytes(),
        )
    }

    pub fn expired_payload(&self, session_id: &str) -> Option<Vec<u8>> {
        let request = self.sessions.get(session_id)?;
        Some(
            serde_json::json!({
                "type": "checkout.session.expired",
                "data": {"object": {"id": session_id, "metadata": request.metadata}}
            })
            .to_string()
            .into_bytes(),
        )
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<GatewaySession, GatewayError> {
        let id = format!("cs_mock_{}", ulid::Ulid::new());
        tracing::debug!(
            session_id = %id,
            reference = %request.booking_reference,
            amount_cents = request.amount_cents,
            "mock checkout session created"
        );
        self.sessions.insert(id.clone(), request.clone());
        Ok(GatewaySession {
            url: Some(format!("https://checkout.invalid/pay/{id}")),
            id,
        })
    }
}

// ── Checkouts ────────────────────────────────────────────────────

/// An unpaid checkout. Lives only in memory until it completes or expires.
#[derive(Debug, Clone)]
pub(crate) struct PendingCheckout {
    pub visitor_id: VisitorId,
    pub room_id: RoomId,
    pub reference: String,
    pub total_cost: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: Option<String>,
    pub booking_reference: String,
    pub total_cost: Decimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

// ── Webhook events ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    SessionCompleted,
    SessionExpired,
    Other(String),
}

impl PaymentEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentEventKind::SessionCompleted => "checkout.session.completed",
            PaymentEventKind::SessionExpired => "checkout.session.expired",
            PaymentEventKind::Other(s) => s,
        }
    }
}

/// A verified provider event, reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub kind: PaymentEventKind,
    pub session_id: String,
    /// Amount charged, in minor units.
    pub amount_total: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: RawObject,
}

#[derive(Deserialize)]
struct RawObject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl PaymentEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, EngineError> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| EngineError::Validation(format!("malformed payment event: {e}")))?;
        let kind = match raw.kind.as_str() {
            "checkout.session.completed" => PaymentEventKind::SessionCompleted,
            "checkout.session.expired" => PaymentEventKind::SessionExpired,
            _ => PaymentEventKind::Other(raw.kind),
        };
        Ok(Self {
            kind,
            session_id: raw.data.object.id,
            amount_total: raw.data.object.amount_total,
            metadata: raw.data.object.metadata,
        })
    }
}

/// Check a `t=<unix>,v1=<hex hmac>` signature header and parse the payload.
///
/// The MAC covers `"{t}.{payload}"`. Timestamps further than five minutes
/// from `now` are refused.
pub fn verify_webhook(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<PaymentEvent, EngineError> {
    if payload.len() > MAX_WEBHOOK_PAYLOAD_BYTES {
        return Err(EngineError::LimitExceeded("webhook payload too large"));
    }
    let mut timestamp = "";
    let mut signature = "";
    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signature = v;
        }
    }
    if timestamp.is_empty() || signature.is_empty() {
        return Err(EngineError::PaymentVerification("invalid signature header".into()));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EngineError::PaymentVerification("unusable webhook secret".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let sig_bytes = hex::decode(signature)
        .map_err(|_| EngineError::PaymentVerification("signature is not hex".into()))?;
    mac.verify_slice(&sig_bytes)
        .map_err(|_| EngineError::PaymentVerification("signature mismatch".into()))?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| EngineError::PaymentVerification("invalid signature timestamp".into()))?;
    if (now.timestamp() - ts).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(EngineError::PaymentVerification("signature timestamp outside tolerance".into()));
    }

    PaymentEvent::parse(payload)
}

/// Produce the header `verify_webhook` accepts. Used by the mock provider
/// and tests.
pub fn sign_webhook(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return format!("t={timestamp},v1="),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Created(Booking),
    /// The session already produced this booking; nothing was written.
    Duplicate(Booking),
    Expired { session_id: String },
    Ignored { event_type: String },
}

impl PaymentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentOutcome::Created(_) => "created",
            PaymentOutcome::Duplicate(_) => "duplicate",
            PaymentOutcome::Expired { .. } => "expired",
            PaymentOutcome::Ignored { .. } => "ignored",
        }
    }
}

// ── Metadata codec ───────────────────────────────────────────────

/// Booking fields carried through the provider as string metadata.
#[derive(Debug, Clone, PartialEq)]
struct SessionMetadata {
    visitor_id: VisitorId,
    reference: String,
    total_cost: Decimal,
    request: NewBooking,
}

impl SessionMetadata {
    fn encode(&self) -> BTreeMap<String, String> {
        let r = &self.request;
        let mut md = BTreeMap::new();
        md.insert("room_id".into(), r.room_id.to_string());
        md.insert("visitor_id".into(), self.visitor_id.to_string());
        md.insert("booking_reference".into(), self.reference.clone());
        md.insert("booking_date".into(), r.booking_date.to_string());
        md.insert("start_time".into(), format_time_of_day(r.span.start));
        md.insert("end_time".into(), format_time_of_day(r.span.end));
        md.insert("purpose".into(), r.purpose.clone());
        if let Some(d) = &r.description {
            md.insert("description".into(), d.clone());
        }
        md.insert("expected_attendees".into(), r.expected_attendees.to_string());
        md.insert("total_cost".into(), self.total_cost.to_string());
        md
    }

    fn decode(md: &BTreeMap<String, String>) -> Result<Self, EngineError> {
        fn field<'a>(md: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, EngineError> {
            md.get(key)
                .map(String::as_str)
                .ok_or_else(|| EngineError::PaymentVerification(format!("metadata missing {key}")))
        }
        fn bad(key: &str) -> EngineError {
            EngineError::PaymentVerification(format!("metadata has invalid {key}"))
        }

        let start = parse_time_of_day(field(md, "start_time")?).ok_or_else(|| bad("start_time"))?;
        let end = parse_time_of_day(field(md, "end_time")?).ok_or_else(|| bad("end_time"))?;
        let span = Span::try_new(start, end).ok_or_else(|| bad("time range"))?;
        let request = NewBooking {
            room_id: field(md, "room_id")?.parse().map_err(|_| bad("room_id"))?,
            booking_date: NaiveDate::from_str(field(md, "booking_date")?).map_err(|_| bad("booking_date"))?,
            span,
            purpose: md.get("purpose").cloned().unwrap_or_default(),
            description: md.get("description").filter(|d| !d.is_empty()).cloned(),
            expected_attendees: md
                .get("expected_attendees")
                .map(|s| s.parse())
                .transpose()
                .map_err(|_| bad("expected_attendees"))?
                .unwrap_or(1),
        };
        Ok(Self {
            visitor_id: field(md, "visitor_id")?.parse().map_err(|_| bad("visitor_id"))?,
            reference: field(md, "booking_reference")?.to_string(),
            total_cost: Decimal::from_str(field(md, "total_cost")?).map_err(|_| bad("total_cost"))?,
            request,
        })
    }
}

fn to_cents(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

// ── Engine operations ────────────────────────────────────────────

impl Engine {
    /// Validate a booking request, freeze its cost, reserve a reference and
    /// open a checkout session. No booking row exists until payment completes.
    pub async fn start_checkout(&self, principal: &Principal, req: NewBooking) -> Result<CheckoutSession, EngineError> {
        if !self.options.payment_required {
            return Err(EngineError::invalid("payment is not enabled: create the booking directly"));
        }
        let visitor = self.require_active_visitor(principal)?;
        let now = self.clock.now();

        let (room_name, total_cost) = {
            let guard = self.read_room(req.room_id).await?;
            validate_new_booking(&guard, &req, now, true)?;
            check_no_conflict(&guard, req.booking_date, &req.span, None, true)?;
            (
                guard.room.room_name.clone(),
                booking_cost(&req.span, guard.room.hourly_rate),
            )
        };
        let amount_cents = to_cents(total_cost).ok_or_else(|| EngineError::invalid("total cost out of range"))?;

        let reference = reserve_unique(&self.store, req.booking_date.year(), random_reference);
        let metadata = SessionMetadata {
            visitor_id: visitor.id,
            reference: reference.clone(),
            total_cost,
            request: req.clone(),
        };
        let request = CheckoutRequest {
            booking_reference: reference.clone(),
            description: format!("Room Booking: {room_name} ({reference})"),
            amount_cents,
            currency: self.options.currency.clone(),
            metadata: metadata.encode(),
        };

        let session = match self.gateway.create_checkout(&request).await {
            Ok(s) => s,
            Err(e) => {
                self.store.release_reference(&reference);
                return Err(match e {
                    GatewayError::Unavailable(_) => EngineError::Transient(e.to_string()),
                    GatewayError::Refused(_) => EngineError::invalid(e.to_string()),
                });
            }
        };

        self.checkouts.insert(
            session.id.clone(),
            PendingCheckout {
                visitor_id: visitor.id,
                room_id: req.room_id,
                reference: reference.clone(),
                total_cost,
                created_at: now,
            },
        );
        tracing::info!(
            session_id = %session.id,
            reference = %reference,
            room_id = req.room_id,
            total_cost = %total_cost,
            "checkout started"
        );

        Ok(CheckoutSession {
            session_id: session.id,
            url: session.url,
            booking_reference: reference,
            total_cost,
            currency: self.options.currency.clone(),
            expires_at: now + self.options.checkout_ttl,
        })
    }

    /// Apply a verified provider event. Completion is idempotent per session id.
    pub async fn handle_payment_event(&self, event: PaymentEvent) -> Result<PaymentOutcome, EngineError> {
        let result = match &event.kind {
            PaymentEventKind::SessionCompleted => self.complete_checkout(&event).await,
            PaymentEventKind::SessionExpired => {
                if let Some((_, pending)) = self.checkouts.remove(&event.session_id) {
                    self.store.release_reference(&pending.reference);
                    tracing::info!(session_id = %event.session_id, reference = %pending.reference, "checkout expired");
                }
                Ok(PaymentOutcome::Expired {
                    session_id: event.session_id.clone(),
                })
            }
            PaymentEventKind::Other(kind) => {
                tracing::info!(event_type = %kind, "ignoring payment event");
                Ok(PaymentOutcome::Ignored {
                    event_type: kind.clone(),
                })
            }
        };

        let outcome = match &result {
            Ok(o) => o.label(),
            Err(_) => "error",
        };
        metrics::counter!(
            crate::observability::PAYMENT_EVENTS_TOTAL,
            "type" => event.kind.as_str().to_string(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }

    async fn complete_checkout(&self, event: &PaymentEvent) -> Result<PaymentOutcome, EngineError> {
        if event.session_id.is_empty() {
            return Err(EngineError::PaymentVerification("event has no session id".into()));
        }
        let md = SessionMetadata::decode(&event.metadata)?;
        let expected_cents = to_cents(md.total_cost)
            .ok_or_else(|| EngineError::PaymentVerification("total cost out of range".into()))?;
        let paid = event
            .amount_total
            .ok_or_else(|| EngineError::PaymentVerification("event has no amount_total".into()))?;
        if paid != expected_cents {
            return Err(EngineError::PaymentVerification(format!(
                "amount {paid} does not match booking total {expected_cents}"
            )));
        }

        let _commit = self.begin_write().await?;
        let mut guard = self.lock_room(md.request.room_id).await?;

        // Same session delivered again: hand back what it already created.
        if let Some(id) = self.store.booking_for_session(&event.session_id)
            && let Some((room_id, date)) = self.store.booking_location(id)
        {
            let existing = if room_id == guard.room.id {
                guard.booking(id, date).cloned()
            } else {
                drop(guard);
                self.read_room(room_id).await?.booking(id, date).cloned()
            };
            if let Some(b) = existing {
                tracing::info!(session_id = %event.session_id, booking_id = b.id, "duplicate payment completion");
                return Ok(PaymentOutcome::Duplicate(b));
            }
            return Err(EngineError::not_found("booking", id));
        }

        match self.checkouts.get(&event.session_id).map(|p| p.value().clone()) {
            Some(p) => {
                if p.reference != md.reference || p.total_cost != md.total_cost || p.visitor_id != md.visitor_id {
                    return Err(EngineError::PaymentVerification(
                        "metadata does not match the checkout".into(),
                    ));
                }
            }
            // Checkout state is not persisted, so after a restart the metadata
            // is all we have. The reference must still be free.
            None => {
                if !self.store.reserve_reference(&md.reference) {
                    return Err(EngineError::PaymentVerification(format!(
                        "booking reference {} already in use",
                        md.reference
                    )));
                }
            }
        }
        let release = |engine: &Engine| {
            engine.checkouts.remove(&event.session_id);
            engine.store.release_reference(&md.reference);
        };

        if self.store.visitor(md.visitor_id).is_none() {
            release(self);
            return Err(EngineError::not_found("visitor", md.visitor_id));
        }
        let now = self.clock.now();
        if let Err(e) = check_no_conflict(&guard, md.request.booking_date, &md.request.span, None, true) {
            tracing::warn!(
                session_id = %event.session_id,
                reference = %md.reference,
                room_id = md.request.room_id,
                "paid checkout lost its slot: {e}"
            );
            release(self);
            return Err(e);
        }

        let draft = BookingDraft {
            visitor_id: md.visitor_id,
            reference: md.reference.clone(),
            status: initial_status(&guard.room),
            total_cost: md.total_cost,
            paid: Some(PaidSession {
                session_id: event.session_id.clone(),
                paid_at: now,
            }),
            request: md.request.clone(),
        };
        let booking = self.commit_new_booking(&mut guard, draft, now).await?;
        self.checkouts.remove(&event.session_id);
        Ok(PaymentOutcome::Created(booking))
    }

    /// Drop unpaid checkouts older than the configured TTL and free their
    /// references. Returns how many were dropped.
    pub fn expire_checkouts(&self) -> usize {
        let cutoff = self.clock.now() - self.options.checkout_ttl;
        let stale: Vec<String> = self
            .checkouts
            .iter()
            .filter(|e| e.value().created_at <= cutoff)
            .map(|e| e.key().clone())
            .collect();
        let mut dropped = 0;
        for session_id in stale {
            if let Some((_, pending)) = self
                .checkouts
                .remove_if(&session_id, |_, p| p.created_at <= cutoff)
            {
                self.store.release_reference(&pending.reference);
                tracing::debug!(session_id = %session_id, reference = %pending.reference, "checkout timed out");
                dropped += 1;
            }
        }
        dropped
    }

    pub fn pending_checkouts(&self) -> usize {
        self.checkouts.len()
    }
}
