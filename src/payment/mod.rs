//! Payment confirmation boundary.
//!
//! Two untrusted inputs arrive here: signed webhook deliveries and browser
//! returns from checkout. Both are normalized into a [`PurchaseConfirmation`]
//! and handed to the same [`Coordinator::fulfill`] entry point.

mod sessions;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::coordinator::{
    ConfirmationSource, Coordinator, Customer, FulfillOutcome, FulfillmentError, PaymentStatus,
    Purchase, PurchaseConfirmation,
};
use crate::engine::StorageError;
use crate::external::{ExternalError, PaymentProvider};
use crate::limits::DEFAULT_WEBHOOK_PAYLOAD_LIMIT;
use crate::model::{HoldToken, Span};
use crate::observability;

pub use sessions::{RETURN_SESSION_TTL_MS, ReturnSessions};
pub use webhook::{
    FULFILLING_EVENTS, SIGNATURE_HEADER, is_fulfilling_event, read_payload, sign, verify_signature,
};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Checkout session as the provider reports it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub client_reference_id: Option<String>,
    pub payment_status: String,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    PayloadTooLarge { limit: usize },
    Io(String),
    MissingSignature,
    MalformedSignature,
    SignatureMismatch,
    StaleTimestamp,
    MalformedPayload(String),
    MissingReference,
    UnknownPaymentStatus(String),
    UnknownProduct(String),
    MissingField(&'static str),
    InvalidInstant(&'static str),
    SessionExpired,
    Provider(ExternalError),
    Fulfillment(FulfillmentError),
}

impl ConfirmationError {
    fn label(&self) -> &'static str {
        match self {
            ConfirmationError::PayloadTooLarge { .. } => "payload_too_large",
            ConfirmationError::Io(_) => "io_error",
            ConfirmationError::MissingSignature
            | ConfirmationError::MalformedSignature
            | ConfirmationError::SignatureMismatch
            | ConfirmationError::StaleTimestamp => "bad_signature",
            ConfirmationError::MalformedPayload(_)
            | ConfirmationError::MissingReference
            | ConfirmationError::UnknownPaymentStatus(_)
            | ConfirmationError::UnknownProduct(_)
            | ConfirmationError::MissingField(_)
            | ConfirmationError::InvalidInstant(_) => "invalid",
            ConfirmationError::SessionExpired => "session_expired",
            ConfirmationError::Provider(_) => "provider_error",
            ConfirmationError::Fulfillment(_) => "fulfillment_error",
        }
    }

    /// Whether the sender should retry. Webhook deliveries are retried by the
    /// provider on a non-2xx response.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConfirmationError::Io(_) => true,
            ConfirmationError::Provider(e) => e.is_transient(),
            ConfirmationError::Fulfillment(e) => !matches!(
                e,
                FulfillmentError::Storage(StorageError::AlreadyBooked { .. })
                    | FulfillmentError::InvalidInstant(_)
            ),
            _ => false,
        }
    }

    /// Text safe to show a visitor.
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfirmationError::SessionExpired => {
                "Your checkout session has expired. Please start again."
            }
            ConfirmationError::Fulfillment(
                FulfillmentError::MeetingNotConfirmed
                | FulfillmentError::Storage(StorageError::AlreadyBooked { .. })
                | FulfillmentError::Storage(StorageError::UnknownSpan(_)),
            ) => "That time is no longer available. Please pick another slot.",
            _ => "Something went wrong. Please try again or contact us.",
        }
    }
}

impl std::fmt::Display for ConfirmationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmationError::PayloadTooLarge { limit } => {
                write!(f, "payload exceeds {limit} bytes")
            }
            ConfirmationError::Io(e) => write!(f, "read failed: {e}"),
            ConfirmationError::MissingSignature => write!(f, "missing signature header"),
            ConfirmationError::MalformedSignature => write!(f, "malformed signature header"),
            ConfirmationError::SignatureMismatch => write!(f, "signature mismatch"),
            ConfirmationError::StaleTimestamp => write!(f, "signature timestamp outside tolerance"),
            ConfirmationError::MalformedPayload(e) => write!(f, "malformed payload: {e}"),
            ConfirmationError::MissingReference => write!(f, "missing client reference"),
            ConfirmationError::UnknownPaymentStatus(s) => write!(f, "unknown payment status: {s}"),
            ConfirmationError::UnknownProduct(p) => write!(f, "unknown product: {p}"),
            ConfirmationError::MissingField(name) => write!(f, "missing field: {name}"),
            ConfirmationError::InvalidInstant(name) => write!(f, "invalid instant in {name}"),
            ConfirmationError::SessionExpired => write!(f, "return session expired"),
            ConfirmationError::Provider(e) => write!(f, "payment provider: {e}"),
            ConfirmationError::Fulfillment(e) => write!(f, "fulfillment: {e}"),
        }
    }
}

impl std::error::Error for ConfirmationError {}

impl From<FulfillmentError> for ConfirmationError {
    fn from(e: FulfillmentError) -> Self {
        ConfirmationError::Fulfillment(e)
    }
}

fn rfc3339_ms(
    metadata: &HashMap<String, String>,
    key: &'static str,
) -> Result<i64, ConfirmationError> {
    let raw = metadata
        .get(key)
        .ok_or(ConfirmationError::MissingField(key))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp_millis())
        .map_err(|_| ConfirmationError::InvalidInstant(key))
}

impl CheckoutSession {
    /// Normalize into a confirmation, validating every field the fulfillment needs.
    pub fn to_confirmation(
        &self,
        source: ConfirmationSource,
    ) -> Result<PurchaseConfirmation, ConfirmationError> {
        let reference = self
            .client_reference_id
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(ConfirmationError::MissingReference)?;
        let payment_status = PaymentStatus::parse(&self.payment_status)
            .ok_or_else(|| ConfirmationError::UnknownPaymentStatus(self.payment_status.clone()))?;

        let details = self.customer_details.clone().unwrap_or_default();
        let email = details
            .email
            .or_else(|| self.metadata.get("email").cloned())
            .filter(|e| !e.is_empty())
            .ok_or(ConfirmationError::MissingField("email"))?;
        let name = self
            .metadata
            .get("name")
            .cloned()
            .or(details.name)
            .unwrap_or_default();

        let product = self
            .metadata
            .get("product")
            .ok_or(ConfirmationError::MissingField("product"))?;
        let purchase = match product.as_str() {
            "coaching_call" => {
                let start = rfc3339_ms(&self.metadata, "start")?;
                let end = rfc3339_ms(&self.metadata, "end")?;
                let span = Span::checked(start, end).ok_or(ConfirmationError::InvalidInstant("end"))?;
                let hold_token = self
                    .metadata
                    .get("hold_token")
                    .filter(|t| !t.is_empty())
                    .map(|t| HoldToken::from(t.as_str()));
                Purchase::CoachingCall { span, hold_token }
            }
            "guide" => {
                let tag = self
                    .metadata
                    .get("tag")
                    .filter(|t| !t.is_empty())
                    .ok_or(ConfirmationError::MissingField("tag"))?;
                Purchase::Guide { tag: tag.clone() }
            }
            other => return Err(ConfirmationError::UnknownProduct(other.to_string())),
        };

        Ok(PurchaseConfirmation {
            reference: reference.to_string(),
            payment_status,
            customer: Customer { name, email },
            purchase,
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Acknowledged without action.
    Ignored { event_type: String },
    Fulfilled(FulfillOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnOutcome {
    Fulfilled(FulfillOutcome),
    /// Session not paid yet; recorded for bookkeeping and left for the webhook.
    Unpaid { reference: String },
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub payload_limit: usize,
    pub tolerance_secs: i64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            payload_limit: DEFAULT_WEBHOOK_PAYLOAD_LIMIT,
            tolerance_secs: 300,
        }
    }
}

pub struct ConfirmationGateway {
    coordinator: Arc<Coordinator>,
    provider: Arc<dyn PaymentProvider>,
    sessions: ReturnSessions,
    settings: WebhookSettings,
    clock: Arc<dyn Clock>,
}

impl ConfirmationGateway {
    pub fn new(
        coordinator: Arc<Coordinator>,
        provider: Arc<dyn PaymentProvider>,
        settings: WebhookSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            provider,
            sessions: ReturnSessions::new(),
            settings,
            clock,
        }
    }

    /// Arm the one-time return flag for a freshly created checkout session.
    pub fn register_checkout(&self, session_id: &str) {
        self.sessions.register(session_id, self.clock.now_ms());
    }

    /// Read a webhook body from `reader` under the payload limit, then handle it.
    pub async fn receive_webhook<R>(
        &self,
        reader: R,
        content_length: Option<u64>,
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ConfirmationError>
    where
        R: AsyncRead + Unpin,
    {
        let payload = match read_payload(reader, content_length, self.settings.payload_limit).await
        {
            Ok(p) => p,
            Err(e) => {
                Self::record_webhook(&Err(e.clone()));
                return Err(e);
            }
        };
        self.handle_webhook(&payload, signature).await
    }

    /// Verify and act on one webhook delivery.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ConfirmationError> {
        let result = self.handle_webhook_inner(payload, signature).await;
        Self::record_webhook(&result);
        result
    }

    fn record_webhook(result: &Result<WebhookOutcome, ConfirmationError>) {
        let label = match result {
            Ok(WebhookOutcome::Ignored { .. }) => "ignored",
            Ok(WebhookOutcome::Fulfilled(_)) => "handled",
            Err(e) => {
                warn!(error = %e, "webhook rejected");
                e.label()
            }
        };
        metrics::counter!(observability::WEBHOOKS_TOTAL, "result" => label).increment(1);
    }

    async fn handle_webhook_inner(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ConfirmationError> {
        if payload.len() > self.settings.payload_limit {
            return Err(ConfirmationError::PayloadTooLarge {
                limit: self.settings.payload_limit,
            });
        }
        let signature = signature.ok_or(ConfirmationError::MissingSignature)?;
        verify_signature(
            payload,
            signature,
            &self.settings.secret,
            self.clock.now_ms() / 1000,
            self.settings.tolerance_secs,
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ConfirmationError::MalformedPayload(e.to_string()))?;
        if !is_fulfilling_event(&event.kind) {
            info!(event_type = %event.kind, "webhook event ignored");
            return Ok(WebhookOutcome::Ignored {
                event_type: event.kind,
            });
        }
        let session: CheckoutSession = serde_json::from_value(event.data.object)
            .map_err(|e| ConfirmationError::MalformedPayload(e.to_string()))?;
        let confirmation = session.to_confirmation(ConfirmationSource::Webhook)?;
        let outcome = self.coordinator.fulfill(&confirmation).await?;
        Ok(WebhookOutcome::Fulfilled(outcome))
    }

    /// Handle a browser return from checkout. Honoured once per registered session.
    pub async fn handle_return(&self, session_id: &str) -> Result<ReturnOutcome, ConfirmationError> {
        if !self.sessions.consume(session_id, self.clock.now_ms()) {
            warn!(session_id, "return without a live session flag");
            return Err(ConfirmationError::SessionExpired);
        }
        let session = self
            .provider
            .retrieve_session(session_id)
            .await
            .map_err(ConfirmationError::Provider)?;
        let confirmation = session.to_confirmation(ConfirmationSource::Return)?;

        if confirmation.payment_status == PaymentStatus::Unpaid {
            self.coordinator
                .engine()
                .insert_fulfillment(&confirmation.reference, &confirmation.metadata_json(), false)
                .await
                .map_err(|e| ConfirmationError::Fulfillment(e.into()))?;
            info!(reference = %confirmation.reference, "return with unpaid session recorded");
            return Ok(ReturnOutcome::Unpaid {
                reference: confirmation.reference,
            });
        }

        let outcome = self.coordinator.fulfill(&confirmation).await?;
        Ok(ReturnOutcome::Fulfilled(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::FulfillmentSettings;
    use crate::engine::{Engine, HoldPolicy};
    use crate::external::{MeetingRequest, MeetingStatus, NotificationApi, SchedulingApi};
    use crate::model::{Ms, SLOT_MS};

    /// 2025-06-02T16:00:00Z
    const T0: Ms = 1_748_880_000_000;
    const SECRET: &str = "whsec_test";

    struct CountingScheduling(AtomicUsize);

    #[async_trait]
    impl SchedulingApi for CountingScheduling {
        async fn create_meeting(&self, _: &MeetingRequest) -> Result<MeetingStatus, ExternalError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(MeetingStatus {
                confirmed: true,
                meeting_url: None,
            })
        }
    }

    struct SilentNotifications;

    #[async_trait]
    impl NotificationApi for SilentNotifications {
        async fn subscribe(&self, _: &str, _: Option<&str>) -> Result<(), ExternalError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        sessions: Mutex<HashMap<String, CheckoutSession>>,
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn retrieve_session(&self, id: &str) -> Result<CheckoutSession, ExternalError> {
            self.sessions
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| ExternalError::Permanent(format!("no such session {id}")))
        }
    }

    struct Harness {
        gateway: ConfirmationGateway,
        provider: Arc<FakeProvider>,
        scheduling: Arc<CountingScheduling>,
        engine: Arc<Engine>,
    }

    async fn harness(name: &str) -> Harness {
        let dir = std::env::temp_dir().join("holdfast_test_payment");
        std::fs::create_dir_all(&dir).unwrap();
        let path: PathBuf = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let clock = Arc::new(ManualClock::new(T0 - 3_600_000));
        let engine = Arc::new(Engine::new(path, clock.clone(), HoldPolicy::default()).unwrap());
        engine
            .insert_intervals(&[Span::new(T0, T0 + SLOT_MS)])
            .await
            .unwrap();
        let scheduling = Arc::new(CountingScheduling(AtomicUsize::new(0)));
        let coordinator = Arc::new(Coordinator::new(
            engine.clone(),
            scheduling.clone(),
            Arc::new(SilentNotifications),
            FulfillmentSettings::default(),
        ));
        let provider = Arc::new(FakeProvider::default());
        let gateway = ConfirmationGateway::new(
            coordinator,
            provider.clone(),
            WebhookSettings {
                secret: SECRET.into(),
                ..Default::default()
            },
            clock,
        );
        Harness {
            gateway,
            provider,
            scheduling,
            engine,
        }
    }

    fn session(reference: &str, status: &str) -> serde_json::Value {
        json!({
            "id": "cs_1",
            "client_reference_id": reference,
            "payment_status": status,
            "customer_details": { "email": "ada@example.com", "name": "Ada L" },
            "metadata": {
                "product": "coaching_call",
                "name": "Ada",
                "email": "ada@example.com",
                "start": "2025-06-02T16:00:00Z",
                "end": "2025-06-02T16:30:00Z"
            }
        })
    }

    fn event(kind: &str, object: serde_json::Value) -> Vec<u8> {
        json!({ "type": kind, "data": { "object": object } })
            .to_string()
            .into_bytes()
    }

    fn now_secs() -> i64 {
        (T0 - 3_600_000) / 1000
    }

    #[test]
    fn session_normalizes_to_call() {
        let s: CheckoutSession = serde_json::from_value(session("R", "paid")).unwrap();
        let c = s.to_confirmation(ConfirmationSource::Webhook).unwrap();
        assert_eq!(c.reference, "R");
        assert_eq!(c.payment_status, PaymentStatus::Paid);
        assert_eq!(c.customer.name, "Ada");
        assert_eq!(
            c.purchase,
            Purchase::CoachingCall {
                span: Span::new(T0, T0 + SLOT_MS),
                hold_token: None,
            }
        );

        let mut raw = session("R", "paid");
        raw["metadata"]["hold_token"] = json!("tok-1");
        let s: CheckoutSession = serde_json::from_value(raw).unwrap();
        let c = s.to_confirmation(ConfirmationSource::Webhook).unwrap();
        assert_eq!(
            c.purchase,
            Purchase::CoachingCall {
                span: Span::new(T0, T0 + SLOT_MS),
                hold_token: Some(HoldToken::from("tok-1")),
            }
        );
    }

    #[test]
    fn session_validation_errors() {
        let mut raw = session("", "paid");
        let s: CheckoutSession = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            s.to_confirmation(ConfirmationSource::Webhook),
            Err(ConfirmationError::MissingReference)
        );

        raw["client_reference_id"] = json!("R");
        raw["metadata"]["product"] = json!("workshop");
        let s: CheckoutSession = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            s.to_confirmation(ConfirmationSource::Webhook),
            Err(ConfirmationError::UnknownProduct("workshop".into()))
        );

        raw["metadata"]["product"] = json!("coaching_call");
        raw["metadata"]["start"] = json!("next tuesday");
        let s: CheckoutSession = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            s.to_confirmation(ConfirmationSource::Webhook),
            Err(ConfirmationError::InvalidInstant("start"))
        );

        raw["metadata"] = json!({ "product": "guide", "email": "a@b.c" });
        raw["customer_details"] = json!(null);
        let s: CheckoutSession = serde_json::from_value(raw).unwrap();
        assert_eq!(
            s.to_confirmation(ConfirmationSource::Webhook),
            Err(ConfirmationError::MissingField("tag"))
        );
    }

    #[tokio::test]
    async fn signed_webhook_fulfills_once() {
        let h = harness("webhook_once.wal").await;
        let body = event("checkout.session.completed", session("R", "paid"));
        let header = sign(&body, SECRET, now_secs());

        let first = h.gateway.handle_webhook(&body, Some(&header)).await.unwrap();
        assert!(matches!(
            first,
            WebhookOutcome::Fulfilled(FulfillOutcome::Booked { .. })
        ));
        let again = h.gateway.handle_webhook(&body, Some(&header)).await.unwrap();
        assert_eq!(
            again,
            WebhookOutcome::Fulfilled(FulfillOutcome::AlreadyFulfilled)
        );
        assert_eq!(h.scheduling.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsigned_or_forged_webhook_does_nothing() {
        let h = harness("webhook_forged.wal").await;
        let body = event("checkout.session.completed", session("R", "paid"));
        assert_eq!(
            h.gateway.handle_webhook(&body, None).await,
            Err(ConfirmationError::MissingSignature)
        );
        let forged = sign(&body, "not-the-secret", now_secs());
        assert_eq!(
            h.gateway.handle_webhook(&body, Some(&forged)).await,
            Err(ConfirmationError::SignatureMismatch)
        );
        assert!(h.engine.get_fulfillment("R").await.is_none());
        assert_eq!(h.scheduling.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_event_types_are_ignored() {
        let h = harness("webhook_ignored.wal").await;
        let body = event("checkout.session.expired", session("R", "unpaid"));
        let header = sign(&body, SECRET, now_secs());
        assert_eq!(
            h.gateway.handle_webhook(&body, Some(&header)).await.unwrap(),
            WebhookOutcome::Ignored {
                event_type: "checkout.session.expired".into()
            }
        );
        assert!(h.engine.get_fulfillment("R").await.is_none());
    }

    #[tokio::test]
    async fn oversized_webhook_rejected() {
        let h = harness("webhook_big.wal").await;
        let body = vec![b' '; DEFAULT_WEBHOOK_PAYLOAD_LIMIT + 1];
        assert_eq!(
            h.gateway.receive_webhook(&body[..], None, Some("t=1,v1=00")).await,
            Err(ConfirmationError::PayloadTooLarge {
                limit: DEFAULT_WEBHOOK_PAYLOAD_LIMIT
            })
        );
    }

    #[tokio::test]
    async fn return_is_one_time() {
        let h = harness("return_once.wal").await;
        let s: CheckoutSession = serde_json::from_value(session("R", "paid")).unwrap();
        h.provider.sessions.lock().unwrap().insert("cs_1".into(), s);
        h.gateway.register_checkout("cs_1");

        let outcome = h.gateway.handle_return("cs_1").await.unwrap();
        assert!(matches!(
            outcome,
            ReturnOutcome::Fulfilled(FulfillOutcome::Booked { .. })
        ));
        let err = h.gateway.handle_return("cs_1").await.unwrap_err();
        assert_eq!(err, ConfirmationError::SessionExpired);
        assert_eq!(
            err.user_message(),
            "Your checkout session has expired. Please start again."
        );
    }

    #[tokio::test]
    async fn unpaid_return_is_recorded_then_webhook_fulfills() {
        let h = harness("return_unpaid.wal").await;
        let s: CheckoutSession = serde_json::from_value(session("R", "unpaid")).unwrap();
        h.provider.sessions.lock().unwrap().insert("cs_1".into(), s);
        h.gateway.register_checkout("cs_1");

        assert_eq!(
            h.gateway.handle_return("cs_1").await.unwrap(),
            ReturnOutcome::Unpaid {
                reference: "R".into()
            }
        );
        let record = h.engine.get_fulfillment("R").await.unwrap();
        assert!(!record.is_fulfilled);
        assert_eq!(h.scheduling.0.load(Ordering::SeqCst), 0);

        let body = event(
            "checkout.session.async_payment_succeeded",
            session("R", "paid"),
        );
        let header = sign(&body, SECRET, now_secs());
        let outcome = h.gateway.handle_webhook(&body, Some(&header)).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Fulfilled(FulfillOutcome::Booked { .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_return_never_reaches_provider() {
        let h = harness("return_unregistered.wal").await;
        assert_eq!(
            h.gateway.handle_return("cs_never").await,
            Err(ConfirmationError::SessionExpired)
        );
    }
}
