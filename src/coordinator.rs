use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::engine::{Engine, StorageError};
use crate::external::{ExternalError, MeetingRequest, NotificationApi, SchedulingApi};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(Self::Paid),
            "unpaid" => Some(Self::Unpaid),
            "no_payment_required" => Some(Self::NoPaymentRequired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Unpaid => "unpaid",
            Self::NoPaymentRequired => "no_payment_required",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub name: String,
    pub email: String,
}

/// What was bought. Closed; unknown product tags never get this far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purchase {
    /// `hold_token` is the visitor's hold from checkout, if one was taken.
    CoachingCall {
        span: Span,
        hold_token: Option<HoldToken>,
    },
    Guide { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationSource {
    Webhook,
    Return,
}

/// Canonical payment confirmation. Both delivery paths produce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseConfirmation {
    pub reference: String,
    pub payment_status: PaymentStatus,
    pub customer: Customer,
    pub purchase: Purchase,
    pub source: ConfirmationSource,
}

impl PurchaseConfirmation {
    /// Ledger metadata for this purchase.
    pub fn metadata_json(&self) -> String {
        let mut doc = json!({
            "name": self.customer.name,
            "email": self.customer.email,
            "payment_status": self.payment_status.as_str(),
        });
        match &self.purchase {
            Purchase::CoachingCall { span, .. } => {
                doc["product"] = json!("coaching_call");
                doc["start"] = json!(span.start);
                doc["end"] = json!(span.end);
            }
            Purchase::Guide { tag } => {
                doc["product"] = json!("guide");
                doc["tag"] = json!(tag);
            }
        }
        doc.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillOutcome {
    AlreadyFulfilled,
    /// Another delivery of the same confirmation is mid-flight.
    InProgress,
    /// Unpaid; the record stays open for a later delivery.
    AwaitingPayment,
    /// `notified` is false when the confirmation email failed after booking.
    Booked {
        meeting_url: Option<String>,
        notified: bool,
    },
    Delivered,
}

impl FulfillOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FulfillOutcome::AlreadyFulfilled => "already_fulfilled",
            FulfillOutcome::InProgress => "in_progress",
            FulfillOutcome::AwaitingPayment => "awaiting_payment",
            FulfillOutcome::Booked { .. } => "booked",
            FulfillOutcome::Delivered => "delivered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
    Storage(StorageError),
    Scheduling(ExternalError),
    MeetingNotConfirmed,
    Notification(ExternalError),
    InvalidInstant(Ms),
}

impl FulfillmentError {
    fn label(&self) -> &'static str {
        match self {
            FulfillmentError::Storage(_) => "storage_error",
            FulfillmentError::Scheduling(_) => "scheduling_error",
            FulfillmentError::MeetingNotConfirmed => "meeting_not_confirmed",
            FulfillmentError::Notification(_) => "notification_error",
            FulfillmentError::InvalidInstant(_) => "invalid_instant",
        }
    }
}

impl std::fmt::Display for FulfillmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FulfillmentError::Storage(e) => write!(f, "storage: {e}"),
            FulfillmentError::Scheduling(e) => write!(f, "meeting creation failed: {e}"),
            FulfillmentError::MeetingNotConfirmed => write!(f, "meeting was not confirmed"),
            FulfillmentError::Notification(e) => write!(f, "notification failed: {e}"),
            FulfillmentError::InvalidInstant(ms) => write!(f, "instant out of range: {ms}"),
        }
    }
}

impl std::error::Error for FulfillmentError {}

impl From<StorageError> for FulfillmentError {
    fn from(e: StorageError) -> Self {
        FulfillmentError::Storage(e)
    }
}

#[derive(Debug, Clone)]
pub struct FulfillmentSettings {
    pub meeting_title: String,
    /// Added to every meeting's attendee list.
    pub host_email: Option<String>,
    /// Notification tag that sends the call confirmation.
    pub coaching_tag: String,
}

impl Default for FulfillmentSettings {
    fn default() -> Self {
        Self {
            meeting_title: "Coaching call".into(),
            host_email: None,
            coaching_tag: "coaching_call".into(),
        }
    }
}

/// Single exactly-once entry point for confirmed purchases.
pub struct Coordinator {
    engine: Arc<Engine>,
    scheduling: Arc<dyn SchedulingApi>,
    notifications: Arc<dyn NotificationApi>,
    settings: FulfillmentSettings,
}

fn utc(ms: Ms) -> Result<DateTime<Utc>, FulfillmentError> {
    DateTime::from_timestamp_millis(ms).ok_or(FulfillmentError::InvalidInstant(ms))
}

impl Coordinator {
    pub fn new(
        engine: Arc<Engine>,
        scheduling: Arc<dyn SchedulingApi>,
        notifications: Arc<dyn NotificationApi>,
        settings: FulfillmentSettings,
    ) -> Self {
        Self {
            engine,
            scheduling,
            notifications,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Fulfill `confirmation` at most once, however many times and by however
    /// many paths it is delivered. A failure leaves the record unfulfilled.
    pub async fn fulfill(
        &self,
        confirmation: &PurchaseConfirmation,
    ) -> Result<FulfillOutcome, FulfillmentError> {
        let reference = confirmation.reference.as_str();
        let result = self.fulfill_inner(confirmation).await;
        match &result {
            Ok(outcome) => {
                info!(
                    reference,
                    source = ?confirmation.source,
                    outcome = outcome.label(),
                    "fulfillment finished"
                );
                metrics::counter!(observability::FULFILLMENTS_TOTAL, "outcome" => outcome.label())
                    .increment(1);
            }
            Err(e) => {
                error!(reference, source = ?confirmation.source, error = %e, "fulfillment failed");
                metrics::counter!(observability::FULFILLMENTS_TOTAL, "outcome" => e.label())
                    .increment(1);
            }
        }
        result
    }

    async fn fulfill_inner(
        &self,
        confirmation: &PurchaseConfirmation,
    ) -> Result<FulfillOutcome, FulfillmentError> {
        let reference = confirmation.reference.as_str();
        let metadata = confirmation.metadata_json();
        match self.engine.claim_fulfillment(reference, &metadata).await? {
            FulfillmentGate::AlreadyFulfilled => return Ok(FulfillOutcome::AlreadyFulfilled),
            FulfillmentGate::InProgress => return Ok(FulfillOutcome::InProgress),
            FulfillmentGate::Claimed => {}
        }

        if confirmation.payment_status == PaymentStatus::Unpaid {
            self.engine.abandon_fulfillment(reference).await;
            return Ok(FulfillOutcome::AwaitingPayment);
        }

        let result = match &confirmation.purchase {
            Purchase::CoachingCall { span, hold_token } => {
                self.book_call(reference, &confirmation.customer, *span, hold_token.as_ref())
                    .await
            }
            Purchase::Guide { tag } => {
                self.deliver_guide(reference, &confirmation.customer, tag).await
            }
        };
        if result.is_err() {
            self.engine.abandon_fulfillment(reference).await;
        }
        result
    }

    async fn book_call(
        &self,
        reference: &str,
        customer: &Customer,
        span: Span,
        hold_token: Option<&HoldToken>,
    ) -> Result<FulfillOutcome, FulfillmentError> {
        // No meeting for a slot this purchase could not book anyway.
        self.engine.check_bookable(span, reference, hold_token)?;

        let mut attendees = vec![customer.email.clone()];
        if let Some(host) = &self.settings.host_email {
            attendees.push(host.clone());
        }
        let request = MeetingRequest {
            attendees,
            start: utc(span.start)?,
            end: utc(span.end)?,
            title: format!("{} with {}", self.settings.meeting_title, customer.name),
        };
        let status = self
            .scheduling
            .create_meeting(&request)
            .await
            .map_err(FulfillmentError::Scheduling)?;
        if !status.confirmed {
            return Err(FulfillmentError::MeetingNotConfirmed);
        }

        self.engine.mark_booked(span, reference, hold_token).await?;

        // The booking stands even if the confirmation email does not go out.
        let notified = match self
            .notifications
            .subscribe(&customer.email, Some(&self.settings.coaching_tag))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(reference, error = %e, "booked but confirmation notification failed");
                false
            }
        };
        self.engine.complete_fulfillment(reference).await?;
        Ok(FulfillOutcome::Booked {
            meeting_url: status.meeting_url,
            notified,
        })
    }

    async fn deliver_guide(
        &self,
        reference: &str,
        customer: &Customer,
        tag: &str,
    ) -> Result<FulfillOutcome, FulfillmentError> {
        self.notifications
            .subscribe(&customer.email, Some(tag))
            .await
            .map_err(FulfillmentError::Notification)?;
        self.engine.complete_fulfillment(reference).await?;
        Ok(FulfillOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::HoldPolicy;
    use crate::external::MeetingStatus;

    /// 2025-06-02T16:00:00Z
    const T0: Ms = 1_748_880_000_000;

    #[derive(Default)]
    struct MockScheduling {
        calls: AtomicUsize,
        /// Scripted responses, consumed front to back; empty means confirmed.
        script: Mutex<Vec<Result<MeetingStatus, ExternalError>>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl SchedulingApi for MockScheduling {
        async fn create_meeting(
            &self,
            _request: &MeetingRequest,
        ) -> Result<MeetingStatus, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(MeetingStatus {
                    confirmed: true,
                    meeting_url: Some("https://meet.example/abc".into()),
                })
            } else {
                script.remove(0)
            }
        }
    }

    #[derive(Default)]
    struct MockNotifications {
        calls: Mutex<Vec<(String, Option<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationApi for MockNotifications {
        async fn subscribe(&self, email: &str, tag: Option<&str>) -> Result<(), ExternalError> {
            self.calls
                .lock()
                .unwrap()
                .push((email.to_string(), tag.map(str::to_string)));
            if self.fail {
                Err(ExternalError::Transient("mailer down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("holdfast_test_coordinator");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(
        name: &str,
        scheduling: MockScheduling,
        notifications: MockNotifications,
    ) -> (Arc<Coordinator>, Arc<MockScheduling>, Arc<MockNotifications>) {
        let clock = Arc::new(ManualClock::new(T0 - 3_600_000));
        let engine = Arc::new(
            Engine::new(test_wal_path(name), clock, HoldPolicy::default()).unwrap(),
        );
        engine
            .insert_intervals(&[Span::new(T0, T0 + SLOT_MS)])
            .await
            .unwrap();
        let scheduling = Arc::new(scheduling);
        let notifications = Arc::new(notifications);
        let coordinator = Arc::new(Coordinator::new(
            engine,
            scheduling.clone(),
            notifications.clone(),
            FulfillmentSettings::default(),
        ));
        (coordinator, scheduling, notifications)
    }

    fn call(reference: &str, status: PaymentStatus) -> PurchaseConfirmation {
        PurchaseConfirmation {
            reference: reference.into(),
            payment_status: status,
            customer: Customer {
                name: "Ada".into(),
                email: "ada@example.com".into(),
            },
            purchase: Purchase::CoachingCall {
                span: Span::new(T0, T0 + SLOT_MS),
                hold_token: None,
            },
            source: ConfirmationSource::Webhook,
        }
    }

    fn guide(reference: &str) -> PurchaseConfirmation {
        PurchaseConfirmation {
            purchase: Purchase::Guide {
                tag: "resume_guide".into(),
            },
            ..call(reference, PaymentStatus::Paid)
        }
    }

    #[tokio::test]
    async fn paid_call_books_once_and_notifies() {
        let (coord, sched, notes) =
            setup("paid_call.wal", MockScheduling::default(), MockNotifications::default()).await;

        let outcome = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap();
        assert_eq!(
            outcome,
            FulfillOutcome::Booked {
                meeting_url: Some("https://meet.example/abc".into()),
                notified: true
            }
        );
        let mut second = call("R", PaymentStatus::Paid);
        second.source = ConfirmationSource::Return;
        assert_eq!(
            coord.fulfill(&second).await.unwrap(),
            FulfillOutcome::AlreadyFulfilled
        );

        assert_eq!(sched.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            notes.calls.lock().unwrap().as_slice(),
            &[("ada@example.com".to_string(), Some("coaching_call".to_string()))]
        );
        let engine = coord.engine();
        assert!(engine.get_fulfillment("R").await.unwrap().is_fulfilled);
        assert!(engine.list_bookable(engine.now_ms()).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_create_one_meeting() {
        let sched = MockScheduling {
            delay_ms: 50,
            ..Default::default()
        };
        let (coord, sched, _) = setup("concurrent_fulfill.wal", sched, MockNotifications::default()).await;

        let a = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.fulfill(&call("R", PaymentStatus::Paid)).await })
        };
        let b = {
            let coord = coord.clone();
            let mut c = call("R", PaymentStatus::Paid);
            c.source = ConfirmationSource::Return;
            tokio::spawn(async move { coord.fulfill(&c).await })
        };
        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

        assert_eq!(sched.calls.load(Ordering::SeqCst), 1);
        let booked = outcomes
            .iter()
            .filter(|o| matches!(o, FulfillOutcome::Booked { .. }))
            .count();
        assert_eq!(booked, 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            FulfillOutcome::InProgress | FulfillOutcome::AlreadyFulfilled
        )));
    }

    #[tokio::test]
    async fn unpaid_leaves_record_open() {
        let (coord, sched, _) =
            setup("unpaid.wal", MockScheduling::default(), MockNotifications::default()).await;
        assert_eq!(
            coord.fulfill(&call("R", PaymentStatus::Unpaid)).await.unwrap(),
            FulfillOutcome::AwaitingPayment
        );
        assert_eq!(sched.calls.load(Ordering::SeqCst), 0);
        assert!(!coord.engine().get_fulfillment("R").await.unwrap().is_fulfilled);

        // Payment lands later; the same reference now fulfills.
        let outcome = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap();
        assert!(matches!(outcome, FulfillOutcome::Booked { .. }));
    }

    #[tokio::test]
    async fn meeting_failure_does_not_book_and_allows_retry() {
        let sched = MockScheduling {
            script: Mutex::new(vec![Err(ExternalError::Transient("503".into()))]),
            ..Default::default()
        };
        let (coord, sched, _) = setup("meeting_fail.wal", sched, MockNotifications::default()).await;

        let err = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Scheduling(ref e) if e.is_transient()));
        let engine = coord.engine();
        assert!(!engine.get_fulfillment("R").await.unwrap().is_fulfilled);
        assert_eq!(engine.list_bookable(engine.now_ms()).await.len(), 1);

        // Claim was released, so a replay succeeds.
        let outcome = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap();
        assert!(matches!(outcome, FulfillOutcome::Booked { .. }));
        assert_eq!(sched.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unconfirmed_meeting_is_an_error() {
        let sched = MockScheduling {
            script: Mutex::new(vec![Ok(MeetingStatus {
                confirmed: false,
                meeting_url: None,
            })]),
            ..Default::default()
        };
        let (coord, _, notes) = setup("meeting_unconfirmed.wal", sched, MockNotifications::default()).await;
        assert_eq!(
            coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap_err(),
            FulfillmentError::MeetingNotConfirmed
        );
        assert!(notes.calls.lock().unwrap().is_empty());
        assert!(!coord.engine().get_fulfillment("R").await.unwrap().is_fulfilled);
    }

    #[tokio::test]
    async fn notification_failure_after_booking_still_fulfills() {
        let notes = MockNotifications {
            fail: true,
            ..Default::default()
        };
        let (coord, _, _) = setup("notify_fail.wal", MockScheduling::default(), notes).await;
        let outcome = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap();
        assert!(matches!(outcome, FulfillOutcome::Booked { notified: false, .. }));
        assert!(coord.engine().get_fulfillment("R").await.unwrap().is_fulfilled);
    }

    #[tokio::test]
    async fn guide_delivery_subscribes_with_tag() {
        let (coord, sched, notes) =
            setup("guide.wal", MockScheduling::default(), MockNotifications::default()).await;
        assert_eq!(
            coord.fulfill(&guide("G")).await.unwrap(),
            FulfillOutcome::Delivered
        );
        assert_eq!(coord.fulfill(&guide("G")).await.unwrap(), FulfillOutcome::AlreadyFulfilled);
        assert_eq!(sched.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            notes.calls.lock().unwrap()[0].1.as_deref(),
            Some("resume_guide")
        );
    }

    #[tokio::test]
    async fn guide_notification_failure_leaves_record_open() {
        let notes = MockNotifications {
            fail: true,
            ..Default::default()
        };
        let (coord, _, _) = setup("guide_fail.wal", MockScheduling::default(), notes).await;
        assert!(matches!(
            coord.fulfill(&guide("G")).await,
            Err(FulfillmentError::Notification(_))
        ));
        assert!(!coord.engine().get_fulfillment("G").await.unwrap().is_fulfilled);
    }

    #[tokio::test]
    async fn metadata_describes_purchase() {
        let doc: serde_json::Value =
            serde_json::from_str(&call("R", PaymentStatus::Paid).metadata_json()).unwrap();
        assert_eq!(doc["product"], "coaching_call");
        assert_eq!(doc["start"], T0);
        assert_eq!(doc["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn held_call_books_with_its_token() {
        let (coord, sched, _) =
            setup("held_call.wal", MockScheduling::default(), MockNotifications::default()).await;
        let engine = coord.engine();
        let id = engine.list_bookable(engine.now_ms()).await[0].id;
        let token = engine.acquire_hold(id).await.unwrap().unwrap();

        let mut confirmation = call("R", PaymentStatus::Paid);
        confirmation.purchase = Purchase::CoachingCall {
            span: Span::new(T0, T0 + SLOT_MS),
            hold_token: Some(token),
        };
        let outcome = coord.fulfill(&confirmation).await.unwrap();
        assert!(matches!(outcome, FulfillOutcome::Booked { .. }));
        assert_eq!(sched.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_meeting_for_a_slot_held_by_someone_else() {
        let (coord, sched, notes) =
            setup("foreign_hold.wal", MockScheduling::default(), MockNotifications::default()).await;
        let engine = coord.engine();
        let id = engine.list_bookable(engine.now_ms()).await[0].id;
        let theirs = engine.acquire_hold(id).await.unwrap().unwrap();

        let err = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap_err();
        assert_eq!(err, FulfillmentError::Storage(StorageError::HeldByOther(id)));
        assert_eq!(sched.calls.load(Ordering::SeqCst), 0);
        assert!(notes.calls.lock().unwrap().is_empty());
        assert!(!engine.get_fulfillment("R").await.unwrap().is_fulfilled);
        // The other visitor still owns the slot.
        assert!(engine.extend_hold(id, &theirs).await.unwrap());
    }

    #[tokio::test]
    async fn no_meeting_for_a_slot_booked_by_another_purchase() {
        let (coord, sched, _) =
            setup("booked_elsewhere.wal", MockScheduling::default(), MockNotifications::default())
                .await;
        coord
            .engine()
            .mark_booked(Span::new(T0, T0 + SLOT_MS), "other", None)
            .await
            .unwrap();

        let err = coord.fulfill(&call("R", PaymentStatus::Paid)).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::Storage(StorageError::AlreadyBooked { .. })
        ));
        assert_eq!(sched.calls.load(Ordering::SeqCst), 0);
    }
}
