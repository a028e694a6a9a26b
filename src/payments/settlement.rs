//! Turns provider confirmations into balance credits.
//!
//! The status flip, the billing increment and the ledger append happen inside a
//! single [`Store::settle_payment`] call whose `WHERE status = 'NEW'` predicate is
//! the idempotency guard. Redelivered confirmations miss it and are acknowledged
//! without touching the ledger.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::FromRef;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::gateway::PaymentGateway;
use super::id::{PaymentId, PaymentIdError};
use crate::error::{Classify, ErrorKind};
use crate::sessions::{notify_best_effort, SessionNotifier};
use crate::state::AppState;
use crate::store::{LedgerEntry, Payment, PaymentStatus, Settlement, Store, StoreError};

/// Provider status that moves a payment to `applied`.
pub const CONFIRMED: &str = "CONFIRMED";

/// Pushed to the payer's live session after a credit.
pub const BALANCE_ADDED: &str = "BalanceAdded";

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("{0}")]
    MalformedPaymentId(#[from] PaymentIdError),
    #[error("malformed notification: {0}")]
    MalformedBody(String),
    #[error("notification signature mismatch")]
    BadSignature,
    #[error("payment {0} not found or already settled")]
    NotFoundOrAlreadySettled(PaymentId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for SettlementError {
    fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::MalformedPaymentId(_) | SettlementError::MalformedBody(_) => {
                ErrorKind::Validation
            }
            SettlementError::BadSignature => ErrorKind::Auth,
            SettlementError::NotFoundOrAlreadySettled(_) => ErrorKind::NotFound,
            SettlementError::Store(e) => e.kind(),
        }
    }
}

/// The two fields of a provider notification this service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub payment_id: PaymentId,
    pub status: String,
}

impl Notification {
    pub fn parse(body: &Map<String, Value>) -> Result<Self, SettlementError> {
        let payment_id = PaymentId::from_json(body.get("PaymentId"))?;
        let status = match body.get("Status") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(SettlementError::MalformedBody("Status is not a string".into())),
            None => return Err(SettlementError::MalformedBody("Status is missing".into())),
        };
        Ok(Self { payment_id, status })
    }
}

#[derive(Debug)]
pub enum SettlementOutcome {
    /// Not a confirmation; nothing to do.
    Ignored,
    Credited(Settlement),
    /// A redelivered confirmation for a payment that is already `applied`.
    AlreadySettled,
}

impl SettlementOutcome {
    pub fn describe(&self) -> &'static str {
        match self {
            SettlementOutcome::Ignored => "ignored",
            SettlementOutcome::Credited(_) => "balance credited",
            SettlementOutcome::AlreadySettled => "already settled",
        }
    }
}

/// Minor units (kopecks) to the ledger's unit, exactly.
pub fn minor_to_major(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

#[derive(Clone)]
pub struct SettlementProcessor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn SessionNotifier>,
    verifier: Option<Arc<dyn PaymentGateway>>,
}

impl FromRef<AppState> for SettlementProcessor {
    fn from_ref(state: &AppState) -> Self {
        let verifier = state
            .config
            .payment
            .verify_notifications
            .then(|| state.gateway.clone());
        Self {
            store: state.store.clone(),
            notifier: state.notifier.clone(),
            verifier,
        }
    }
}

impl SettlementProcessor {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn SessionNotifier>) -> Self {
        Self {
            store,
            notifier,
            verifier: None,
        }
    }

    /// Rejects notifications whose `Token` does not check out against `gateway`.
    pub fn with_signature_check(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.verifier = Some(gateway);
        self
    }

    /// Entry point for a raw callback body.
    pub async fn handle(&self, body: &Value) -> Result<SettlementOutcome, SettlementError> {
        let Value::Object(fields) = body else {
            return Err(SettlementError::MalformedBody("expected a JSON object".into()));
        };
        let notification = Notification::parse(fields)?;
        if let Some(gateway) = &self.verifier {
            if !gateway.verify_notification(fields) {
                return Err(SettlementError::BadSignature);
            }
        }
        self.apply(&notification).await
    }

    #[instrument(
        skip(self, notification),
        fields(payment_id = %notification.payment_id, status = %notification.status)
    )]
    pub async fn apply(
        &self,
        notification: &Notification,
    ) -> Result<SettlementOutcome, SettlementError> {
        if notification.status != CONFIRMED {
            debug!("non-confirming notification acknowledged");
            return Ok(SettlementOutcome::Ignored);
        }

        let payment_id = notification.payment_id;
        let entry_for =
            |p: &Payment| LedgerEntry::card_top_up(p.user_id, minor_to_major(p.amount));
        let settled = self
            .store
            .settle_payment(payment_id, &entry_for)
            .await
            .map_err(|e| {
                error!(error = %e, "settlement rolled back");
                e
            })?;

        match settled {
            Some(settlement) => {
                info!(
                    user_id = %settlement.payment.user_id,
                    credited = %settlement.transaction.amount,
                    balance = %settlement.balance,
                    "payment settled"
                );
                notify_best_effort(
                    self.notifier.as_ref(),
                    settlement.session.as_deref(),
                    BALANCE_ADDED,
                )
                .await;
                Ok(SettlementOutcome::Credited(settlement))
            }
            None => match self.store.find_payment(payment_id).await? {
                Some(p) if p.status == PaymentStatus::Applied => {
                    info!("duplicate confirmation acknowledged");
                    Ok(SettlementOutcome::AlreadySettled)
                }
                _ => Err(SettlementError::NotFoundOrAlreadySettled(payment_id)),
            },
        }
    }

    /// Fails `NEW` payments created more than `ttl` before `now`.
    pub async fn expire_stale(
        &self,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let failed = self.store.fail_stale_payments(now - ttl).await?;
        if failed > 0 {
            info!(failed, ttl_hours = ttl.whole_hours(), "stale payments failed");
        }
        Ok(failed)
    }
}

/// Shortest period the sweeper accepts; `tokio::time::interval` panics on zero.
pub const MIN_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Runs [`SettlementProcessor::expire_stale`] every `every`, but never more often
/// than [`MIN_SWEEP_INTERVAL`].
pub fn spawn_sweeper(
    processor: SettlementProcessor,
    ttl: Duration,
    every: StdDuration,
) -> JoinHandle<()> {
    let every = every.max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = processor.expire_stale(OffsetDateTime::now_utc(), ttl).await {
                error!(error = %e, "stale payment sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::NotifyError;
    use crate::store::{MemoryStore, NewAccount, NewPayment};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SessionNotifier for RecordingNotifier {
        async fn send(&self, session: &str, message: &str) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((session.to_string(), message.to_string()));
            Ok(())
        }
    }

    struct BrokenNotifier;

    #[async_trait]
    impl SessionNotifier for BrokenNotifier {
        async fn send(&self, session: &str, _message: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Closed(session.to_string()))
        }
    }

    async fn user_with_session(store: &MemoryStore, session: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_account(
                NewAccount {
                    id,
                    name: "Petrov Ivan".into(),
                    email: format!("{id}@example.com"),
                    password_hash: "hash".into(),
                    verified: true,
                    is_bot: false,
                    verification_code: None,
                    bot_token: None,
                    storage: "dir".into(),
                    photo: "dir/default.jpg".into(),
                    device_ios: None,
                    device_ios_voip: None,
                },
                None,
            )
            .await
            .unwrap();
        if let Some(s) = session {
            store.open_session(id, Some(s)).await.unwrap();
        }
        id
    }

    async fn new_payment(store: &MemoryStore, user_id: Uuid, id: i64, amount: i64) -> PaymentId {
        let payment_id = PaymentId::new(id).unwrap();
        store
            .insert_payment(NewPayment {
                payment_id,
                user_id,
                amount,
            })
            .await
            .unwrap();
        payment_id
    }

    fn confirmed(id: PaymentId) -> Notification {
        Notification {
            payment_id: id,
            status: CONFIRMED.into(),
        }
    }

    #[tokio::test]
    async fn string_payment_id_confirmation_credits_major_units() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let user = user_with_session(&store, Some("sess-1")).await;
        let id = new_payment(&store, user, 12345, 10000).await;
        let processor = SettlementProcessor::new(store.clone(), notifier.clone());

        let outcome = processor
            .handle(&json!({"PaymentId": "12345", "Status": "CONFIRMED"}))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Credited(_)));

        let payment = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Applied);
        assert_eq!(store.balance(user).await.unwrap(), Some(dec!(100.00)));
        let txs = store.transactions_for(user).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, dec!(100.00));
        assert_eq!(txs[0].module, "Payment");
        assert_eq!(txs[0].kind, "profit");
        assert_eq!(txs[0].status, "CLOSED_1");
        assert_eq!(
            notifier.sent.lock().unwrap().as_slice(),
            &[("sess-1".to_string(), BALANCE_ADDED.to_string())]
        );
    }

    #[tokio::test]
    async fn duplicate_confirmation_credits_once_and_is_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 7, 2500).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let first = processor.apply(&confirmed(id)).await.unwrap();
        let second = processor.apply(&confirmed(id)).await.unwrap();
        assert!(matches!(first, SettlementOutcome::Credited(_)));
        assert!(matches!(second, SettlementOutcome::AlreadySettled));

        assert_eq!(store.balance(user).await.unwrap(), Some(dec!(25.00)));
        assert_eq!(store.transactions_for(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_credit_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 99, 10000).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let p = processor.clone();
                tokio::spawn(async move { p.apply(&confirmed(id)).await })
            })
            .collect();

        let mut credited = 0;
        for t in tasks {
            if let SettlementOutcome::Credited(_) = t.await.unwrap().unwrap() {
                credited += 1;
            }
        }
        assert_eq!(credited, 1);
        assert_eq!(store.balance(user).await.unwrap(), Some(dec!(100.00)));
        assert_eq!(store.transactions_for(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let err = processor
            .apply(&confirmed(PaymentId::new(404).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFoundOrAlreadySettled(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(store.balance(user).await.unwrap(), Some(Decimal::ZERO));
        assert!(store.transactions_for(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_payment_is_not_settled() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 5, 100).await;
        store
            .fail_stale_payments(OffsetDateTime::now_utc() + Duration::hours(1))
            .await
            .unwrap();
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let err = processor.apply(&confirmed(id)).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotFoundOrAlreadySettled(_)));
    }

    #[tokio::test]
    async fn non_confirming_status_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 8, 100).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let outcome = processor
            .apply(&Notification {
                payment_id: id,
                status: "AUTHORIZED".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Ignored));
        let payment = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::New);
    }

    #[tokio::test]
    async fn ledger_failure_rolls_back_and_redelivery_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 11, 5000).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        store.fail_ledger_writes(true);
        let err = processor.apply(&confirmed(id)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        let payment = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::New);
        assert_eq!(store.balance(user).await.unwrap(), Some(Decimal::ZERO));
        assert!(store.transactions_for(user).await.unwrap().is_empty());

        store.fail_ledger_writes(false);
        let outcome = processor.apply(&confirmed(id)).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Credited(_)));
        assert_eq!(store.balance(user).await.unwrap(), Some(dec!(50.00)));
    }

    #[tokio::test]
    async fn notifier_failure_keeps_the_credit() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, Some("dead-socket")).await;
        let id = new_payment(&store, user, 12, 300).await;
        let processor = SettlementProcessor::new(store.clone(), Arc::new(BrokenNotifier));

        let outcome = processor.apply(&confirmed(id)).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Credited(_)));
        assert_eq!(store.balance(user).await.unwrap(), Some(dec!(3.00)));
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let store = Arc::new(MemoryStore::new());
        let processor = SettlementProcessor::new(store, Arc::new(RecordingNotifier::default()));

        for body in [
            json!([1, 2]),
            json!({"Status": "CONFIRMED"}),
            json!({"PaymentId": 1.5, "Status": "CONFIRMED"}),
            json!({"PaymentId": true, "Status": "CONFIRMED"}),
            json!({"PaymentId": 1}),
            json!({"PaymentId": 1, "Status": 3}),
        ] {
            let err = processor.handle(&body).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{body}");
        }
    }

    struct PasswordChecker;

    #[async_trait]
    impl PaymentGateway for PasswordChecker {
        async fn init(
            &self,
            _request: &crate::payments::gateway::InitRequest,
        ) -> Result<crate::payments::gateway::InitResponse, crate::payments::gateway::GatewayError>
        {
            unreachable!("not used by settlement")
        }

        fn verify_notification(&self, params: &Map<String, Value>) -> bool {
            crate::payments::gateway::verify_signature(params, "pw")
        }
    }

    #[tokio::test]
    async fn signature_check_rejects_forged_notifications() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 31, 1000).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()))
                .with_signature_check(Arc::new(PasswordChecker));

        let forged = json!({"PaymentId": 31, "Status": "CONFIRMED", "Token": "deadbeef"});
        let err = processor.handle(&forged).await.unwrap_err();
        assert!(matches!(err, SettlementError::BadSignature));
        assert_eq!(
            store.find_payment(id).await.unwrap().unwrap().status,
            PaymentStatus::New
        );

        let mut fields = match json!({"PaymentId": 31, "Status": "CONFIRMED"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let token = crate::payments::gateway::sign(&fields, "pw");
        fields.insert("Token".into(), Value::String(token));
        let outcome = processor.handle(&Value::Object(fields)).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Credited(_)));
    }

    #[tokio::test]
    async fn expire_stale_uses_ttl_cutoff() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 21, 100).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));

        let now = OffsetDateTime::now_utc();
        assert_eq!(processor.expire_stale(now, Duration::hours(96)).await.unwrap(), 0);
        let later = now + Duration::hours(97);
        assert_eq!(processor.expire_stale(later, Duration::hours(96)).await.unwrap(), 1);
        let payment = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn sweeper_survives_a_zero_interval() {
        let store = Arc::new(MemoryStore::new());
        let user = user_with_session(&store, None).await;
        let id = new_payment(&store, user, 22, 100).await;
        let processor =
            SettlementProcessor::new(store.clone(), Arc::new(RecordingNotifier::default()));
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let sweeper = spawn_sweeper(processor, Duration::ZERO, StdDuration::ZERO);
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        assert!(!sweeper.is_finished());
        sweeper.abort();
        let payment = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[test]
    fn minor_units_convert_exactly() {
        assert_eq!(minor_to_major(10000), dec!(100.00));
        assert_eq!(minor_to_major(1), dec!(0.01));
        assert_eq!(minor_to_major(12345), dec!(123.45));
    }
}
