use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::gateway::{GatewayError, InitRequest, PaymentGateway};
use super::id::PaymentId;
use crate::error::{Classify, ErrorKind};
use crate::state::AppState;
use crate::store::{NewPayment, Store, StoreError, User};

/// How long the provider keeps the payment page open.
pub const REDIRECT_DUE: Duration = Duration::days(4);

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("amount must be a positive number of minor units, got {0}")]
    InvalidAmount(i64),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for InvoiceError {
    fn kind(&self) -> ErrorKind {
        match self {
            InvoiceError::InvalidAmount(_) => ErrorKind::Validation,
            InvoiceError::Gateway(e) => e.kind(),
            InvoiceError::Store(e) => e.kind(),
        }
    }
}

/// Order ids from wall-clock nanoseconds, strictly increasing within the process.
#[derive(Debug, Default)]
pub struct OrderIds {
    last: AtomicI64,
}

impl OrderIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: OffsetDateTime) -> i64 {
        let candidate = i64::try_from(now.unix_timestamp_nanos()).unwrap_or(i64::MAX);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(seen) => last = seen,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub payment_id: PaymentId,
    pub order_id: String,
    pub amount: i64,
    pub status: String,
    pub payment_url: String,
}

#[derive(Clone)]
pub struct InvoiceService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn Store>,
    orders: Arc<OrderIds>,
}

impl FromRef<AppState> for InvoiceService {
    fn from_ref(state: &AppState) -> Self {
        Self {
            gateway: state.gateway.clone(),
            store: state.store.clone(),
            orders: state.orders.clone(),
        }
    }
}

impl InvoiceService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn Store>,
        orders: Arc<OrderIds>,
    ) -> Self {
        Self {
            gateway,
            store,
            orders,
        }
    }

    /// Opens a payment with the provider and records it as `NEW` before
    /// returning, so a confirmation can never arrive for an unknown row.
    pub async fn create(
        &self,
        user: &User,
        amount: i64,
        now: OffsetDateTime,
    ) -> Result<Invoice, InvoiceError> {
        if amount <= 0 {
            return Err(InvoiceError::InvalidAmount(amount));
        }
        let order_id = self.orders.next(now).to_string();
        let request = InitRequest::top_up(
            amount,
            order_id.clone(),
            user.name.clone(),
            user.email.clone(),
            now + REDIRECT_DUE,
        );
        let response = self.gateway.init(&request).await?;

        let payment = self
            .store
            .insert_payment(NewPayment {
                payment_id: response.payment_id,
                user_id: user.id,
                amount,
            })
            .await?;
        info!(
            user_id = %user.id,
            payment_id = %payment.payment_id,
            %order_id,
            amount,
            "invoice created"
        );

        Ok(Invoice {
            payment_id: payment.payment_id,
            order_id,
            amount,
            status: response.status,
            payment_url: response.payment_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::gateway::InitResponse;
    use crate::store::{MemoryStore, NewAccount, PaymentStatus};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeGateway {
        seen: Mutex<Vec<InitRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn init(&self, request: &InitRequest) -> Result<InitResponse, GatewayError> {
            if self.fail {
                return Err(GatewayError::Rejected {
                    code: "99".into(),
                    message: "declined".into(),
                });
            }
            let mut seen = self.seen.lock().unwrap();
            seen.push(request.clone());
            Ok(InitResponse {
                payment_id: PaymentId::new(1000 + seen.len() as i64).unwrap(),
                order_id: request.order_id.clone(),
                status: "NEW".into(),
                payment_url: format!("https://pay.local/{}", request.order_id),
            })
        }

        fn verify_notification(&self, _params: &Map<String, Value>) -> bool {
            true
        }
    }

    async fn user(store: &MemoryStore) -> User {
        store
            .create_account(
                NewAccount {
                    id: Uuid::new_v4(),
                    name: "Petrov Ivan".into(),
                    email: "ivan@example.com".into(),
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
            .unwrap()
    }

    #[test]
    fn order_ids_strictly_increase_on_a_frozen_clock() {
        let ids = OrderIds::new();
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let a = ids.next(now);
        let b = ids.next(now);
        let c = ids.next(now - Duration::seconds(5));
        assert_eq!(a, 1_700_000_000_000_000_000);
        assert!(b > a && c > b);
    }

    #[tokio::test]
    async fn invoice_records_new_payment_before_returning() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let service =
            InvoiceService::new(gateway.clone(), store.clone(), Arc::new(OrderIds::new()));
        let owner = user(&store).await;
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        let invoice = service.create(&owner, 10000, now).await.unwrap();
        assert_eq!(invoice.amount, 10000);
        assert!(invoice.payment_url.ends_with(&invoice.order_id));

        let payment = store.find_payment(invoice.payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::New);
        assert_eq!(payment.user_id, owner.id);
        assert_eq!(payment.amount, 10000);

        let seen = gateway.seen.lock().unwrap();
        assert_eq!(seen[0].customer_key, "Petrov Ivan");
        assert_eq!(seen[0].receipt.email, "ivan@example.com");
        assert_eq!(seen[0].redirect_due_date, now + Duration::days(4));
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected_before_the_gateway() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let service =
            InvoiceService::new(gateway.clone(), store.clone(), Arc::new(OrderIds::new()));
        let owner = user(&store).await;

        for amount in [0, -100] {
            let err = service
                .create(&owner, amount, OffsetDateTime::now_utc())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(gateway.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_records_nothing() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway {
            fail: true,
            ..Default::default()
        });
        let service = InvoiceService::new(gateway, store.clone(), Arc::new(OrderIds::new()));
        let owner = user(&store).await;

        let err = service
            .create(&owner, 500, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(store
            .find_payment(PaymentId::new(1001).unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
