use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    EntryFor, LedgerEntry, NewAccount, NewPayment, Payment, PaymentStatus, Settlement, Store,
    StoreError, Transaction, User, VerificationOutcome,
};
use crate::payments::PaymentId;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    profiles: HashSet<Uuid>,
    billing: HashMap<Uuid, Decimal>,
    transactions: Vec<Transaction>,
    payments: HashMap<PaymentId, Payment>,
}

impl Inner {
    fn user_by_email(&self, email: &str) -> Option<&User> {
        let email = email.to_lowercase();
        self.users.values().find(|u| u.email == email)
    }
}

/// Store backed by process memory. A single lock around all tables makes every
/// method one atomic step.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    #[cfg(test)]
    fail_ledger: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next ledger write fail, to exercise rollback.
    #[cfg(test)]
    pub(crate) fn fail_ledger_writes(&self, fail: bool) {
        self.fail_ledger
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn ledger_write_fails(&self) -> bool {
        self.fail_ledger.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn ledger_write_fails(&self) -> bool {
        false
    }

    pub fn has_profile(&self, user_id: Uuid) -> bool {
        self.lock().profiles.contains(&user_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_account(
        &self,
        account: NewAccount,
        opening: Option<LedgerEntry>,
    ) -> Result<User, StoreError> {
        let mut inner = self.lock();
        let email = account.email.to_lowercase();
        if inner.user_by_email(&email).is_some() || inner.users.contains_key(&account.id) {
            return Err(StoreError::Conflict("user"));
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: account.id,
            name: account.name,
            email,
            password_hash: account.password_hash,
            role: "user".into(),
            verified: account.verified,
            verification_code: account.verification_code,
            bot_token: account.bot_token,
            bot_name: None,
            is_bot: account.is_bot,
            password_reset_token: None,
            password_reset_at: None,
            session: None,
            online: false,
            storage: account.storage,
            photo: account.photo,
            device_ios: account.device_ios,
            device_ios_voip: account.device_ios_voip,
            created_at: now,
        };

        let opening_amount = opening.as_ref().map(|e| e.amount).unwrap_or(Decimal::ZERO);
        inner.billing.insert(user.id, opening_amount);
        if let Some(entry) = opening {
            inner.transactions.push(entry.into_transaction(now));
        }
        if account.verified {
            inner.profiles.insert(user.id);
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock().user_by_email(email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn consume_verification_code(
        &self,
        code: &str,
    ) -> Result<VerificationOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(user) = inner
            .users
            .values_mut()
            .find(|u| u.verification_code.as_deref() == Some(code))
        else {
            return Ok(VerificationOutcome::NotFound);
        };
        if user.verified {
            return Ok(VerificationOutcome::AlreadyVerified);
        }
        user.verification_code = None;
        user.verified = true;
        let user = user.clone();
        inner.profiles.insert(user.id);
        Ok(VerificationOutcome::Verified(user))
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.password_reset_token = Some(token.to_string());
        user.password_reset_at = Some(expires_at);
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut inner = self.lock();
        let user = inner.users.values_mut().find(|u| {
            u.password_reset_token.as_deref() == Some(token)
                && u.password_reset_at.is_some_and(|at| at > now)
        });
        Ok(user.map(|u| {
            u.password_hash = password_hash.to_string();
            u.password_reset_token = None;
            u.password_reset_at = None;
            u.id
        }))
    }

    async fn open_session(&self, user_id: Uuid, session: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.session = session.map(str::to_string);
        user.online = true;
        Ok(())
    }

    async fn close_session(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.session = None;
        Ok(())
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut inner = self.lock();
        if inner.payments.contains_key(&payment.payment_id) {
            return Err(StoreError::Conflict("payment"));
        }
        let now = OffsetDateTime::now_utc();
        let row = Payment {
            payment_id: payment.payment_id,
            user_id: payment.user_id,
            amount: payment.amount,
            status: PaymentStatus::New,
            created_at: now,
            updated_at: now,
        };
        inner.payments.insert(row.payment_id, row.clone());
        Ok(row)
    }

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.lock().payments.get(&payment_id).cloned())
    }

    async fn settle_payment(
        &self,
        payment_id: PaymentId,
        entry_for: EntryFor<'_>,
    ) -> Result<Option<Settlement>, StoreError> {
        let mut inner = self.lock();
        let Some(current) = inner
            .payments
            .get(&payment_id)
            .filter(|p| p.status == PaymentStatus::New)
            .cloned()
        else {
            return Ok(None);
        };

        // Nothing is written until every step is known to succeed.
        let entry = entry_for(&current);
        if self.ledger_write_fails() {
            return Err(StoreError::Corrupt("injected ledger failure".into()));
        }
        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            status: PaymentStatus::Applied,
            updated_at: now,
            ..current
        };
        let balance = {
            let slot = inner.billing.entry(entry.user_id).or_insert(Decimal::ZERO);
            *slot += entry.amount;
            *slot
        };
        let transaction = entry.into_transaction(now);
        inner.transactions.push(transaction.clone());
        inner.payments.insert(payment_id, payment.clone());
        let session = inner
            .users
            .get(&payment.user_id)
            .and_then(|u| u.session.clone());

        Ok(Some(Settlement {
            payment,
            transaction,
            balance,
            session,
        }))
    }

    async fn fail_stale_payments(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let now = OffsetDateTime::now_utc();
        let mut failed = 0;
        for payment in inner.payments.values_mut() {
            if payment.status == PaymentStatus::New && payment.created_at < cutoff {
                payment.status = PaymentStatus::Failed;
                payment.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn balance(&self, user_id: Uuid) -> Result<Option<Decimal>, StoreError> {
        Ok(self.lock().billing.get(&user_id).copied())
    }

    async fn transactions_for(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account(email: &str) -> NewAccount {
        NewAccount {
            id: Uuid::new_v4(),
            name: "Ivan Petrov".into(),
            email: email.into(),
            password_hash: "hash".into(),
            verified: false,
            is_bot: false,
            verification_code: Some("code-1".into()),
            bot_token: None,
            storage: "dir".into(),
            photo: "dir/default.jpg".into(),
            device_ios: None,
            device_ios_voip: None,
        }
    }

    #[tokio::test]
    async fn emails_are_unique_case_insensitively() {
        let store = MemoryStore::new();
        store.create_account(account("a@example.com"), None).await.unwrap();
        let err = store
            .create_account(account("A@Example.com"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict("user")));
        assert!(store.find_user_by_email("A@EXAMPLE.COM").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn opening_entry_funds_billing_and_ledger() {
        let store = MemoryStore::new();
        let acc = account("b@example.com");
        let id = acc.id;
        store
            .create_account(acc, Some(LedgerEntry::signup_bonus(id, dec!(100))))
            .await
            .unwrap();
        assert_eq!(store.balance(id).await.unwrap(), Some(dec!(100)));
        let txs = store.transactions_for(id).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].module, "Registration");
        assert!(!store.has_profile(id));
    }

    #[tokio::test]
    async fn stale_sweep_only_touches_old_new_payments() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let id = PaymentId::new(7).unwrap();
        store
            .insert_payment(NewPayment { payment_id: id, user_id: user, amount: 500 })
            .await
            .unwrap();

        let past = OffsetDateTime::now_utc() - time::Duration::hours(1);
        assert_eq!(store.fail_stale_payments(past).await.unwrap(), 0);

        let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
        assert_eq!(store.fail_stale_payments(future).await.unwrap(), 1);
        let p = store.find_payment(id).await.unwrap().unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
        assert_eq!(store.fail_stale_payments(future).await.unwrap(), 0);
    }
}
