//! Persistence port.
//!
//! Every write that must not race is a single conditional statement or a single
//! database transaction behind one method, so callers never do read-then-write.

mod memory;
mod postgres;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};
use crate::payments::PaymentId;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use types::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Database(_) | StoreError::Corrupt(_) => ErrorKind::Internal,
        }
    }
}

/// Builds the ledger entry for a payment being settled.
pub type EntryFor<'a> = &'a (dyn Fn(&Payment) -> LedgerEntry + Send + Sync);

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts the user, its billing row and, when given, the opening ledger entry.
    /// Verified accounts also get their profile row. All or nothing.
    async fn create_account(
        &self,
        account: NewAccount,
        opening: Option<LedgerEntry>,
    ) -> Result<User, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Clears the code, marks the user verified and creates the profile, atomically.
    async fn consume_verification_code(
        &self,
        code: &str,
    ) -> Result<VerificationOutcome, StoreError>;

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Installs `password_hash` for the user holding `token` if it has not expired
    /// at `now`, clearing the token in the same write. Returns the user id.
    async fn consume_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Marks the user online with the given session handle, or none.
    async fn open_session(&self, user_id: Uuid, session: Option<&str>) -> Result<(), StoreError>;

    /// Clears the session handle.
    async fn close_session(&self, user_id: Uuid) -> Result<(), StoreError>;

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StoreError>;

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError>;

    /// Moves the payment from `NEW` to `applied`, adds the entry amount to the
    /// owner's balance and appends the transaction, as one unit. `None` when no
    /// `NEW` payment with that id exists.
    async fn settle_payment(
        &self,
        payment_id: PaymentId,
        entry_for: EntryFor<'_>,
    ) -> Result<Option<Settlement>, StoreError>;

    /// Moves `NEW` payments created before `cutoff` to `failed`.
    async fn fail_stale_payments(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;

    async fn balance(&self, user_id: Uuid) -> Result<Option<Decimal>, StoreError>;

    /// Newest first.
    async fn transactions_for(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError>;
}
