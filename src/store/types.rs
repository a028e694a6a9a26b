use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::payments::PaymentId;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String, // always lowercased
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub verified: bool,
    #[serde(skip_serializing)]
    pub verification_code: Option<String>,
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    /// Messenger handle linked through the bot token.
    pub bot_name: Option<String>,
    pub is_bot: bool,
    #[serde(skip_serializing)]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub password_reset_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub session: Option<String>,
    pub online: bool,
    pub storage: String,
    pub photo: String,
    #[serde(skip_serializing)]
    pub device_ios: Option<String>,
    #[serde(skip_serializing)]
    pub device_ios_voip: Option<String>,
    pub created_at: OffsetDateTime,
}

pub(crate) const USER_COLUMNS: &str = "id, name, email, password_hash, role, verified, \
    verification_code, bot_token, bot_name, is_bot, password_reset_token, password_reset_at, \
    session, online, storage, photo, device_ios, device_ios_voip, created_at";

/// Everything needed to insert a user row.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    /// Verified accounts also get their profile row at creation.
    pub verified: bool,
    pub is_bot: bool,
    pub verification_code: Option<String>,
    pub bot_token: Option<String>,
    pub storage: String,
    pub photo: String,
    pub device_ios: Option<String>,
    pub device_ios_voip: Option<String>,
}

#[derive(Debug)]
pub enum VerificationOutcome {
    Verified(User),
    AlreadyVerified,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "applied")]
    Applied,
    #[serde(rename = "failed")]
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::New => "NEW",
            PaymentStatus::Applied => "applied",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.as_str() {
            "NEW" => Ok(PaymentStatus::New),
            "applied" => Ok(PaymentStatus::Applied),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(format!("unknown payment status {raw:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
    #[sqlx(try_from = "String")]
    pub payment_id: PaymentId,
    pub user_id: Uuid,
    /// Minor units (kopecks, cents).
    pub amount: i64,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payment_id: PaymentId,
    pub user_id: Uuid,
    pub amount: i64,
}

/// Append-only ledger row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total: String,
    pub amount: Decimal,
    pub description: String,
    pub module: String,
    pub kind: String,
    pub status: String,
    pub created_at: OffsetDateTime,
}

/// A balance adjustment together with the transaction that explains it.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub description: &'static str,
    pub module: &'static str,
    pub kind: &'static str,
    pub status: &'static str,
}

/// Finalized, no further action.
pub const STATUS_CLOSED: &str = "CLOSED_1";

impl LedgerEntry {
    pub fn card_top_up(user_id: Uuid, amount: Decimal) -> Self {
        Self {
            user_id,
            amount,
            description: "Card top-up",
            module: "Payment",
            kind: "profit",
            status: STATUS_CLOSED,
        }
    }

    pub fn signup_bonus(user_id: Uuid, amount: Decimal) -> Self {
        Self {
            user_id,
            amount,
            description: "Registration bonus",
            module: "Registration",
            kind: "profit",
            status: STATUS_CLOSED,
        }
    }

    pub(crate) fn into_transaction(self, now: OffsetDateTime) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            total: "0".into(),
            amount: self.amount,
            description: self.description.into(),
            module: self.module.into(),
            kind: self.kind.into(),
            status: self.status.into(),
            created_at: now,
        }
    }
}

/// What a successful settlement wrote.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment: Payment,
    pub transaction: Transaction,
    pub balance: Decimal,
    /// Session handle of the paying user at settlement time.
    pub session: Option<String>,
}
