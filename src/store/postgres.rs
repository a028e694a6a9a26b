use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{
    EntryFor, LedgerEntry, NewAccount, NewPayment, Payment, Settlement, Store, StoreError,
    Transaction, User, VerificationOutcome, USER_COLUMNS,
};
use crate::payments::PaymentId;

const PAYMENT_COLUMNS: &str = "payment_id, user_id, amount, status, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, user_id, total, amount, description, module, kind, status, created_at";

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn unique_violation(err: sqlx::Error, what: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what),
        _ => StoreError::Database(err),
    }
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    entry: LedgerEntry,
) -> Result<Transaction, StoreError> {
    let sql = format!(
        "INSERT INTO transactions (id, user_id, total, amount, description, module, kind, status) \
         VALUES ($1, $2, '0', $3, $4, $5, $6, $7) RETURNING {TRANSACTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.description)
        .bind(entry.module)
        .bind(entry.kind)
        .bind(entry.status)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row)
}

/// Atomic increment; creates the billing row on first credit.
async fn credit_balance(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: Decimal,
) -> Result<Decimal, StoreError> {
    let balance: Decimal = sqlx::query_scalar(
        r#"
        INSERT INTO billing (user_id, amount)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET amount = billing.amount + EXCLUDED.amount
        RETURNING amount
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_one(&mut **tx)
    .await?;
    Ok(balance)
}

async fn insert_profile(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO profiles (id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn create_account(
        &self,
        account: NewAccount,
        opening: Option<LedgerEntry>,
    ) -> Result<User, StoreError> {
        let mut tx = self.db.begin().await?;

        let sql = format!(
            "INSERT INTO users (id, name, email, password_hash, verified, is_bot, \
             verification_code, bot_token, storage, photo, device_ios, device_ios_voip) \
             VALUES ($1, $2, lower($3), $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(account.id)
            .bind(&account.name)
            .bind(&account.email)
            .bind(&account.password_hash)
            .bind(account.verified)
            .bind(account.is_bot)
            .bind(&account.verification_code)
            .bind(&account.bot_token)
            .bind(&account.storage)
            .bind(&account.photo)
            .bind(&account.device_ios)
            .bind(&account.device_ios_voip)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| unique_violation(e, "user"))?;

        match opening {
            Some(entry) => {
                credit_balance(&mut tx, user.id, entry.amount).await?;
                insert_transaction(&mut tx, entry).await?;
            }
            None => {
                credit_balance(&mut tx, user.id, Decimal::ZERO).await?;
            }
        }

        if account.verified {
            insert_profile(&mut tx, user.id).await?;
        }

        tx.commit().await?;
        debug!(user_id = %user.id, "account row created");
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = lower($1)");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn consume_verification_code(
        &self,
        code: &str,
    ) -> Result<VerificationOutcome, StoreError> {
        let mut tx = self.db.begin().await?;

        let sql = format!(
            "UPDATE users SET verification_code = NULL, verified = TRUE \
             WHERE verification_code = $1 AND verified = FALSE \
             RETURNING {USER_COLUMNS}"
        );
        let verified = sqlx::query_as::<_, User>(&sql)
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(user) = verified else {
            let already: Option<bool> =
                sqlx::query_scalar("SELECT verified FROM users WHERE verification_code = $1")
                    .bind(code)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match already {
                Some(true) => VerificationOutcome::AlreadyVerified,
                _ => VerificationOutcome::NotFound,
            });
        };

        insert_profile(&mut tx, user.id).await?;
        tx.commit().await?;
        Ok(VerificationOutcome::Verified(user))
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users SET password_reset_token = $2, password_reset_at = $3
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(&self.db)
        .await
        .map_err(|e| unique_violation(e, "reset token"))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE users
               SET password_hash = $3, password_reset_token = NULL, password_reset_at = NULL
             WHERE password_reset_token = $1 AND password_reset_at > $2
            RETURNING id
            "#,
        )
        .bind(token)
        .bind(now)
        .bind(password_hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(id)
    }

    async fn open_session(&self, user_id: Uuid, session: Option<&str>) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE users SET session = $2, online = TRUE WHERE id = $1")
            .bind(user_id)
            .bind(session)
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    async fn close_session(&self, user_id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE users SET session = NULL WHERE id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let sql = format!(
            "INSERT INTO payments (payment_id, user_id, amount, status) \
             VALUES ($1, $2, $3, 'NEW') RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Payment>(&sql)
            .bind(payment.payment_id.to_string())
            .bind(payment.user_id)
            .bind(payment.amount)
            .fetch_one(&self.db)
            .await
            .map_err(|e| unique_violation(e, "payment"))?;
        Ok(row)
    }

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1");
        let row = sqlx::query_as::<_, Payment>(&sql)
            .bind(payment_id.to_string())
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    async fn settle_payment(
        &self,
        payment_id: PaymentId,
        entry_for: EntryFor<'_>,
    ) -> Result<Option<Settlement>, StoreError> {
        let mut tx = self.db.begin().await?;

        // The row lock taken here is held until commit; a concurrent delivery
        // blocks on it and then no longer matches status = 'NEW'.
        let sql = format!(
            "UPDATE payments SET status = 'applied', updated_at = now() \
             WHERE payment_id = $1 AND status = 'NEW' \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(payment_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(payment) = payment else {
            tx.rollback().await?;
            return Ok(None);
        };

        let entry = entry_for(&payment);
        let balance = credit_balance(&mut tx, entry.user_id, entry.amount).await?;
        let transaction = insert_transaction(&mut tx, entry).await?;

        let session =
            sqlx::query_scalar::<_, Option<String>>("SELECT session FROM users WHERE id = $1")
                .bind(payment.user_id)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit().await?;
        Ok(Some(Settlement {
            payment,
            transaction,
            balance,
            session,
        }))
    }

    async fn fail_stale_payments(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE payments SET status = 'failed', updated_at = now()
            WHERE status = 'NEW' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn balance(&self, user_id: Uuid) -> Result<Option<Decimal>, StoreError> {
        let amount: Option<Decimal> =
            sqlx::query_scalar("SELECT amount FROM billing WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(amount)
    }

    async fn transactions_for(&self, user_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, Transaction>(&sql)
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }
}
