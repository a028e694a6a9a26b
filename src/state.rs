use std::sync::Arc;

use anyhow::Context;

use crate::auth::token::TokenKeys;
use crate::config::AppConfig;
use crate::mail::{LogMailer, Mailer};
use crate::payments::{OrderIds, PaymentGateway, TinkoffGateway};
use crate::sessions::{SessionHub, SessionNotifier};
use crate::storage::{Storage, StorageClient};
use crate::store::{PgStore, Store};
#[cfg(any(test, feature = "testing"))]
use crate::testing::Fakes;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn StorageClient>,
    pub mailer: Arc<dyn Mailer>,
    pub notifier: Arc<dyn SessionNotifier>,
    pub sessions: Arc<SessionHub>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub keys: TokenKeys,
    pub orders: Arc<OrderIds>,
}

/// Collaborators [`AppState::from_parts`] wires together.
pub struct Parts {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn StorageClient>,
    pub mailer: Arc<dyn Mailer>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl AppState {
    /// Builds the production state and returns the pool for migrations.
    pub async fn init() -> anyhow::Result<(Self, sqlx::PgPool)> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        // S3/MinIO
        let storage = Arc::new(Storage::new(&config.storage, "us-east-1").await?)
            as Arc<dyn StorageClient>;
        let gateway = Arc::new(TinkoffGateway::from_config(&config.payment)?)
            as Arc<dyn PaymentGateway>;

        let state = Self::from_parts(
            config,
            Parts {
                store: Arc::new(PgStore::new(db.clone())),
                storage,
                mailer: Arc::new(LogMailer),
                gateway,
            },
        )?;
        Ok((state, db))
    }

    pub fn from_parts(config: Arc<AppConfig>, parts: Parts) -> anyhow::Result<Self> {
        let keys = TokenKeys::from_config(&config.token).context("token keys")?;
        let sessions = Arc::new(SessionHub::new());
        Ok(Self {
            config,
            store: parts.store,
            storage: parts.storage,
            mailer: parts.mailer,
            notifier: sessions.clone(),
            sessions,
            gateway: parts.gateway,
            keys,
            orders: Arc::new(OrderIds::new()),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
impl AppState {
    /// In-memory state with fixture keys and recording collaborators.
    pub fn fake() -> Self {
        Self::fake_with_fakes().0
    }

    pub fn fake_with_fakes() -> (Self, Fakes) {
        let fakes = Fakes::default();
        let state = Self::from_fakes(crate::testing::test_config(), &fakes);
        (state, fakes)
    }

    pub fn from_fakes(config: AppConfig, fakes: &Fakes) -> Self {
        Self::from_parts(
            Arc::new(config),
            Parts {
                store: fakes.store.clone(),
                storage: fakes.storage.clone(),
                mailer: fakes.mailer.clone(),
                gateway: fakes.gateway.clone(),
            },
        )
        .expect("fixture config is valid")
    }
}
