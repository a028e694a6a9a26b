use anyhow::Context;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    presigning::PresigningConfig,
    Client,
};
use axum::async_trait;
use uuid::Uuid;

use crate::config::StorageConfig;

/// Object every new account's avatar starts as.
pub const DEFAULT_AVATAR: &str = "default.jpg";

/// How long presigned avatar links stay valid.
pub const AVATAR_URL_TTL_SECS: u64 = 30 * 60;

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn copy_object(&self, from_key: &str, to_key: &str) -> anyhow::Result<()>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String>;
}

/// Per-user storage directory and the avatar placed in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStorage {
    pub dir: String,
    pub photo: String,
}

/// Creates a fresh directory for a new account holding a copy of the default avatar.
pub async fn provision_user_storage(storage: &dyn StorageClient) -> anyhow::Result<UserStorage> {
    let dir = Uuid::new_v4().simple().to_string();
    let photo = format!("{dir}/{DEFAULT_AVATAR}");
    storage
        .copy_object(DEFAULT_AVATAR, &photo)
        .await
        .with_context(|| format!("provision avatar {photo}"))?;
    Ok(UserStorage { dir, photo })
}

/// Removes the avatar copy of an account that was never created.
pub async fn release_user_storage(storage: &dyn StorageClient, provisioned: &UserStorage) {
    if let Err(e) = storage.delete_object(&provisioned.photo).await {
        tracing::warn!(error = %e, photo = %provisioned.photo, "orphaned avatar not removed");
    }
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(cfg: &StorageConfig, region: &str) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
        })
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn copy_object(&self, from_key: &str, to_key: &str) -> anyhow::Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from_key))
            .key(to_key)
            .send()
            .await
            .context("s3 copy_object")?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String> {
        let req = self.client.get_object().bucket(&self.bucket).key(key);
        let presigned = req
            .presigned(PresigningConfig::expires_in(
                std::time::Duration::from_secs(seconds),
            )?)
            .await
            .context("s3 presign_get")?;
        Ok(presigned.uri().to_string())
    }
}
