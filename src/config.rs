use anyhow::Context;
use base64ct::{Base64, Encoding};
use jsonwebtoken::Algorithm;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub algorithm: Algorithm,
    pub access_private_key: String,
    pub access_public_key: String,
    pub refresh_private_key: String,
    pub refresh_public_key: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
    /// Lifetime of the `access_token` cookie.
    pub access_max_age_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub api_url: String,
    pub terminal_key: String,
    pub terminal_password: String,
    /// Check the `Token` signature carried by provider notifications.
    pub verify_notifications: bool,
    /// `NEW` payments older than this are swept to `failed`.
    pub ttl_hours: i64,
    pub sweep_interval_secs: u64,
}

impl PaymentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.sweep_interval_secs > 0,
            "PAYMENT_SWEEP_INTERVAL_SECS must be positive"
        );
        anyhow::ensure!(self.ttl_hours > 0, "PAYMENT_TTL_HOURS must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub client_origin: String,
    pub brand_name: String,
    pub signup_bonus: i64,
    pub token: TokenConfig,
    pub storage: StorageConfig,
    pub payment: PaymentConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL")?;
        let client_origin = std::env::var("CLIENT_ORIGIN").context("CLIENT_ORIGIN")?;

        let token = TokenConfig {
            algorithm: parse_algorithm(
                &std::env::var("TOKEN_ALGORITHM").unwrap_or_else(|_| "RS256".into()),
            )?,
            access_private_key: read_pem("ACCESS_TOKEN_PRIVATE_KEY")?,
            access_public_key: read_pem("ACCESS_TOKEN_PUBLIC_KEY")?,
            refresh_private_key: read_pem("REFRESH_TOKEN_PRIVATE_KEY")?,
            refresh_public_key: read_pem("REFRESH_TOKEN_PUBLIC_KEY")?,
            access_ttl_minutes: env_or("ACCESS_TOKEN_EXPIRED_IN", 15),
            refresh_ttl_minutes: env_or("REFRESH_TOKEN_EXPIRED_IN", 60),
            access_max_age_minutes: env_or("ACCESS_TOKEN_MAXAGE", 15),
        };

        let storage = StorageConfig {
            endpoint: std::env::var("MINIO_ENDPOINT").context("MINIO_ENDPOINT")?,
            bucket: std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "avatars".into()),
            access_key: std::env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY")?,
            secret_key: std::env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY")?,
        };

        let payment = PaymentConfig {
            api_url: std::env::var("PAYMENT_API_URL")
                .unwrap_or_else(|_| "https://securepay.tinkoff.ru/v2".into()),
            terminal_key: std::env::var("PAYMENT_TERMINAL_KEY").context("PAYMENT_TERMINAL_KEY")?,
            terminal_password: std::env::var("PAYMENT_TERMINAL_PASSWORD")
                .context("PAYMENT_TERMINAL_PASSWORD")?,
            verify_notifications: env_or("PAYMENT_VERIFY_NOTIFICATIONS", false),
            ttl_hours: env_or("PAYMENT_TTL_HOURS", 96),
            sweep_interval_secs: env_or("PAYMENT_SWEEP_INTERVAL_SECS", 300),
        };
        payment.validate()?;

        Ok(Self {
            database_url,
            client_origin,
            brand_name: std::env::var("BRAND_NAME").unwrap_or_else(|_| "KASSA".into()),
            signup_bonus: env_or("SIGNUP_BONUS", 100),
            token,
            storage,
            payment,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn parse_algorithm(raw: &str) -> anyhow::Result<Algorithm> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "RS256" => Ok(Algorithm::RS256),
        "EDDSA" => Ok(Algorithm::EdDSA),
        other => anyhow::bail!("unsupported TOKEN_ALGORITHM {other:?}, expected RS256 or EdDSA"),
    }
}

fn read_pem(key: &str) -> anyhow::Result<String> {
    let raw = std::env::var(key).with_context(|| key.to_string())?;
    decode_pem(&raw).with_context(|| format!("{key} is neither PEM nor base64-encoded PEM"))
}

/// Accepts a PEM as-is (with literal `\n` escapes allowed) or base64 of a PEM.
pub(crate) fn decode_pem(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    if raw.starts_with("-----BEGIN") {
        return Ok(raw.replace("\\n", "\n"));
    }
    let bytes = Base64::decode_vec(raw).map_err(|e| anyhow::anyhow!("base64: {e}"))?;
    let pem = String::from_utf8(bytes).context("decoded key is not utf-8")?;
    anyhow::ensure!(pem.trim_start().starts_with("-----BEGIN"), "decoded value is not a PEM");
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nMCowBQYDK2VwAyEA\n-----END PUBLIC KEY-----";

    #[test]
    fn decode_pem_accepts_plain_and_escaped_pem() {
        assert_eq!(decode_pem(PEM).unwrap(), PEM);
        let escaped = PEM.replace('\n', "\\n");
        assert_eq!(decode_pem(&escaped).unwrap(), PEM);
    }

    #[test]
    fn decode_pem_accepts_base64_pem() {
        let encoded = Base64::encode_string(PEM.as_bytes());
        assert_eq!(decode_pem(&encoded).unwrap(), PEM);
    }

    #[test]
    fn decode_pem_rejects_garbage() {
        assert!(decode_pem("definitely not a key").is_err());
        let encoded = Base64::encode_string(b"hello");
        assert!(decode_pem(&encoded).is_err());
    }

    #[test]
    fn payment_config_needs_positive_sweep_settings() {
        let mut payment = crate::testing::test_config().payment;
        assert!(payment.validate().is_ok());

        payment.sweep_interval_secs = 0;
        let err = payment.validate().unwrap_err();
        assert!(err.to_string().contains("PAYMENT_SWEEP_INTERVAL_SECS"));

        payment.sweep_interval_secs = 300;
        payment.ttl_hours = 0;
        assert!(payment.validate().is_err());
        payment.ttl_hours = -4;
        assert!(payment.validate().is_err());
    }

    #[test]
    fn parse_algorithm_is_case_insensitive() {
        assert_eq!(parse_algorithm("rs256").unwrap(), Algorithm::RS256);
        assert_eq!(parse_algorithm("EdDSA").unwrap(), Algorithm::EdDSA);
        assert!(parse_algorithm("HS256").is_err());
    }
}
