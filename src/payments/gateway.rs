//! Acquiring provider client.
//!
//! Every request carries `TerminalKey` and a `Token`: the SHA-256 of the root-level
//! scalar values plus the terminal password, concatenated in key order. Incoming
//! notifications are signed the same way.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::id::PaymentId;
use crate::config::PaymentConfig;
use crate::error::{Classify, ErrorKind};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("unexpected gateway response: {0}")]
    BadResponse(String),
}

impl Classify for GatewayError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiptItem {
    pub name: String,
    pub price: i64,
    pub quantity: i64,
    pub amount: i64,
    pub tax: &'static str,
    pub payment_method: &'static str,
    pub payment_object: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiptPayments {
    pub electronic: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Receipt {
    pub email: String,
    pub items: Vec<ReceiptItem>,
    pub taxation: &'static str,
    pub payments: ReceiptPayments,
}

/// Payment session initialization. Amounts are minor units.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitRequest {
    pub amount: i64,
    pub order_id: String,
    pub customer_key: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub redirect_due_date: OffsetDateTime,
    pub receipt: Receipt,
    #[serde(rename = "DATA")]
    pub data: BTreeMap<String, String>,
}

impl InitRequest {
    /// Single-line receipt for a balance top-up of `amount` minor units.
    pub fn top_up(
        amount: i64,
        order_id: String,
        customer_key: String,
        email: String,
        redirect_due_date: OffsetDateTime,
    ) -> Self {
        Self {
            amount,
            order_id,
            description: format!("Balance top-up for {customer_key}"),
            customer_key,
            redirect_due_date,
            receipt: Receipt {
                email,
                items: vec![ReceiptItem {
                    name: format!("Balance top-up of {amount}"),
                    price: amount,
                    quantity: 1,
                    amount,
                    tax: "none",
                    payment_method: "full_payment",
                    payment_object: "intellectual_activity",
                }],
                taxation: "usn_income",
                payments: ReceiptPayments { electronic: amount },
            },
            data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitResponse {
    pub payment_id: PaymentId,
    pub order_id: String,
    pub status: String,
    pub payment_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInitResponse {
    success: bool,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    payment_id: Option<Value>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "PaymentURL", default)]
    payment_url: Option<String>,
}

pub(crate) fn parse_init_response(raw: Value) -> Result<InitResponse, GatewayError> {
    let raw: RawInitResponse =
        serde_json::from_value(raw).map_err(|e| GatewayError::BadResponse(e.to_string()))?;
    if !raw.success {
        return Err(GatewayError::Rejected {
            code: raw.error_code.unwrap_or_default(),
            message: [raw.message, raw.details]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(": "),
        });
    }
    let payment_id = PaymentId::from_json(raw.payment_id.as_ref())
        .map_err(|e| GatewayError::BadResponse(e.to_string()))?;
    Ok(InitResponse {
        payment_id,
        order_id: raw.order_id.unwrap_or_default(),
        status: raw.status.unwrap_or_default(),
        payment_url: raw
            .payment_url
            .ok_or_else(|| GatewayError::BadResponse("PaymentURL missing".into()))?,
    })
}

/// Request/notification signature over the root-level scalar fields.
pub fn sign(params: &Map<String, Value>, password: &str) -> String {
    let mut pairs: Vec<(&str, String)> = params
        .iter()
        .filter(|(k, _)| k.as_str() != "Token")
        .filter_map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.as_str(), text))
        })
        .collect();
    pairs.push(("Password", password.to_string()));
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (_, value) in &pairs {
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// True when `params` carries a `Token` matching its own contents.
pub fn verify_signature(params: &Map<String, Value>, password: &str) -> bool {
    match params.get("Token").and_then(Value::as_str) {
        Some(token) => token.eq_ignore_ascii_case(&sign(params, password)),
        None => false,
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, GatewayError>;

    /// Checks the signature of an inbound notification.
    fn verify_notification(&self, params: &Map<String, Value>) -> bool;
}

pub struct TinkoffGateway {
    http: reqwest::Client,
    api_url: String,
    terminal_key: String,
    password: String,
}

impl TinkoffGateway {
    pub fn from_config(cfg: &PaymentConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            terminal_key: cfg.terminal_key.clone(),
            password: cfg.terminal_password.clone(),
        })
    }

    fn signed_body<T: Serialize>(&self, request: &T) -> Result<Value, GatewayError> {
        let mut body = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(GatewayError::BadResponse("request is not an object".into())),
            Err(e) => return Err(GatewayError::BadResponse(e.to_string())),
        };
        body.insert("TerminalKey".into(), Value::String(self.terminal_key.clone()));
        let token = sign(&body, &self.password);
        body.insert("Token".into(), Value::String(token));
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl PaymentGateway for TinkoffGateway {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, GatewayError> {
        let body = self.signed_body(request)?;
        let raw: Value = self
            .http
            .post(format!("{}/Init", self.api_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let response = parse_init_response(raw).map_err(|e| {
            warn!(error = %e, order_id = %request.order_id, "gateway init failed");
            e
        })?;
        debug!(
            order_id = %request.order_id,
            payment_id = %response.payment_id,
            "gateway init ok"
        );
        Ok(response)
    }

    fn verify_notification(&self, params: &Map<String, Value>) -> bool {
        params.get("TerminalKey").and_then(Value::as_str) == Some(self.terminal_key.as_str())
            && verify_signature(params, &self.password)
    }
}
