use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Provider-assigned payment identifier. Always a positive integer, although the
/// provider sends it either as a JSON number or as a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PaymentId(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentIdError {
    #[error("PaymentId is missing")]
    Missing,
    #[error("Invalid PaymentId format: {0}")]
    Invalid(String),
    #[error("PaymentId is of an unexpected type")]
    UnexpectedType,
}

impl PaymentId {
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// The single place where the number-or-string encoding is resolved.
    pub fn from_json(value: Option<&Value>) -> Result<Self, PaymentIdError> {
        match value {
            None | Some(Value::Null) => Err(PaymentIdError::Missing),
            Some(Value::Number(n)) => {
                let raw = if let Some(i) = n.as_i64() {
                    Some(i)
                } else if let Some(f) = n.as_f64() {
                    // Integral floats such as 1.2345e4 are accepted.
                    (f.fract() == 0.0 && f > 0.0 && f < i64::MAX as f64).then_some(f as i64)
                } else {
                    None
                };
                raw.and_then(Self::new)
                    .ok_or_else(|| PaymentIdError::Invalid(n.to_string()))
            }
            Some(Value::String(s)) => s.parse(),
            Some(_) => Err(PaymentIdError::UnexpectedType),
        }
    }
}

impl FromStr for PaymentId {
    type Err = PaymentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PaymentIdError::Invalid(s.to_string()));
        }
        trimmed
            .parse::<i64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| PaymentIdError::Invalid(s.to_string()))
    }
}

impl TryFrom<String> for PaymentId {
    type Error = PaymentIdError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
