use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::error::{Classify, ErrorKind};

/// Random bytes behind every verification, reset and bot link code.
pub const CODE_BYTES: usize = 20;

/// How long a password reset code stays usable.
pub const RESET_CODE_TTL: Duration = Duration::minutes(15);

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("random source failed: {0}")]
    Exhausted(String),
}

impl Classify for CodeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Returns `n_bytes` from the OS CSPRNG, hex encoded.
pub fn generate(n_bytes: usize) -> Result<String, CodeError> {
    let mut buf = vec![0u8; n_bytes];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CodeError::Exhausted(e.to_string()))?;
    Ok(hex::encode(buf))
}

/// A fresh 40-character single-use code.
pub fn single_use_code() -> Result<String, CodeError> {
    generate(CODE_BYTES)
}

/// A password reset code and the instant after which it is rejected.
pub fn reset_code(now: OffsetDateTime) -> Result<(String, OffsetDateTime), CodeError> {
    Ok((single_use_code()?, now + RESET_CODE_TTL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_forty_lowercase_hex_chars() {
        let code = single_use_code().unwrap();
        assert_eq!(code.len(), 40);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generate_respects_length() {
        assert_eq!(generate(4).unwrap().len(), 8);
        assert_eq!(generate(0).unwrap(), "");
    }

    #[test]
    fn codes_do_not_repeat() {
        let codes: HashSet<String> = (0..256).map(|_| single_use_code().unwrap()).collect();
        assert_eq!(codes.len(), 256);
    }

    #[test]
    fn reset_code_expires_fifteen_minutes_out() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let (_, expires_at) = reset_code(now).unwrap();
        assert_eq!(expires_at - now, Duration::minutes(15));
    }
}
