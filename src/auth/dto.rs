use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::User;

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Request body for user and bot registration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignUpInput {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    #[serde(default, rename = "devices_ios")]
    pub device_ios: Option<String>,
    #[serde(default, rename = "devices_ios_voip")]
    pub device_ios_voip: Option<String>,
}

impl SignUpInput {
    /// First failing rule, as a client-facing message.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Name is required".into());
        }
        if !is_valid_email(self.email.trim()) {
            return Err("Invalid email".into());
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            ));
        }
        if self.password != self.password_confirm {
            return Err("Passwords do not match".into());
        }
        Ok(())
    }
}

/// Request body for login.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInInput {
    pub email: String,
    pub password: String,
    /// Live session handle to bind to the account.
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordInput {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordInput {
    pub password: String,
    #[serde(default)]
    pub password_confirm: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LanguageQuery {
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccessTokenQuery {
    #[serde(default)]
    pub access_token: String,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
    pub photo: String,
    pub verified: bool,
    pub is_bot: bool,
    pub language: &'static str,
}

impl PublicUser {
    pub fn from_user(user: &User, language: &'static str) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            photo: user.photo.clone(),
            verified: user.verified,
            is_bot: user.is_bot,
            language,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SignUpData {
    pub user: PublicUser,
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: &'static str,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AccessTokenResponse {
    pub status: &'static str,
    pub access_token: String,
}

/// `{status, message}` acknowledgement.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: &'static str,
}

impl MessageResponse {
    pub fn success(message: &'static str) -> Self {
        Self {
            status: "success",
            message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserDetails {
    #[serde(rename = "userID")]
    pub user_id: Uuid,
    pub photo: String,
    pub name: String,
    pub role: String,
    #[serde(rename = "telegramname")]
    pub bot_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> SignUpInput {
        SignUpInput {
            name: "Petrov Ivan".into(),
            email: "ivan@example.com".into(),
            password: "s3cret-pass".into(),
            password_confirm: "s3cret-pass".into(),
            device_ios: None,
            device_ios_voip: None,
        }
    }

    #[test]
    fn valid_input_passes() {
        assert_eq!(input().validate(), Ok(()));
    }

    #[test]
    fn each_rule_is_enforced() {
        let mut i = input();
        i.name = "  ".into();
        assert!(i.validate().is_err());

        let mut i = input();
        i.email = "not-an-email".into();
        assert_eq!(i.validate(), Err("Invalid email".into()));

        let mut i = input();
        i.password = "short".into();
        i.password_confirm = "short".into();
        assert!(i.validate().unwrap_err().contains("at least 8"));

        let mut i = input();
        i.password_confirm = "different-pass".into();
        assert_eq!(i.validate(), Err("Passwords do not match".into()));
    }

    #[test]
    fn email_regex() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.d"));
    }

    #[test]
    fn user_details_uses_client_field_names() {
        let details = UserDetails {
            user_id: Uuid::nil(),
            photo: "p".into(),
            name: "n".into(),
            role: "user".into(),
            bot_name: None,
        };
        let v = serde_json::to_value(&details).unwrap();
        assert!(v.get("userID").is_some());
        assert!(v.get("telegramname").is_some());
    }
}
