//! Account lifecycle: registration, verification, login/logout, token
//! check/refresh and password reset.

use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::codes::{self, CodeError};
use super::dto::{SignInInput, SignUpInput, UserDetails, MIN_PASSWORD_LEN};
use super::password::{hash_password, verify_password, PasswordError};
use super::token::{TokenDetails, TokenError};
use crate::error::{Classify, ErrorKind};
use crate::mail::{EmailData, EmailTemplate, Locale};
use crate::sessions::notify_best_effort;
use crate::state::AppState;
use crate::storage::{provision_user_storage, release_user_storage, AVATAR_URL_TTL_SECS};
use crate::store::{LedgerEntry, NewAccount, StoreError, User, VerificationOutcome};

/// Greeting pushed to a session right after login.
pub const HELLO_CLIENT: &str = "Hello Client";

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("User with that email already exists")]
    EmailTaken,
    #[error("Invalid verification code or user doesn't exist")]
    InvalidVerificationCode,
    #[error("User already verified")]
    AlreadyVerified,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Account was not verified")]
    NotVerified,
    #[error("You are not logged in")]
    NotAuthenticated,
    #[error("the user belonging to this token no longer exists")]
    UserGone,
    #[error("User not found")]
    UserNotFound,
    #[error("Invalid email")]
    UnknownEmail,
    #[error("The reset token is invalid or has expired")]
    InvalidOrExpired,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Code(#[from] CodeError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("avatar storage: {0:#}")]
    Storage(anyhow::Error),
}

impl Classify for AccountError {
    fn kind(&self) -> ErrorKind {
        match self {
            AccountError::Validation(_)
            | AccountError::UnknownEmail
            | AccountError::InvalidOrExpired => ErrorKind::Validation,
            AccountError::EmailTaken | AccountError::AlreadyVerified => ErrorKind::Conflict,
            AccountError::InvalidCredentials
            | AccountError::NotVerified
            | AccountError::NotAuthenticated
            | AccountError::UserGone => ErrorKind::Auth,
            AccountError::InvalidVerificationCode | AccountError::UserNotFound => {
                ErrorKind::NotFound
            }
            AccountError::Token(e) => e.kind(),
            AccountError::Code(e) => e.kind(),
            AccountError::Password(e) => e.kind(),
            AccountError::Store(e) => e.kind(),
            AccountError::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Access and refresh tokens issued together at login.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: TokenDetails,
    pub refresh: TokenDetails,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn activation_url(state: &AppState, code: &str) -> String {
    format!("https://www.{}/auth/verify/{code}", state.config.client_origin)
}

fn reset_url(state: &AppState, code: &str) -> String {
    format!(
        "https://www.{}/auth/reset-password/{code}",
        state.config.client_origin
    )
}

async fn send_mail(
    state: &AppState,
    user: &User,
    template: EmailTemplate,
    locale: Locale,
    url: String,
) {
    let data = EmailData::new(template, locale, &state.config.brand_name, url, &user.name);
    if let Err(e) = state.mailer.send(&user.email, &data, template, locale).await {
        warn!(error = %e, user_id = %user.id, template = template.name(), "email not sent");
    }
}

/// Hashes the password, provisions avatar storage and inserts the user with its
/// billing row and signup bonus in one unit.
async fn create_account(
    state: &AppState,
    input: &SignUpInput,
    bot: bool,
) -> Result<User, AccountError> {
    input.validate().map_err(AccountError::Validation)?;

    let password_hash = hash_password(&input.password)?;
    let verification_code = if bot {
        None
    } else {
        Some(codes::single_use_code()?)
    };
    let bot_token = codes::single_use_code()?;
    let storage = provision_user_storage(state.storage.as_ref())
        .await
        .map_err(AccountError::Storage)?;

    let id = Uuid::new_v4();
    let opening = (state.config.signup_bonus > 0)
        .then(|| LedgerEntry::signup_bonus(id, Decimal::from(state.config.signup_bonus)));
    let account = NewAccount {
        id,
        name: input.name.trim().to_string(),
        email: normalize_email(&input.email),
        password_hash,
        verified: bot,
        is_bot: bot,
        verification_code,
        bot_token: Some(bot_token),
        storage: storage.dir.clone(),
        photo: storage.photo.clone(),
        device_ios: input.device_ios.clone(),
        device_ios_voip: input.device_ios_voip.clone(),
    };

    match state.store.create_account(account, opening).await {
        Ok(user) => Ok(user),
        Err(e) => {
            release_user_storage(state.storage.as_ref(), &storage).await;
            Err(match e {
                StoreError::Conflict(_) => AccountError::EmailTaken,
                other => AccountError::Store(other),
            })
        }
    }
}

pub async fn sign_up(
    state: &AppState,
    input: &SignUpInput,
    locale: Locale,
) -> Result<User, AccountError> {
    let user = create_account(state, input, false).await?;
    info!(user_id = %user.id, email = %user.email, "user registered");

    if let Some(code) = user.verification_code.as_deref() {
        let url = activation_url(state, code);
        send_mail(state, &user, EmailTemplate::VerificationCode, locale, url).await;
    }
    Ok(user)
}

pub async fn sign_up_bot(state: &AppState, input: &SignUpInput) -> Result<User, AccountError> {
    let user = create_account(state, input, true).await?;
    info!(user_id = %user.id, "bot registered");
    Ok(user)
}

pub async fn verify_email(state: &AppState, code: &str) -> Result<User, AccountError> {
    if code.trim().is_empty() {
        return Err(AccountError::InvalidVerificationCode);
    }
    match state.store.consume_verification_code(code.trim()).await? {
        VerificationOutcome::Verified(user) => {
            info!(user_id = %user.id, "email verified");
            Ok(user)
        }
        VerificationOutcome::AlreadyVerified => Err(AccountError::AlreadyVerified),
        VerificationOutcome::NotFound => Err(AccountError::InvalidVerificationCode),
    }
}

/// Unverified accounts are refused before the password is looked at.
pub async fn login(
    state: &AppState,
    input: &SignInInput,
    now: OffsetDateTime,
) -> Result<(User, TokenPair), AccountError> {
    let email = normalize_email(&input.email);
    let user = state
        .store
        .find_user_by_email(&email)
        .await?
        .ok_or(AccountError::InvalidCredentials)?;

    if !user.verified {
        warn!(user_id = %user.id, "login on unverified account");
        return Err(AccountError::NotVerified);
    }
    if !verify_password(&input.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AccountError::InvalidCredentials);
    }

    let tokens = TokenPair {
        access: state.keys.access.issue(user.id, now)?,
        refresh: state.keys.refresh.issue(user.id, now)?,
    };

    let session = input.session.as_deref().map(str::trim).filter(|s| !s.is_empty());
    state.store.open_session(user.id, session).await?;
    notify_best_effort(state.notifier.as_ref(), session, HELLO_CLIENT).await;

    info!(user_id = %user.id, session = session.unwrap_or(""), "user logged in");
    Ok((user, tokens))
}

pub async fn logout(state: &AppState, user_id: Option<Uuid>) -> Result<(), AccountError> {
    let user_id = user_id.ok_or(AccountError::NotAuthenticated)?;
    state
        .store
        .close_session(user_id)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => AccountError::UserNotFound,
            other => AccountError::Store(other),
        })?;
    info!(user_id = %user_id, "user logged out");
    Ok(())
}

pub async fn check_access_token(
    state: &AppState,
    token: &str,
    now: OffsetDateTime,
) -> Result<Uuid, AccountError> {
    if token.is_empty() {
        return Err(AccountError::NotAuthenticated);
    }
    let user_id = state.keys.access.validate(token, now)?;
    state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or(AccountError::UserGone)?;
    Ok(user_id)
}

/// Validates the refresh token and issues a new access token for its subject.
pub async fn refresh_access_token(
    state: &AppState,
    refresh_token: &str,
    now: OffsetDateTime,
) -> Result<TokenDetails, AccountError> {
    if refresh_token.is_empty() {
        return Err(AccountError::NotAuthenticated);
    }
    let user_id = state.keys.refresh.validate(refresh_token, now)?;
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or(AccountError::UserGone)?;
    Ok(state.keys.access.issue(user.id, now)?)
}

pub async fn forgot_password(
    state: &AppState,
    email: &str,
    locale: Locale,
    now: OffsetDateTime,
) -> Result<(), AccountError> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(AccountError::Validation("Email field cannot be empty".into()));
    }
    let user = state
        .store
        .find_user_by_email(&email)
        .await?
        .ok_or(AccountError::UnknownEmail)?;

    let (code, expires_at) = codes::reset_code(now)?;
    state.store.set_reset_token(user.id, &code, expires_at).await?;
    info!(user_id = %user.id, "password reset requested");

    let url = reset_url(state, &code);
    send_mail(state, &user, EmailTemplate::ResetPassword, locale, url).await;
    Ok(())
}

pub async fn reset_password(
    state: &AppState,
    reset_token: &str,
    password: &str,
    password_confirm: Option<&str>,
    now: OffsetDateTime,
) -> Result<Uuid, AccountError> {
    if password.trim().is_empty() {
        return Err(AccountError::Validation("Password cannot be empty".into()));
    }
    if password_confirm.is_some_and(|c| c.trim() != password.trim()) {
        return Err(AccountError::Validation("Passwords do not match".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AccountError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let password_hash = hash_password(password)?;
    let user_id = state
        .store
        .consume_reset_token(reset_token, now, &password_hash)
        .await?
        .ok_or(AccountError::InvalidOrExpired)?;
    info!(user_id = %user_id, "password reset");
    Ok(user_id)
}

pub async fn user_details(state: &AppState, user_id: Uuid) -> Result<UserDetails, AccountError> {
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or(AccountError::UserNotFound)?;

    let photo = match state.storage.presign_get(&user.photo, AVATAR_URL_TTL_SECS).await {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, user_id = %user.id, "avatar presign failed");
            user.photo.clone()
        }
    };

    Ok(UserDetails {
        user_id: user.id,
        photo,
        name: user.name,
        role: user.role,
        bot_name: user.bot_name,
    })
}
