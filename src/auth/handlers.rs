use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    auth::{
        cookies::{access_cookie, clear_access_cookie},
        dto::{
            AccessTokenQuery, AccessTokenResponse, DataResponse, ForgotPasswordInput,
            LanguageQuery, LoginResponse, MessageResponse, PublicUser, ResetPasswordInput,
            SignInInput, SignUpData, SignUpInput, UserDetails,
        },
        extractors::{AuthUser, MaybeAuthUser},
        services,
    },
    error::AppResult,
    mail::Locale,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/register/bot", post(register_bot))
        .route("/auth/verify/:code", get(verify_email))
        .route("/auth/login", post(login))
        .route("/auth/check", get(check_token))
        .route("/auth/refresh/:refresh_token", get(refresh))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password/:reset_token", patch(reset_password))
        .route("/auth/logout", get(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/users/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Query(query): Query<LanguageQuery>,
    Json(payload): Json<SignUpInput>,
) -> AppResult<(StatusCode, Json<DataResponse<SignUpData>>)> {
    let locale = Locale::from_tag(query.language.as_deref());
    let user = services::sign_up(&state, &payload, locale).await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse::success(SignUpData {
            user: PublicUser::from_user(&user, locale.tag()),
        })),
    ))
}

#[instrument(skip(state, payload))]
pub async fn register_bot(
    State(state): State<AppState>,
    Json(payload): Json<SignUpInput>,
) -> AppResult<(StatusCode, Json<DataResponse<SignUpData>>)> {
    let user = services::sign_up_bot(&state, &payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse::success(SignUpData {
            user: PublicUser::from_user(&user, Locale::default().tag()),
        })),
    ))
}

#[instrument(skip(state, code))]
pub async fn verify_email(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    services::verify_email(&state, &code).await?;
    Ok(Json(MessageResponse::success("Email verified successfully")))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignInInput>,
) -> AppResult<(CookieJar, Json<LoginResponse>)> {
    let (_, tokens) = services::login(&state, &payload, OffsetDateTime::now_utc()).await?;
    let jar = jar.add(access_cookie(&tokens.access.token, &state.config));
    Ok((
        jar,
        Json(LoginResponse {
            status: "success",
            access_token: tokens.access.token,
            refresh_token: tokens.refresh.token,
        }),
    ))
}

#[instrument(skip(state, query))]
pub async fn check_token(
    State(state): State<AppState>,
    Query(query): Query<AccessTokenQuery>,
) -> AppResult<Json<MessageResponse>> {
    services::check_access_token(&state, &query.access_token, OffsetDateTime::now_utc()).await?;
    Ok(Json(MessageResponse::success("access token is valid")))
}

#[instrument(skip(state, jar, refresh_token))]
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(refresh_token): Path<String>,
) -> AppResult<(CookieJar, Json<AccessTokenResponse>)> {
    let access =
        services::refresh_access_token(&state, &refresh_token, OffsetDateTime::now_utc()).await?;
    let jar = jar.add(access_cookie(&access.token, &state.config));
    Ok((
        jar,
        Json(AccessTokenResponse {
            status: "success",
            access_token: access.token,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Query(query): Query<LanguageQuery>,
    Json(payload): Json<ForgotPasswordInput>,
) -> AppResult<Json<MessageResponse>> {
    let locale = Locale::from_tag(query.language.as_deref());
    services::forgot_password(&state, &payload.email, locale, OffsetDateTime::now_utc()).await?;
    Ok(Json(MessageResponse::success("Password reset email sent")))
}

#[instrument(skip(state, jar, reset_token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(reset_token): Path<String>,
    Json(payload): Json<ResetPasswordInput>,
) -> AppResult<(CookieJar, Json<MessageResponse>)> {
    services::reset_password(
        &state,
        &reset_token,
        &payload.password,
        payload.password_confirm.as_deref(),
        OffsetDateTime::now_utc(),
    )
    .await?;
    let jar = jar.add(clear_access_cookie(&state.config));
    Ok((jar, Json(MessageResponse::success("Password updated successfully"))))
}

#[instrument(skip(state, jar, user))]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    user: MaybeAuthUser,
) -> AppResult<(CookieJar, Json<MessageResponse>)> {
    services::logout(&state, user.0).await?;
    let jar = jar.add(clear_access_cookie(&state.config));
    Ok((jar, Json(MessageResponse::success("logged out"))))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<DataResponse<UserDetails>>> {
    let details = services::user_details(&state, user_id).await?;
    Ok(Json(DataResponse::success(details)))
}
