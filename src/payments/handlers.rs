use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{instrument, warn};

use super::dto::{CreateInvoiceInput, Envelope};
use super::invoice::{Invoice, InvoiceService};
use super::settlement::{SettlementError, SettlementProcessor};
use crate::{
    auth::extractors::AuthUser,
    error::{AppError, AppResult, ErrorKind},
    state::AppState,
};

#[instrument(skip(state, invoices, payload))]
pub async fn create_invoice(
    State(state): State<AppState>,
    State(invoices): State<InvoiceService>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateInvoiceInput>,
) -> AppResult<Json<Envelope<Invoice>>> {
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::new(ErrorKind::NotFound, "user not found"))?;
    let invoice = invoices
        .create(&user, payload.amount, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(Envelope::success(invoice)))
}

/// Provider callback. Always answers `{status, data}`; duplicates and
/// non-confirming statuses are acknowledged with 200.
#[instrument(skip(processor, body))]
pub async fn notify(State(processor): State<SettlementProcessor>, body: Bytes) -> Response {
    let result = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => processor.handle(&value).await,
        Err(e) => Err(SettlementError::MalformedBody(e.to_string())),
    };

    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(Envelope::success(outcome.describe())),
        )
            .into_response(),
        Err(e) => {
            if matches!(
                e,
                SettlementError::MalformedPaymentId(_) | SettlementError::MalformedBody(_)
            ) {
                warn!(error = %e, "rejected payment notification");
            }
            let err = AppError::classify(e);
            let status = if err.kind == ErrorKind::Internal {
                "error"
            } else {
                "fail"
            };
            (
                err.kind.status(),
                Json(json!({ "status": status, "data": err.message })),
            )
                .into_response()
        }
    }
}
