//! Balance top-ups through the acquiring provider.

use axum::{routing::post, Router};

use crate::state::AppState;

pub mod dto;
pub mod gateway;
pub mod handlers;
mod id;
pub mod invoice;
pub mod settlement;

pub use gateway::{PaymentGateway, TinkoffGateway};
pub use id::{PaymentId, PaymentIdError};
pub use invoice::{InvoiceService, OrderIds};
pub use settlement::{spawn_sweeper, SettlementProcessor};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/invoice", post(handlers::create_invoice))
        .route("/payments/notify", post(handlers::notify))
}
