use serde::{Deserialize, Serialize};

/// Request body for `POST /payments/invoice`.
#[derive(Debug, Deserialize)]
pub struct CreateInvoiceInput {
    /// Minor units.
    pub amount: i64,
}

/// `{status, data}` envelope shared by the payment routes.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}
