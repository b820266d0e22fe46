use thiserror::Error;

use crate::wallet::CryptoError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    /// A field failed validation; `field` names it.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("signing failed: {0}")]
    Signing(#[from] CryptoError),

    #[error("malformed transaction json: {0}")]
    Json(String),
}

impl TransactionError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
