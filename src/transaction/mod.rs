pub mod error;
pub mod model;
pub mod payload;

pub use error::TransactionError;
pub use model::{Authorization, Transaction};
pub use payload::{SupplyAction, SupplyPayload};
