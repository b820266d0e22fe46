use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::TransactionError;

pub const MAX_BATCH_ID_LEN: usize = 64;
pub const MAX_METADATA_ENTRIES: usize = 32;
pub const MAX_METADATA_KEY_LEN: usize = 64;
pub const MAX_METADATA_VALUE_LEN: usize = 256;

/// Supply-chain step a transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplyAction {
    Produced,
    Shipped,
    Received,
    Dispensed,
    Returned,
    Destroyed,
    /// Mining reward; only system-issued transactions carry it.
    Reward,
}

impl SupplyAction {
    pub const ALL: [SupplyAction; 7] = [
        SupplyAction::Produced,
        SupplyAction::Shipped,
        SupplyAction::Received,
        SupplyAction::Dispensed,
        SupplyAction::Returned,
        SupplyAction::Destroyed,
        SupplyAction::Reward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyAction::Produced => "produced",
            SupplyAction::Shipped => "shipped",
            SupplyAction::Received => "received",
            SupplyAction::Dispensed => "dispensed",
            SupplyAction::Returned => "returned",
            SupplyAction::Destroyed => "destroyed",
            SupplyAction::Reward => "reward",
        }
    }
}

impl fmt::Display for SupplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupplyAction {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| TransactionError::field("action", format!("unknown action '{s}'")))
    }
}

/// Batch identifier plus free-form metadata (lot number, site, expiry...).
/// `BTreeMap` keeps serialization order stable for signing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyPayload {
    pub batch_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SupplyPayload {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.batch_id.is_empty() {
            return Err(TransactionError::field("batch_id", "must not be empty"));
        }
        if self.batch_id.len() > MAX_BATCH_ID_LEN {
            return Err(TransactionError::field(
                "batch_id",
                format!("longer than {MAX_BATCH_ID_LEN} chars"),
            ));
        }
        if !self
            .batch_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TransactionError::field(
                "batch_id",
                "only ascii letters, digits, '-' and '_' allowed",
            ));
        }

        if self.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(TransactionError::field(
                "metadata",
                format!("more than {MAX_METADATA_ENTRIES} entries"),
            ));
        }
        for (k, v) in &self.metadata {
            if k.is_empty() || k.len() > MAX_METADATA_KEY_LEN {
                return Err(TransactionError::field(
                    "metadata",
                    format!("key '{k}' must be 1..={MAX_METADATA_KEY_LEN} chars"),
                ));
            }
            if v.len() > MAX_METADATA_VALUE_LEN {
                return Err(TransactionError::field(
                    "metadata",
                    format!("value for '{k}' longer than {MAX_METADATA_VALUE_LEN} chars"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parses_closed_set() {
        assert_eq!("shipped".parse::<SupplyAction>().unwrap(), SupplyAction::Shipped);
        let err = "teleported".parse::<SupplyAction>().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidField { field: "action", .. }));
    }

    #[test]
    fn action_serializes_lowercase() {
        let json = serde_json::to_string(&SupplyAction::Dispensed).unwrap();
        assert_eq!(json, "\"dispensed\"");
    }

    #[test]
    fn payload_validation_names_field() {
        assert!(SupplyPayload::new("LOT-2024_001").validate().is_ok());

        let err = SupplyPayload::new("").validate().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidField { field: "batch_id", .. }));

        let err = SupplyPayload::new("bad id!").validate().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidField { field: "batch_id", .. }));

        let err = SupplyPayload::new("LOT-1")
            .with("", "x")
            .validate()
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidField { field: "metadata", .. }));

        let err = SupplyPayload::new("LOT-1")
            .with("note", "x".repeat(MAX_METADATA_VALUE_LEN + 1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidField { field: "metadata", .. }));
    }
}
