use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TransactionError;
use super::payload::{SupplyAction, SupplyPayload};
use crate::wallet::{self, SYSTEM_ADDRESS};

/// Who vouches for a transaction. System-issued rewards are the only
/// transactions exempt from signatures and this enum is the one place the
/// exemption lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Authorization {
    SystemIssued,
    Unsigned,
    UserSigned {
        /// Hex DER ECDSA signature over `signing_payload()`.
        signature: String,
        /// Hex compressed public key of the signer.
        public_key: String,
    },
}

/// A value transfer tagged with a supply-chain step.
///
/// Fields are private: once built (and signed) a transaction never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: String,
    sender: String,
    recipient: String,
    amount: u64,
    fee: u64,
    payload: SupplyPayload,
    action: SupplyAction,
    timestamp: i64, // Unix millis (UTC)
    authorization: Authorization,
}

/// Everything except the authorization, in a fixed field order.
#[derive(Serialize)]
struct SigningView<'a> {
    id: &'a str,
    sender: &'a str,
    recipient: &'a str,
    amount: u64,
    fee: u64,
    payload: &'a SupplyPayload,
    action: SupplyAction,
    timestamp: i64,
}

impl Transaction {
    /// Build an unsigned user transaction. Call `sign()` before submitting.
    pub fn new(
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
        payload: SupplyPayload,
        action: SupplyAction,
    ) -> Result<Self, TransactionError> {
        let tx = Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            payload,
            action,
            timestamp: Utc::now().timestamp_millis(),
            authorization: Authorization::Unsigned,
        };
        tx.validate_user_fields()?;
        Ok(tx)
    }

    /// Reward paid by the system address. No signature, no fee.
    pub fn system_reward(recipient: &str, amount: u64) -> Result<Self, TransactionError> {
        if !wallet::is_valid_address(recipient) || recipient == SYSTEM_ADDRESS {
            return Err(TransactionError::field("recipient", "invalid address"));
        }
        if amount == 0 {
            return Err(TransactionError::field("amount", "reward must be positive"));
        }
        let now = Utc::now().timestamp_millis();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            sender: SYSTEM_ADDRESS.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee: 0,
            payload: SupplyPayload::new(format!("reward-{now}")),
            action: SupplyAction::Reward,
            timestamp: now,
            authorization: Authorization::SystemIssued,
        })
    }

    /// Sign with the sender's private key, storing signature and public key.
    pub fn sign(mut self, privkey_hex: &str) -> Result<Self, TransactionError> {
        if matches!(self.authorization, Authorization::SystemIssued) {
            return Err(TransactionError::field(
                "authorization",
                "system-issued transactions are not signed",
            ));
        }
        let public_key = wallet::public_key_for(privkey_hex)?;
        if wallet::derive_address(&public_key)? != self.sender {
            return Err(TransactionError::field(
                "sender",
                "does not match the signing key",
            ));
        }
        let signature = wallet::sign(&self.signing_payload(), privkey_hex)?;
        self.authorization = Authorization::UserSigned {
            signature,
            public_key,
        };
        Ok(self)
    }

    fn validate_user_fields(&self) -> Result<(), TransactionError> {
        if self.id.is_empty() {
            return Err(TransactionError::field("id", "must not be empty"));
        }
        if !wallet::is_valid_address(&self.sender) {
            return Err(TransactionError::field("sender", "invalid address"));
        }
        if self.sender == SYSTEM_ADDRESS {
            return Err(TransactionError::field(
                "sender",
                "system address cannot originate user transactions",
            ));
        }
        if !wallet::is_valid_address(&self.recipient) {
            return Err(TransactionError::field("recipient", "invalid address"));
        }
        if self.sender == self.recipient {
            return Err(TransactionError::field(
                "recipient",
                "must differ from sender",
            ));
        }
        if self.action == SupplyAction::Reward {
            return Err(TransactionError::field(
                "action",
                "reward is reserved for system-issued transactions",
            ));
        }
        if self.timestamp <= 0 {
            return Err(TransactionError::field("timestamp", "must be positive"));
        }
        self.amount
            .checked_add(self.fee)
            .ok_or_else(|| TransactionError::field("fee", "amount + fee overflows"))?;
        self.payload.validate()
    }

    /// Canonical bytes that get signed: all fields but the authorization.
    pub fn signing_payload(&self) -> Vec<u8> {
        let view = SigningView {
            id: &self.id,
            sender: &self.sender,
            recipient: &self.recipient,
            amount: self.amount,
            fee: self.fee,
            payload: &self.payload,
            action: self.action,
            timestamp: self.timestamp,
        };
        // Plain structs of strings/ints always serialize.
        serde_json::to_vec(&view).unwrap_or_default()
    }

    /// Structural and cryptographic check of a user-signed transaction.
    /// Never panics; any problem is `false`.
    pub fn verify(&self) -> bool {
        let Authorization::UserSigned {
            signature,
            public_key,
        } = &self.authorization
        else {
            return false;
        };
        if self.validate_user_fields().is_err() {
            return false;
        }
        match wallet::derive_address(public_key) {
            Ok(addr) if addr == self.sender => {}
            _ => return false,
        }
        wallet::verify(&self.signing_payload(), signature, public_key)
    }

    /// `verify()` for user transactions; relaxed rules for system rewards.
    pub fn is_valid(&self) -> bool {
        match &self.authorization {
            Authorization::SystemIssued => {
                self.sender == SYSTEM_ADDRESS
                    && wallet::is_valid_address(&self.recipient)
                    && self.recipient != SYSTEM_ADDRESS
                    && self.amount > 0
                    && self.fee == 0
                    && self.timestamp > 0
            }
            Authorization::Unsigned => false,
            Authorization::UserSigned { .. } => self.verify(),
        }
    }

    /// Double hash over the full serialized transaction, signature included.
    pub fn get_hash(&self) -> String {
        wallet::double_hash(self.to_json().as_bytes())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse an externally built (possibly pre-signed) transaction.
    /// Validity is checked separately with `is_valid()`.
    pub fn from_json(json: &str) -> Result<Self, TransactionError> {
        serde_json::from_str(json).map_err(|e| TransactionError::Json(e.to_string()))
    }

    pub fn is_system_issued(&self) -> bool {
        matches!(self.authorization, Authorization::SystemIssued)
    }

    /// What the sender gives up: amount plus fee.
    pub fn total_cost(&self) -> u128 {
        self.amount as u128 + self.fee as u128
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn payload(&self) -> &SupplyPayload {
        &self.payload
    }

    pub fn action(&self) -> SupplyAction {
        self.action
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }
}
