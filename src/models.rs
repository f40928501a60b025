// src/models.rs
use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Event kinds the indexer knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Purchase,
    Referral,
    Transfer,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Purchase, EventKind::Referral, EventKind::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchase => "Purchase",
            EventKind::Referral => "Referral",
            EventKind::Transfer => "Transfer",
        }
    }

    /// Maps an ABI event name onto a kind. Unknown names are not indexed.
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Document fields that must be present and non-empty for this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::Purchase => &["user", "tokenAmount"],
            EventKind::Referral => &["referrer", "user", "referralBonus"],
            EventKind::Transfer => &["from", "to", "amount"],
        }
    }

    /// ABI types of the event arguments, in declaration order.
    pub fn argument_types(&self) -> &'static [&'static str] {
        match self {
            EventKind::Purchase => &["address", "uint256"],
            EventKind::Referral => &["address", "address", "uint256"],
            EventKind::Transfer => &["address", "address", "uint256"],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log entry exactly as a subscription delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl RawLog {
    pub fn to_document(&self) -> RawLogDocument {
        RawLogDocument {
            address: self.address.to_string(),
            topics: self.topics.iter().map(|t| t.to_string()).collect(),
            data: format!("0x{}", hex::encode(&self.data)),
        }
    }
}

/// Hex rendering of a raw log, used for audit output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawLogDocument {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

/// Where a log came from on chain. Immutable once the log is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOrigin {
    pub chain_id: u64,
    pub contract: Address,
    pub block_number: u64,
    pub transaction_hash: Option<B256>,
    pub log_index: u64,
}

impl LogOrigin {
    pub fn natural_key(&self, kind: EventKind) -> NaturalKey {
        NaturalKey(format!(
            "{}-{}-{}-{}",
            self.chain_id, self.block_number, self.log_index, kind
        ))
    }
}

/// Deduplication key: chain id, block, log index and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed arguments of a decoded event, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Purchase {
        user: Address,
        token_amount: U256,
    },
    Referral {
        referrer: Address,
        user: Address,
        referral_bonus: U256,
    },
    Transfer {
        from: Address,
        to: Address,
        amount: U256,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Purchase { .. } => EventKind::Purchase,
            EventPayload::Referral { .. } => EventKind::Referral,
            EventPayload::Transfer { .. } => EventKind::Transfer,
        }
    }
}

/// One observed contract event. The kind follows from the payload and
/// cannot change after construction.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    payload: EventPayload,
    observed_at: DateTime<Utc>,
    origin: LogOrigin,
    raw: Arc<RawLog>,
}

impl ChainEvent {
    pub fn new(
        payload: EventPayload,
        observed_at: DateTime<Utc>,
        origin: LogOrigin,
        raw: Arc<RawLog>,
    ) -> Self {
        Self { payload, observed_at, origin, raw }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn origin(&self) -> &LogOrigin {
        &self.origin
    }

    pub fn raw(&self) -> &Arc<RawLog> {
        &self.raw
    }

    pub fn natural_key(&self) -> NaturalKey {
        self.origin.natural_key(self.kind())
    }
}

/// Store-ready fields for each kind. Serialized with a `kind` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum RecordBody {
    #[serde(rename_all = "camelCase")]
    Purchase { user: String, token_amount: String },
    #[serde(rename_all = "camelCase")]
    Referral {
        referrer: String,
        user: String,
        referral_bonus: String,
    },
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
}

impl RecordBody {
    pub fn kind(&self) -> EventKind {
        match self {
            RecordBody::Purchase { .. } => EventKind::Purchase,
            RecordBody::Referral { .. } => EventKind::Referral,
            RecordBody::Transfer { .. } => EventKind::Transfer,
        }
    }

    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let fields: Vec<(&'static str, &str)> = match self {
            RecordBody::Purchase { user, token_amount } => {
                vec![("user", user.as_str()), ("tokenAmount", token_amount.as_str())]
            }
            RecordBody::Referral { referrer, user, referral_bonus } => vec![
                ("referrer", referrer.as_str()),
                ("user", user.as_str()),
                ("referralBonus", referral_bonus.as_str()),
            ],
            RecordBody::Transfer { from, to, amount } => vec![
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("amount", amount.as_str()),
            ],
        };
        fields
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} record {key} is missing required fields: {fields:?}")]
pub struct ValidationError {
    pub key: NaturalKey,
    pub kind: EventKind,
    pub fields: Vec<&'static str>,
}

/// Normalized representation of an event, as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    #[serde(rename = "_id")]
    pub natural_key: NaturalKey,
    #[serde(flatten)]
    pub body: RecordBody,
    pub observed_at: String,
    pub chain_id: u64,
    pub contract: String,
    pub block_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    pub log_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawLogDocument>,
}

impl CanonicalRecord {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut fields = self.body.missing_fields();
        if self.observed_at.is_empty() {
            fields.push("observedAt");
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                key: self.natural_key.clone(),
                kind: self.kind(),
                fields,
            })
        }
    }
}
