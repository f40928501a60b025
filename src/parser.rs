// src/parser.rs
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use std::{fmt, fs, path::Path, sync::Arc};
use thiserror::Error;

use crate::models::{ChainEvent, EventKind, EventPayload, LogOrigin, RawLog};

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ABI JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event {event} declares ({found}), expected ({expected})")]
    Shape {
        event: String,
        expected: String,
        found: String,
    },

    #[error("event {0} is anonymous and has no selector topic")]
    Anonymous(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("topic0 {found:?} does not match {event} selector {expected}")]
    UnknownEvent {
        event: String,
        expected: B256,
        found: Option<B256>,
    },

    #[error("{event} declares {expected} arguments, log carries {found}")]
    ArgumentCount {
        event: String,
        expected: usize,
        found: usize,
    },

    #[error("{event} argument #{position} is not a left-padded address: {word}")]
    BadAddress {
        event: String,
        position: usize,
        word: B256,
    },

    #[error("log has no {0}")]
    MissingOrigin(&'static str),
}

/// An ABI event the indexer can decode, tied to its kind.
#[derive(Debug, Clone)]
pub struct EventSignature {
    kind: EventKind,
    event: Event,
    selector: B256,
}

impl EventSignature {
    /// Fails when the ABI declares arguments that do not fit the kind.
    pub fn new(kind: EventKind, event: Event) -> Result<Self, AbiError> {
        if event.anonymous {
            return Err(AbiError::Anonymous(event.name.clone()));
        }
        let found: Vec<&str> = event.inputs.iter().map(|p| p.ty.as_str()).collect();
        let expected = kind.argument_types();
        if found != expected {
            return Err(AbiError::Shape {
                event: event.name.clone(),
                expected: expected.join(","),
                found: found.join(","),
            });
        }
        let selector = event.selector();
        Ok(Self { kind, event, selector })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn selector(&self) -> B256 {
        self.selector
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> String {
        self.event.signature()
    }

    pub fn arity(&self) -> usize {
        self.event.inputs.len()
    }

    fn indexed_count(&self) -> usize {
        self.event.inputs.iter().filter(|p| p.indexed).count()
    }
}

impl fmt::Display for EventSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// A (contract, event) pair to subscribe to.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub contract: Address,
    pub signature: EventSignature,
}

impl fmt::Display for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contract, self.signature.name())
    }
}

/// Accepts a bare ABI array or a build artifact with an `abi` field.
pub fn parse_abi(json: &str) -> Result<JsonAbi, AbiError> {
    let mut value: serde_json::Value = serde_json::from_str(json)?;
    if let Some(abi) = value.get_mut("abi") {
        value = abi.take();
    }
    Ok(serde_json::from_value(value)?)
}

pub fn load_abi(path: &Path) -> Result<JsonAbi, AbiError> {
    parse_abi(&fs::read_to_string(path)?)
}

/// Signatures for every ABI event whose name is a known kind.
pub fn known_events(abi: &JsonAbi) -> Result<Vec<EventSignature>, AbiError> {
    abi.events()
        .filter_map(|event| EventKind::from_event_name(&event.name).map(|kind| (kind, event)))
        .map(|(kind, event)| EventSignature::new(kind, event.clone()))
        .collect()
}

/// Decodes a raw log against `signature`, stamping it with the current time.
pub fn decode(
    raw: &Arc<RawLog>,
    signature: &EventSignature,
    chain_id: u64,
) -> Result<ChainEvent, DecodeError> {
    decode_at(raw, signature, chain_id, Utc::now())
}

pub fn decode_at(
    raw: &Arc<RawLog>,
    signature: &EventSignature,
    chain_id: u64,
    observed_at: DateTime<Utc>,
) -> Result<ChainEvent, DecodeError> {
    let event = signature.name();
    let topic0 = raw.topics.first().copied();
    if topic0 != Some(signature.selector()) {
        return Err(DecodeError::UnknownEvent {
            event: event.to_string(),
            expected: signature.selector(),
            found: topic0,
        });
    }

    // indexed args live in topics[1..], the rest in 32-byte data words
    let topic_args = raw.topics.len() - 1;
    let data_words = raw.data.len() / 32;
    let indexed = signature.indexed_count();
    if topic_args != indexed
        || raw.data.len() % 32 != 0
        || data_words != signature.arity() - indexed
    {
        return Err(DecodeError::ArgumentCount {
            event: event.to_string(),
            expected: signature.arity(),
            found: topic_args + data_words,
        });
    }

    // words in declared order; the counts above guarantee one per input
    let mut topics = raw.topics[1..].iter().copied();
    let mut data = raw.data.chunks_exact(32).map(B256::from_slice);
    let words: Vec<B256> = signature
        .event
        .inputs
        .iter()
        .filter_map(|param| if param.indexed { topics.next() } else { data.next() })
        .collect();
    let address = |position: usize| {
        word_to_address(words[position]).ok_or_else(|| DecodeError::BadAddress {
            event: event.to_string(),
            position,
            word: words[position],
        })
    };
    let uint = |position: usize| U256::from_be_bytes(words[position].0);

    // argument types per kind were checked when the signature was built
    let payload = match signature.kind() {
        EventKind::Purchase => EventPayload::Purchase {
            user: address(0)?,
            token_amount: uint(1),
        },
        EventKind::Referral => EventPayload::Referral {
            referrer: address(0)?,
            user: address(1)?,
            referral_bonus: uint(2),
        },
        EventKind::Transfer => EventPayload::Transfer {
            from: address(0)?,
            to: address(1)?,
            amount: uint(2),
        },
    };

    let origin = LogOrigin {
        chain_id,
        contract: raw.address,
        block_number: raw.block_number.ok_or(DecodeError::MissingOrigin("block number"))?,
        transaction_hash: raw.transaction_hash,
        log_index: raw.log_index.ok_or(DecodeError::MissingOrigin("log index"))?,
    };

    Ok(ChainEvent::new(payload, observed_at, origin, Arc::clone(raw)))
}

/// Addresses are right-aligned in a word; the upper 12 bytes must be zero.
fn word_to_address(word: B256) -> Option<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy::primitives::Bytes;

    pub(crate) const ICO_ABI: &str = include_str!("../abis/TokenICO.json");
    pub(crate) const ERC20_ABI: &str = include_str!("../abis/TokenERC20.json");

    pub(crate) fn signature(abi: &str, kind: EventKind) -> EventSignature {
        known_events(&parse_abi(abi).unwrap())
            .unwrap()
            .into_iter()
            .find(|s| s.kind() == kind)
            .unwrap()
    }

    pub(crate) fn address_topic(addr: Address) -> B256 {
        addr.into_word()
    }

    pub(crate) fn amount_data(amount: U256) -> Bytes {
        Bytes::from(amount.to_be_bytes::<32>().to_vec())
    }

    pub(crate) fn purchase_log(user: Address, amount: U256) -> RawLog {
        let sig = signature(ICO_ABI, EventKind::Purchase);
        RawLog {
            address: Address::repeat_byte(0x11),
            topics: vec![sig.selector(), address_topic(user)],
            data: amount_data(amount),
            block_number: Some(100),
            transaction_hash: Some(B256::repeat_byte(0xaa)),
            log_index: Some(3),
        }
    }

    #[test]
    fn loads_artifact_and_bare_abi() {
        let artifact = parse_abi(ICO_ABI).unwrap();
        assert!(artifact.events().any(|e| e.name == "Purchase"));

        let bare = parse_abi(
            r#"[{"type":"event","name":"Transfer","anonymous":false,"inputs":[
                {"name":"from","type":"address","indexed":true},
                {"name":"to","type":"address","indexed":true},
                {"name":"value","type":"uint256","indexed":false}]}]"#,
        )
        .unwrap();
        let sigs = known_events(&bare).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].signature(), "Transfer(address,address,uint256)");
    }

    #[test]
    fn transfer_selector_matches_erc20_topic() {
        let sig = signature(ERC20_ABI, EventKind::Transfer);
        assert_eq!(
            sig.selector().to_string(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn unknown_event_names_are_ignored() {
        let sigs = known_events(&parse_abi(ERC20_ABI).unwrap()).unwrap();
        let kinds: Vec<_> = sigs.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Transfer]);
    }

    #[test]
    fn rejects_abi_with_wrong_argument_shape() {
        let abi = parse_abi(
            r#"[{"type":"event","name":"Purchase","anonymous":false,"inputs":[
                {"name":"user","type":"address","indexed":true}]}]"#,
        )
        .unwrap();
        assert!(matches!(known_events(&abi), Err(AbiError::Shape { .. })));
    }

    #[test]
    fn decodes_purchase_in_declared_order() {
        let user = Address::repeat_byte(0xab);
        let raw = Arc::new(purchase_log(user, U256::from(7u64)));
        let sig = signature(ICO_ABI, EventKind::Purchase);
        let event = decode(&raw, &sig, 137).unwrap();

        assert_eq!(event.kind(), EventKind::Purchase);
        assert_eq!(
            event.payload(),
            &EventPayload::Purchase { user, token_amount: U256::from(7u64) }
        );
        assert_eq!(event.origin().block_number, 100);
        assert_eq!(event.origin().log_index, 3);
        assert_eq!(event.natural_key().as_str(), "137-100-3-Purchase");
        assert!(Arc::ptr_eq(event.raw(), &raw));
    }

    #[test]
    fn decodes_referral_with_two_indexed_addresses() {
        let sig = signature(ICO_ABI, EventKind::Referral);
        let referrer = Address::repeat_byte(0x01);
        let user = Address::repeat_byte(0x02);
        let raw = Arc::new(RawLog {
            address: Address::repeat_byte(0x11),
            topics: vec![sig.selector(), address_topic(referrer), address_topic(user)],
            data: amount_data(U256::from(5u64)),
            block_number: Some(9),
            transaction_hash: None,
            log_index: Some(0),
        });
        let event = decode(&raw, &sig, 1).unwrap();
        assert_eq!(
            event.payload(),
            &EventPayload::Referral { referrer, user, referral_bonus: U256::from(5u64) }
        );
    }

    #[test]
    fn one_missing_argument_is_rejected() {
        let sig = signature(ERC20_ABI, EventKind::Transfer);
        let raw = Arc::new(RawLog {
            address: Address::repeat_byte(0x22),
            // `to` topic dropped
            topics: vec![sig.selector(), address_topic(Address::repeat_byte(0x01))],
            data: amount_data(U256::from(1u64)),
            block_number: Some(1),
            transaction_hash: None,
            log_index: Some(0),
        });
        let err = decode(&raw, &sig, 1).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ArgumentCount { event: "Transfer".into(), expected: 3, found: 2 }
        );
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut log = purchase_log(Address::repeat_byte(0x01), U256::from(1u64));
        log.data = Bytes::from(vec![0u8; 31]);
        let sig = signature(ICO_ABI, EventKind::Purchase);
        assert!(matches!(
            decode(&Arc::new(log), &sig, 1),
            Err(DecodeError::ArgumentCount { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn foreign_selector_is_rejected() {
        let mut log = purchase_log(Address::repeat_byte(0x01), U256::from(1u64));
        log.topics[0] = B256::repeat_byte(0xee);
        let sig = signature(ICO_ABI, EventKind::Purchase);
        assert!(matches!(
            decode(&Arc::new(log), &sig, 1),
            Err(DecodeError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn dirty_address_padding_is_rejected() {
        let mut log = purchase_log(Address::repeat_byte(0x01), U256::from(1u64));
        log.topics[1] = B256::repeat_byte(0xff);
        let sig = signature(ICO_ABI, EventKind::Purchase);
        assert!(matches!(
            decode(&Arc::new(log), &sig, 1),
            Err(DecodeError::BadAddress { position: 0, .. })
        ));
    }

    #[test]
    fn pending_log_without_index_is_rejected() {
        let mut log = purchase_log(Address::repeat_byte(0x01), U256::from(1u64));
        log.log_index = None;
        let sig = signature(ICO_ABI, EventKind::Purchase);
        assert_eq!(
            decode(&Arc::new(log), &sig, 1).unwrap_err(),
            DecodeError::MissingOrigin("log index")
        );
    }
}
