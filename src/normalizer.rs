use alloy::primitives::U256;
use chrono::SecondsFormat;

use crate::models::{CanonicalRecord, ChainEvent, EventPayload, RecordBody};

/// Fixed-point precision of every amount the indexed contracts emit.
pub const TOKEN_DECIMALS: usize = 18;

/// Renders a fixed-point integer as a decimal string by exact truncation.
///
/// Always keeps one fractional digit and drops trailing zeros, so
/// `10^18` becomes `"1.0"` and `1` becomes `"0.000000000000000001"`.
pub fn format_units(value: U256, decimals: usize) -> String {
    let digits = value.to_string();
    let (int_part, frac_part) = if digits.len() > decimals {
        let (int_part, frac_part) = digits.split_at(digits.len() - decimals);
        (int_part.to_string(), frac_part.to_string())
    } else {
        ("0".to_string(), format!("{digits:0>decimals$}"))
    };
    let frac = frac_part.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    format!("{int_part}.{frac}")
}

/// Turns decoded events into store-ready records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    include_raw: bool,
}

impl Normalizer {
    /// `include_raw` embeds the hex source log in every record.
    pub fn new(include_raw: bool) -> Self {
        Self { include_raw }
    }

    pub fn normalize(&self, event: &ChainEvent) -> CanonicalRecord {
        let amount = |v: &U256| format_units(*v, TOKEN_DECIMALS);
        let body = match event.payload() {
            EventPayload::Purchase { user, token_amount } => RecordBody::Purchase {
                user: user.to_string(),
                token_amount: amount(token_amount),
            },
            EventPayload::Referral { referrer, user, referral_bonus } => RecordBody::Referral {
                referrer: referrer.to_string(),
                user: user.to_string(),
                referral_bonus: amount(referral_bonus),
            },
            EventPayload::Transfer { from, to, amount: value } => RecordBody::Transfer {
                from: from.to_string(),
                to: to.to_string(),
                amount: amount(value),
            },
        };

        let origin = event.origin();
        CanonicalRecord {
            natural_key: event.natural_key(),
            body,
            observed_at: event.observed_at().to_rfc3339_opts(SecondsFormat::Millis, true),
            chain_id: origin.chain_id,
            contract: origin.contract.to_string(),
            block_number: origin.block_number,
            transaction_hash: origin.transaction_hash.map(|h| h.to_string()),
            log_index: origin.log_index,
            raw: self.include_raw.then(|| event.raw().to_document()),
        }
    }
}
