use alloy::primitives::Address;
use dotenvy::dotenv;
use std::{collections::HashMap, env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

use crate::parser::{self, SubscriptionSpec};

/// Secondary contract shipped with the ICO deployment (the sale token).
pub const DEFAULT_SECONDARY_CONTRACTS: &str =
    "0x2C93585092Cf52Ce8B0947cB7A2680d17F2887D0@./abis/TokenERC20.json";
pub const DEFAULT_PRIMARY_ABI: &str = "./abis/TokenICO.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key} ({value:?}): {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot load ABI {path}: {reason}")]
    Abi { path: PathBuf, reason: String },

    #[error("no indexable events found in the configured ABIs")]
    NoEvents,
}

/// Exponential backoff: `initial`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractConfig {
    pub label: String,
    pub address: Address,
    pub abi_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider_url: String,
    pub contracts: Vec<ContractConfig>,
    pub store: StoreConfig,
    pub persist_max_attempts: u32,
    pub persist_backoff: Backoff,
    pub reconnect_backoff: Backoff,
    pub drain_grace: Duration,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub dead_letter_path: PathBuf,
    pub persist_raw_log: bool,
}

/// Loads `.env` (if present) and reads the process environment.
pub fn load() -> Result<Config, ConfigError> {
    dotenv().ok();
    let cfg = from_vars(env::vars())?;
    info!(
        provider = %cfg.provider_url,
        contracts = cfg.contracts.len(),
        database = %cfg.store.database,
        collection = %cfg.store.collection,
        "Loaded config"
    );
    Ok(cfg)
}

pub fn from_vars<I>(vars: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: HashMap<String, String> = vars
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect();
    let get = |key: &str| vars.get(key).map(|v| v.trim().to_string());

    let provider_url = websocket_url(get("PROVIDER_URL").ok_or(ConfigError::Missing("PROVIDER_URL"))?)?;

    let primary = ContractConfig {
        label: "primary".to_string(),
        address: parse_address("CONTRACT_ADDRESS", &get("CONTRACT_ADDRESS").ok_or(ConfigError::Missing("CONTRACT_ADDRESS"))?)?,
        abi_path: PathBuf::from(get("CONTRACT_ABI").unwrap_or_else(|| DEFAULT_PRIMARY_ABI.to_string())),
    };
    let mut contracts = vec![primary];
    let secondary = get("SECONDARY_CONTRACTS").unwrap_or_else(|| DEFAULT_SECONDARY_CONTRACTS.to_string());
    contracts.extend(parse_secondary(&secondary)?);

    // MONGODB_URI / DB_NAME / COLLECTION_NAME are accepted as aliases
    let store = StoreConfig {
        uri: get("STORE_URI")
            .or_else(|| get("MONGODB_URI"))
            .ok_or(ConfigError::Missing("STORE_URI"))?,
        database: identifier(
            "STORE_DATABASE",
            get("STORE_DATABASE")
                .or_else(|| get("DB_NAME"))
                .ok_or(ConfigError::Missing("STORE_DATABASE"))?,
        )?,
        collection: identifier(
            "STORE_COLLECTION",
            get("STORE_COLLECTION")
                .or_else(|| get("COLLECTION_NAME"))
                .ok_or(ConfigError::Missing("STORE_COLLECTION"))?,
        )?,
    };
    if matches!(store.database.to_ascii_lowercase().as_str(), "main" | "temp") {
        return Err(ConfigError::Invalid {
            key: "STORE_DATABASE",
            value: store.database,
            reason: "reserved schema name".into(),
        });
    }

    let persist_max_attempts: u32 = parse_or("PERSIST_MAX_ATTEMPTS", get("PERSIST_MAX_ATTEMPTS"), 5)?;
    if persist_max_attempts == 0 {
        return Err(ConfigError::Invalid {
            key: "PERSIST_MAX_ATTEMPTS",
            value: "0".into(),
            reason: "at least one attempt is required".into(),
        });
    }

    let persist_backoff = Backoff::new(
        Duration::from_millis(parse_or("PERSIST_BACKOFF_MS", get("PERSIST_BACKOFF_MS"), 200)?),
        Duration::from_millis(parse_or("PERSIST_MAX_BACKOFF_MS", get("PERSIST_MAX_BACKOFF_MS"), 5_000)?),
    );
    let reconnect_backoff = Backoff::new(
        Duration::from_millis(parse_or("RECONNECT_BACKOFF_MS", get("RECONNECT_BACKOFF_MS"), 1_000)?),
        Duration::from_millis(parse_or("RECONNECT_MAX_BACKOFF_MS", get("RECONNECT_MAX_BACKOFF_MS"), 60_000)?),
    );

    let queue_capacity: usize = parse_or("SINK_QUEUE_CAPACITY", get("SINK_QUEUE_CAPACITY"), 256)?;
    let max_in_flight: usize = parse_or("SINK_MAX_IN_FLIGHT", get("SINK_MAX_IN_FLIGHT"), 16)?;
    for (key, value) in [("SINK_QUEUE_CAPACITY", queue_capacity), ("SINK_MAX_IN_FLIGHT", max_in_flight)] {
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
    }

    Ok(Config {
        provider_url,
        contracts,
        store,
        persist_max_attempts,
        persist_backoff,
        reconnect_backoff,
        drain_grace: Duration::from_secs(parse_or("DRAIN_GRACE_SECS", get("DRAIN_GRACE_SECS"), 10)?),
        queue_capacity,
        max_in_flight,
        dead_letter_path: PathBuf::from(
            get("DEAD_LETTER_PATH").unwrap_or_else(|| "./dead_letters.jsonl".to_string()),
        ),
        persist_raw_log: parse_or("PERSIST_RAW_LOG", get("PERSIST_RAW_LOG"), false)?,
    })
}

impl Config {
    /// One subscription per (contract, known ABI event).
    pub fn subscriptions(&self) -> Result<Vec<SubscriptionSpec>, ConfigError> {
        let mut specs = Vec::new();
        for contract in &self.contracts {
            let abi = parser::load_abi(&contract.abi_path).map_err(|e| ConfigError::Abi {
                path: contract.abi_path.clone(),
                reason: e.to_string(),
            })?;
            let signatures = parser::known_events(&abi).map_err(|e| ConfigError::Abi {
                path: contract.abi_path.clone(),
                reason: e.to_string(),
            })?;
            if signatures.is_empty() {
                warn!("No indexable events in ABI for {} contract {}", contract.label, contract.address);
            }
            specs.extend(signatures.into_iter().map(|signature| SubscriptionSpec {
                contract: contract.address,
                signature,
            }));
        }
        if specs.is_empty() {
            return Err(ConfigError::NoEvents);
        }
        Ok(specs)
    }
}

/// Log subscriptions need a push transport; plain HTTP endpoints are refused.
fn websocket_url(value: String) -> Result<String, ConfigError> {
    let scheme = value.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("ws" | "wss") => Ok(value),
        _ => Err(ConfigError::Invalid {
            key: "PROVIDER_URL",
            value,
            reason: "expected a ws:// or wss:// endpoint".into(),
        }),
    }
}

fn parse_address(key: &'static str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value).map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `address@abi_path` entries, comma separated.
fn parse_secondary(value: &str) -> Result<Vec<ContractConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| {
            let (address, abi_path) = entry.split_once('@').ok_or_else(|| ConfigError::Invalid {
                key: "SECONDARY_CONTRACTS",
                value: entry.to_string(),
                reason: "expected address@abi_path".into(),
            })?;
            Ok(ContractConfig {
                label: format!("secondary[{i}]"),
                address: parse_address("SECONDARY_CONTRACTS", address.trim())?,
                abi_path: PathBuf::from(abi_path.trim()),
            })
        })
        .collect()
}

/// Store names are interpolated into SQL, so only plain identifiers pass.
fn identifier(key: &'static str, value: String) -> Result<String, ConfigError> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected [A-Za-z_][A-Za-z0-9_]*".into(),
        })
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ICO: &str = "0x1111111111111111111111111111111111111111";

    fn base() -> Vec<(String, String)> {
        [
            ("PROVIDER_URL", "wss://polygon.example/ws"),
            ("CONTRACT_ADDRESS", ICO),
            ("STORE_URI", ":memory:"),
            ("STORE_DATABASE", "ico"),
            ("STORE_COLLECTION", "events"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn with(mut vars: Vec<(String, String)>, key: &str, value: &str) -> Vec<(String, String)> {
        vars.retain(|(k, _)| k != key);
        vars.push((key.to_string(), value.to_string()));
        vars
    }

    fn without(mut vars: Vec<(String, String)>, key: &str) -> Vec<(String, String)> {
        vars.retain(|(k, _)| k != key);
        vars
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = from_vars(base()).unwrap();
        assert_eq!(cfg.provider_url, "wss://polygon.example/ws");
        assert_eq!(cfg.contracts.len(), 2);
        assert_eq!(cfg.contracts[0].abi_path, PathBuf::from(DEFAULT_PRIMARY_ABI));
        assert_eq!(
            cfg.contracts[1].address,
            Address::from_str("0x2C93585092Cf52Ce8B0947cB7A2680d17F2887D0").unwrap()
        );
        assert_eq!(cfg.persist_max_attempts, 5);
        assert_eq!(cfg.drain_grace, Duration::from_secs(10));
        assert!(!cfg.persist_raw_log);
    }

    #[test]
    fn every_required_setting_is_enforced() {
        for key in ["PROVIDER_URL", "CONTRACT_ADDRESS", "STORE_URI", "STORE_DATABASE", "STORE_COLLECTION"] {
            match from_vars(without(base(), key)) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, key),
                other => panic!("expected missing {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn http_provider_url_is_refused() {
        for url in ["https://polygon-rpc.com", "http://localhost:8545", "localhost:8546"] {
            match from_vars(with(base(), "PROVIDER_URL", url)) {
                Err(ConfigError::Invalid { key, value, .. }) => {
                    assert_eq!(key, "PROVIDER_URL");
                    assert_eq!(value, url);
                }
                other => panic!("expected {url} to be refused, got {other:?}"),
            }
        }
        assert!(from_vars(with(base(), "PROVIDER_URL", "WS://127.0.0.1:8546")).is_ok());
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = from_vars(with(base(), "PROVIDER_URL", "   ")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PROVIDER_URL")));
    }

    #[test]
    fn legacy_store_names_are_aliases() {
        let vars = without(without(without(base(), "STORE_URI"), "STORE_DATABASE"), "STORE_COLLECTION");
        let vars = with(with(with(vars, "MONGODB_URI", "events.db"), "DB_NAME", "ico"), "COLLECTION_NAME", "events");
        let cfg = from_vars(vars).unwrap();
        assert_eq!(
            cfg.store,
            StoreConfig {
                uri: "events.db".into(),
                database: "ico".into(),
                collection: "events".into()
            }
        );
    }

    #[test]
    fn secondary_contracts_are_parsed() {
        let vars = with(
            base(),
            "SECONDARY_CONTRACTS",
            "0x2222222222222222222222222222222222222222@a.json, 0x3333333333333333333333333333333333333333@b.json",
        );
        let cfg = from_vars(vars).unwrap();
        assert_eq!(cfg.contracts.len(), 3);
        assert_eq!(cfg.contracts[2].abi_path, PathBuf::from("b.json"));
        assert_eq!(cfg.contracts[2].label, "secondary[1]");

        let err = from_vars(with(base(), "SECONDARY_CONTRACTS", "0x2222")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SECONDARY_CONTRACTS", .. }));
    }

    #[test]
    fn rejects_unsafe_store_identifiers() {
        let err = from_vars(with(base(), "STORE_COLLECTION", "events; DROP")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STORE_COLLECTION", .. }));
        let err = from_vars(with(base(), "STORE_DATABASE", "main")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STORE_DATABASE", .. }));
    }

    #[test]
    fn rejects_unparsable_numbers() {
        let err = from_vars(with(base(), "PERSIST_MAX_ATTEMPTS", "many")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PERSIST_MAX_ATTEMPTS", .. }));
        let err = from_vars(with(base(), "SINK_MAX_IN_FLIGHT", "0")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SINK_MAX_IN_FLIGHT", .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::new(Duration::from_millis(200), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_secs(1));
        assert_eq!(b.delay(60), Duration::from_secs(1));
    }

    #[test]
    fn shipped_abis_yield_three_subscriptions() {
        let root = env!("CARGO_MANIFEST_DIR");
        let vars = with(base(), "CONTRACT_ABI", &format!("{root}/abis/TokenICO.json"));
        let vars = with(
            vars,
            "SECONDARY_CONTRACTS",
            &format!("0x2C93585092Cf52Ce8B0947cB7A2680d17F2887D0@{root}/abis/TokenERC20.json"),
        );
        let specs = from_vars(vars).unwrap().subscriptions().unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.signature.kind().as_str()).collect();
        assert_eq!(names, vec!["Purchase", "Referral", "Transfer"]);
    }

    #[test]
    fn unreadable_abi_is_a_config_error() {
        let vars = with(base(), "CONTRACT_ABI", "/nonexistent/abi.json");
        let err = from_vars(vars).unwrap().subscriptions().unwrap_err();
        assert!(matches!(err, ConfigError::Abi { .. }));
    }
}
