// src/rpc.rs
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use futures_util::{future, Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::RawLog;
use crate::parser::EventSignature;

/// Logs from one subscription. Ends when the connection drops.
pub type RawLogStream = Pin<Box<dyn Stream<Item = RawLog> + Send>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("subscription to {event} on {contract} failed: {reason}")]
    Subscribe {
        contract: Address,
        event: String,
        reason: String,
    },

    #[error("RPC request failed: {0}")]
    Rpc(String),
}

/// A live chain endpoint that can be subscribed to per (contract, event).
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn chain_id(&self) -> Result<u64, SourceError>;

    /// Opens a new subscription. A finished stream is not restartable;
    /// call `subscribe` again.
    async fn subscribe(
        &self,
        contract: Address,
        signature: &EventSignature,
    ) -> Result<RawLogStream, SourceError>;
}

impl From<Log> for RawLog {
    fn from(log: Log) -> Self {
        RawLog {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

/// WebSocket subscription source backed by an alloy provider.
pub struct AlloyChainSource {
    provider: DynProvider,
}

impl AlloyChainSource {
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        info!("📡 Connecting to chain endpoint {}", url);
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(url))
            .await
            .map_err(|e| SourceError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .erased();
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainSource for AlloyChainSource {
    async fn chain_id(&self) -> Result<u64, SourceError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| SourceError::Rpc(e.to_string()))
    }

    async fn subscribe(
        &self,
        contract: Address,
        signature: &EventSignature,
    ) -> Result<RawLogStream, SourceError> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(signature.selector());

        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| SourceError::Subscribe {
                contract,
                event: signature.name().to_string(),
                reason: e.to_string(),
            })?;
        info!("Subscribed to {} on {}", signature, contract);

        // reorged-out logs are announced with `removed: true`; never store them
        let stream = subscription.into_stream().filter_map(|log| {
            if log.removed {
                debug!("Skipping removed log {:?}", log.transaction_hash);
                future::ready(None)
            } else {
                future::ready(Some(RawLog::from(log)))
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData, B256};

    #[test]
    fn converts_rpc_log_into_raw_log() {
        let topics = vec![B256::repeat_byte(0x01), B256::repeat_byte(0x02)];
        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x11),
                data: LogData::new_unchecked(topics.clone(), Bytes::from(vec![0u8; 32])),
            },
            block_number: Some(42),
            transaction_hash: Some(B256::repeat_byte(0xaa)),
            log_index: Some(7),
            ..Default::default()
        };

        let raw = RawLog::from(log);
        assert_eq!(raw.address, Address::repeat_byte(0x11));
        assert_eq!(raw.topics, topics);
        assert_eq!(raw.data.len(), 32);
        assert_eq!(raw.block_number, Some(42));
        assert_eq!(raw.log_index, Some(7));
    }
}
