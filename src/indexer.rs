use futures_util::StreamExt;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{error, info, warn};

use crate::config::{Backoff, Config};
use crate::db::StoreError;
use crate::models::{CanonicalRecord, RawLog};
use crate::normalizer::Normalizer;
use crate::parser::{self, SubscriptionSpec};
use crate::rpc::{ChainSource, RawLogStream, SourceError};
use crate::sink::PersistenceSink;
use crate::stats::{PipelineStats, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    Subscribing,
    Listening,
    Reconnecting,
    Draining,
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("store could not be prepared: {0}")]
    Store(#[from] StoreError),

    #[error("chain endpoint unreachable: {0}")]
    Source(#[from] SourceError),

    #[error("no subscription could be opened ({} failed)", .failed.len())]
    NoSubscriptions { failed: Vec<(String, String)> },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub reconnect: Backoff,
    pub drain_grace: Duration,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub include_raw: bool,
}

impl From<&Config> for CoordinatorSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            reconnect: cfg.reconnect_backoff,
            drain_grace: cfg.drain_grace,
            queue_capacity: cfg.queue_capacity,
            max_in_flight: cfg.max_in_flight,
            include_raw: cfg.persist_raw_log,
        }
    }
}

/// Which pairs came up at startup.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub chain_id: u64,
    pub subscribed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    /// Queued or running persists cut off by the drain deadline.
    /// Each one was dead-lettered.
    pub abandoned_writes: usize,
}

/// Records handed to the sink writer whose persist has not finished yet.
#[derive(Default)]
struct PendingWrites {
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, CanonicalRecord>>,
}

impl PendingWrites {
    fn track(&self, record: &CanonicalRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, record.clone());
        id
    }

    fn done(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Everything still outstanding, in enqueue order.
    fn take_all(&self) -> Vec<CanonicalRecord> {
        let mut left: Vec<_> = self.lock().drain().collect();
        left.sort_by_key(|(id, _)| *id);
        left.into_iter().map(|(_, record)| record).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CanonicalRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Publishes coordinator state and folds per-worker reconnects into it.
struct StateTracker {
    tx: watch::Sender<CoordinatorState>,
    reconnecting: Mutex<usize>,
}

impl StateTracker {
    fn new() -> Self {
        let (tx, _) = watch::channel(CoordinatorState::Starting);
        Self {
            tx,
            reconnecting: Mutex::new(0),
        }
    }

    fn current(&self) -> CoordinatorState {
        *self.tx.borrow()
    }

    fn transition(&self, to: CoordinatorState) {
        let from = self.tx.send_replace(to);
        if from != to {
            info!(%from, %to, "Coordinator state changed");
        }
    }

    /// Moves between Listening and Reconnecting only; later states win.
    fn listening_transition(&self, to: CoordinatorState) {
        let mut from = CoordinatorState::Listening;
        let changed = self.tx.send_if_modified(|state| {
            let movable = matches!(*state, CoordinatorState::Listening | CoordinatorState::Reconnecting);
            if movable && *state != to {
                from = *state;
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(%from, %to, "Coordinator state changed");
        }
    }

    fn stream_lost(&self) {
        let mut n = self.reconnecting.lock().unwrap_or_else(|e| e.into_inner());
        *n += 1;
        self.listening_transition(CoordinatorState::Reconnecting);
    }

    fn stream_restored(&self) {
        let mut n = self.reconnecting.lock().unwrap_or_else(|e| e.into_inner());
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.listening_transition(CoordinatorState::Listening);
        }
    }
}

/// Owns every subscription and the route Decode → Normalize → Persist.
pub struct Coordinator {
    source: Arc<dyn ChainSource>,
    sink: Arc<PersistenceSink>,
    subscriptions: Vec<SubscriptionSpec>,
    settings: CoordinatorSettings,
    tracker: Arc<StateTracker>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn ChainSource>,
        sink: PersistenceSink,
        subscriptions: Vec<SubscriptionSpec>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            source,
            sink: Arc::new(sink),
            subscriptions,
            settings,
            tracker: Arc::new(StateTracker::new()),
        }
    }

    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.tracker.tx.subscribe()
    }

    /// Starts, waits for `shutdown`, then drains.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary, StartupError>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        shutdown.await;
        info!("Shutdown signal received");
        Ok(running.shutdown().await)
    }

    /// Subscribing → Listening. Pairs that fail to subscribe are reported
    /// and skipped; if none succeed startup fails.
    pub async fn start(self) -> Result<RunningCoordinator, StartupError> {
        info!(
            "Starting ingestion for {} subscriptions",
            self.subscriptions.len()
        );
        self.tracker.transition(CoordinatorState::Subscribing);

        if let Err(e) = self.sink.prepare().await {
            self.tracker.transition(CoordinatorState::Stopped);
            return Err(e.into());
        }
        let chain_id = match self.source.chain_id().await {
            Ok(id) => id,
            Err(e) => {
                self.tracker.transition(CoordinatorState::Stopped);
                return Err(e.into());
            }
        };
        info!("Connected to chain {}", chain_id);

        let mut report = StartupReport {
            chain_id,
            ..Default::default()
        };
        let mut opened = Vec::new();
        for spec in self.subscriptions {
            match self.source.subscribe(spec.contract, &spec.signature).await {
                Ok(stream) => {
                    report.subscribed.push(spec.to_string());
                    opened.push((spec, stream));
                }
                Err(e) => {
                    error!("Subscription {} failed: {}", spec, e);
                    report.failed.push((spec.to_string(), e.to_string()));
                }
            }
        }
        if opened.is_empty() {
            self.tracker.transition(CoordinatorState::Stopped);
            return Err(StartupError::NoSubscriptions { failed: report.failed });
        }
        if !report.failed.is_empty() {
            warn!(
                "Partial startup: {} of {} subscriptions open",
                report.subscribed.len(),
                report.subscribed.len() + report.failed.len()
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (record_tx, record_rx) = mpsc::channel(self.settings.queue_capacity);
        let pending = Arc::new(PendingWrites::default());
        let writer = tokio::spawn(run_writer(
            record_rx,
            Arc::clone(&self.sink),
            self.settings.max_in_flight,
            Arc::clone(&pending),
        ));

        let normalizer = Normalizer::new(self.settings.include_raw);
        let mut workers = JoinSet::new();
        for (spec, stream) in opened {
            let worker = Worker {
                spec,
                chain_id,
                source: Arc::clone(&self.source),
                normalizer,
                records: record_tx.clone(),
                pending: Arc::clone(&pending),
                shutdown: shutdown_rx.clone(),
                reconnect: self.settings.reconnect,
                tracker: Arc::clone(&self.tracker),
                stats: Arc::clone(self.sink.stats()),
            };
            workers.spawn(worker.run(stream));
        }
        // workers hold the only senders; the writer stops once they all exit
        drop(record_tx);

        self.tracker.transition(CoordinatorState::Listening);
        Ok(RunningCoordinator {
            report,
            sink: self.sink,
            tracker: self.tracker,
            drain_grace: self.settings.drain_grace,
            pending,
            shutdown_tx,
            workers,
            writer,
        })
    }
}

/// A started coordinator. Call [`RunningCoordinator::shutdown`] to drain.
pub struct RunningCoordinator {
    report: StartupReport,
    sink: Arc<PersistenceSink>,
    tracker: Arc<StateTracker>,
    drain_grace: Duration,
    pending: Arc<PendingWrites>,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
    writer: JoinHandle<()>,
}

impl RunningCoordinator {
    pub fn report(&self) -> &StartupReport {
        &self.report
    }

    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.tracker.tx.subscribe()
    }

    pub fn current_state(&self) -> CoordinatorState {
        self.tracker.current()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.sink.stats().snapshot()
    }

    /// Draining → Stopped: stop reading logs, let queued and in-flight
    /// persists finish within the grace period, then close the store.
    /// Writes still outstanding at the deadline are dead-lettered.
    pub async fn shutdown(mut self) -> RunSummary {
        let _ = self.shutdown_tx.send(true);
        self.tracker.transition(CoordinatorState::Draining);

        let workers = &mut self.workers;
        let writer = &mut self.writer;
        let drained = timeout(self.drain_grace, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!("Subscription worker panicked: {:?}", e);
                }
            }
            writer.await
        })
        .await;

        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Sink writer failed: {:?}", e),
            Err(_) => {
                warn!(
                    "Drain deadline of {:?} passed with {} writes pending, abandoning them",
                    self.drain_grace,
                    self.pending.len()
                );
                self.workers.abort_all();
                while self.workers.join_next().await.is_some() {}
                self.writer.abort();
                let _ = (&mut self.writer).await;
            }
        }

        let abandoned = self.pending.take_all();
        let abandoned_writes = abandoned.len();
        for record in &abandoned {
            self.sink.abandon(record, "drain deadline passed before the write finished").await;
        }

        if let Err(e) = self.sink.close().await {
            error!("Failed to close store: {}", e);
        } else {
            info!("Store connection closed");
        }
        self.tracker.transition(CoordinatorState::Stopped);

        let stats = self.sink.stats().snapshot();
        info!(
            received = stats.logs_received,
            stored = stats.stored,
            duplicates = stats.duplicates,
            decode_errors = stats.decode_errors,
            rejected = stats.rejected,
            dead_lettered = stats.dead_lettered,
            reconnections = stats.reconnections,
            abandoned_writes,
            "Ingestion stopped"
        );
        RunSummary {
            stats,
            abandoned_writes,
        }
    }
}

/// One (contract, event) subscription: read, decode, normalize, enqueue.
struct Worker {
    spec: SubscriptionSpec,
    chain_id: u64,
    source: Arc<dyn ChainSource>,
    normalizer: Normalizer,
    records: mpsc::Sender<(u64, CanonicalRecord)>,
    pending: Arc<PendingWrites>,
    shutdown: watch::Receiver<bool>,
    reconnect: Backoff,
    tracker: Arc<StateTracker>,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(mut self, mut stream: RawLogStream) {
        loop {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = stopped(&mut self.shutdown) => {
                        info!("Unsubscribing {}", self.spec);
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(raw) => self.handle(raw).await,
                    None => break,
                }
            }

            warn!("Subscription {} ended, reconnecting", self.spec);
            self.tracker.stream_lost();
            match self.resubscribe().await {
                Some(fresh) => stream = fresh,
                None => return,
            }
        }
    }

    async fn handle(&self, raw: RawLog) {
        self.stats.log_received();
        let raw = Arc::new(raw);
        let event = match parser::decode(&raw, &self.spec.signature, self.chain_id) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_error();
                let doc = raw.to_document();
                warn!(
                    subscription = %self.spec,
                    address = %doc.address,
                    topics = ?doc.topics,
                    data = %doc.data,
                    tx = ?raw.transaction_hash,
                    "Dropping undecodable log: {}",
                    e
                );
                return;
            }
        };

        let record = self.normalizer.normalize(&event);
        let id = self.pending.track(&record);
        if self.records.send((id, record)).await.is_err() {
            self.pending.done(id);
            error!("Sink writer is gone, dropping {}", event.natural_key());
        }
    }

    /// Returns `None` when shutdown arrives first.
    async fn resubscribe(&mut self) -> Option<RawLogStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = self.reconnect.delay(attempt);
            tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => {
                    self.tracker.stream_restored();
                    return None;
                }
                _ = sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => {
                    self.tracker.stream_restored();
                    return None;
                }
                result = self.source.subscribe(self.spec.contract, &self.spec.signature) => result,
            };
            match result {
                Ok(stream) => {
                    info!("Resubscribed {} after {} attempt(s)", self.spec, attempt);
                    self.stats.reconnected();
                    self.tracker.stream_restored();
                    return Some(stream);
                }
                Err(e) => warn!(attempt, "Resubscribe {} failed: {}", self.spec, e),
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender also means stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drains the record queue into the sink with at most `max_in_flight`
/// concurrent persists. Each record leaves `pending` once its persist returns.
async fn run_writer(
    mut records: mpsc::Receiver<(u64, CanonicalRecord)>,
    sink: Arc<PersistenceSink>,
    max_in_flight: usize,
    pending: Arc<PendingWrites>,
) {
    let mut in_flight = JoinSet::new();
    while let Some((id, record)) = records.recv().await {
        while in_flight.len() >= max_in_flight.max(1) {
            if let Some(Err(e)) = in_flight.join_next().await {
                error!("Persist task panicked: {:?}", e);
            }
        }
        let sink = Arc::clone(&sink);
        let pending = Arc::clone(&pending);
        in_flight.spawn(async move {
            sink.persist(&record).await;
            pending.done(id);
        });
    }
    while let Some(res) = in_flight.join_next().await {
        if let Err(e) = res {
            error!("Persist task panicked: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, LogOrigin, RecordBody};
    use alloy::primitives::Address;

    fn record(log_index: u64) -> CanonicalRecord {
        let origin = LogOrigin {
            chain_id: 1,
            contract: Address::repeat_byte(0x11),
            block_number: 8,
            transaction_hash: None,
            log_index,
        };
        CanonicalRecord {
            natural_key: origin.natural_key(EventKind::Purchase),
            body: RecordBody::Purchase {
                user: Address::repeat_byte(0x01).to_string(),
                token_amount: "1.0".into(),
            },
            observed_at: "2026-10-18T12:00:00.000Z".into(),
            chain_id: 1,
            contract: origin.contract.to_string(),
            block_number: 8,
            transaction_hash: None,
            log_index,
            raw: None,
        }
    }

    #[test]
    fn pending_writes_hand_back_unfinished_records_in_order() {
        let pending = PendingWrites::default();
        let ids: Vec<_> = (0..4).map(|i| pending.track(&record(i))).collect();
        pending.done(ids[1]);
        assert_eq!(pending.len(), 3);

        let left: Vec<_> = pending.take_all().into_iter().map(|r| r.log_index).collect();
        assert_eq!(left, vec![0, 2, 3]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn reconnecting_never_overrides_draining() {
        let tracker = StateTracker::new();
        tracker.transition(CoordinatorState::Listening);
        tracker.stream_lost();
        assert_eq!(tracker.current(), CoordinatorState::Reconnecting);

        tracker.transition(CoordinatorState::Draining);
        tracker.stream_restored();
        tracker.stream_lost();
        assert_eq!(tracker.current(), CoordinatorState::Draining);
    }
}
