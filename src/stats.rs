use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters shared by the workers and the sink.
#[derive(Debug, Default)]
pub struct PipelineStats {
    logs_received: AtomicU64,
    decode_errors: AtomicU64,
    stored: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    persist_retries: AtomicU64,
    reconnections: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub logs_received: u64,
    pub decode_errors: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub persist_retries: u64,
    pub reconnections: u64,
}

impl PipelineStats {
    pub fn log_received(&self) {
        self.logs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persist_retry(&self) {
        self.persist_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            logs_received: self.logs_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            persist_retries: self.persist_retries.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PipelineStats::default();
        stats.log_received();
        stats.log_received();
        stats.decode_error();
        stats.reconnected();

        let snap = stats.snapshot();
        assert_eq!(snap.logs_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.reconnections, 1);
        assert_eq!(snap.stored, 0);
    }
}
