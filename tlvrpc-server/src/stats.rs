//! Server statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every reactor thread of one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    pub requests_total: AtomicU64,
    pub responses_total: AtomicU64,
    pub unknown_types_total: AtomicU64,
    pub handler_panics_total: AtomicU64,
    pub errors_total: AtomicU64,
    /// Connections handed to each worker reactor (multi-reactor only).
    worker_assignments: Box<[AtomicU64]>,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub requests_total: u64,
    pub responses_total: u64,
    pub unknown_types_total: u64,
    pub handler_panics_total: u64,
    pub errors_total: u64,
    pub worker_assignments: Vec<u64>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates stats with one assignment counter per worker reactor.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            worker_assignments: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn connection_opened(&self) -> u64 {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_assigned(&self, worker: usize) {
        if let Some(counter) = self.worker_assignments.get(worker) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn worker_assignments(&self) -> Vec<u64> {
        self.worker_assignments
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            responses_total: self.responses_total.load(Ordering::Relaxed),
            unknown_types_total: self.unknown_types_total.load(Ordering::Relaxed),
            handler_panics_total: self.handler_panics_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            worker_assignments: self.worker_assignments(),
        }
    }
}
