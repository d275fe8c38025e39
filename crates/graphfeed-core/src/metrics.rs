//! Process-wide counters for the write planner and live queries.
//!
//! Operations are counted per kind on both paths: applied by transforms and
//! emitted by live queries. [`Metrics::flush`] logs a [`MetricsSnapshot`]
//! as one `info!` event; the CLI calls it when a command finishes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::operation::Operation;

pub static METRICS: Metrics = Metrics::new();

/// Operation kinds in the order their counters are stored.
pub const OPERATION_KINDS: [&str; 7] = [
    "addRecord",
    "removeRecord",
    "replaceAttribute",
    "replaceHasOne",
    "replaceHasMany",
    "addToHasMany",
    "removeFromHasMany",
];

fn kind_slot(operation: &Operation) -> usize {
    match operation {
        Operation::AddRecord { .. } => 0,
        Operation::RemoveRecord { .. } => 1,
        Operation::ReplaceAttribute { .. } => 2,
        Operation::ReplaceHasOne { .. } => 3,
        Operation::ReplaceHasMany { .. } => 4,
        Operation::AddToHasMany { .. } => 5,
        Operation::RemoveFromHasMany { .. } => 6,
    }
}

struct PerKind([AtomicU64; 7]);

impl PerKind {
    const fn new() -> Self {
        Self([
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
            AtomicU64::new(0),
        ])
    }

    fn inc(&self, operation: &Operation) {
        self.0[kind_slot(operation)].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, kind: &str) -> u64 {
        OPERATION_KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|slot| self.0[slot].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        OPERATION_KINDS
            .iter()
            .zip(&self.0)
            .map(|(kind, count)| (*kind, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    fn reset(&self) {
        for count in &self.0 {
            count.store(0, Ordering::Relaxed);
        }
    }
}

pub struct Metrics {
    transforms_applied: AtomicU64,
    writes_issued: AtomicU64,
    live_queries_opened: AtomicU64,
    live_queries_failed: AtomicU64,
    applied: PerKind,
    emitted: PerKind,
}

/// Point-in-time copy of every counter. Per-kind lists omit zero counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transforms_applied: u64,
    pub writes_issued: u64,
    pub live_queries_opened: u64,
    pub live_queries_failed: u64,
    pub applied: Vec<(&'static str, u64)>,
    pub emitted: Vec<(&'static str, u64)>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            transforms_applied: AtomicU64::new(0),
            writes_issued: AtomicU64::new(0),
            live_queries_opened: AtomicU64::new(0),
            live_queries_failed: AtomicU64::new(0),
            applied: PerKind::new(),
            emitted: PerKind::new(),
        }
    }

    pub fn inc_transforms(&self) {
        self.transforms_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// One document write issued to the driver.
    pub fn inc_writes(&self) {
        self.writes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_live_queries(&self) {
        self.live_queries_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_live_query_failures(&self) {
        self.live_queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An operation the write planner finished applying.
    pub fn record_applied(&self, operation: &Operation) {
        self.applied.inc(operation);
        tracing::trace!(metric = "applied", kind = operation.kind(), "counter incremented");
    }

    /// An operation a live query or subscription emitted.
    pub fn record_emitted(&self, operation: &Operation) {
        self.emitted.inc(operation);
        tracing::trace!(metric = "emitted", kind = operation.kind(), "counter incremented");
    }

    pub fn transforms_applied(&self) -> u64 {
        self.transforms_applied.load(Ordering::Relaxed)
    }

    pub fn writes_issued(&self) -> u64 {
        self.writes_issued.load(Ordering::Relaxed)
    }

    pub fn live_queries_opened(&self) -> u64 {
        self.live_queries_opened.load(Ordering::Relaxed)
    }

    pub fn live_queries_failed(&self) -> u64 {
        self.live_queries_failed.load(Ordering::Relaxed)
    }

    /// Applied count for one operation kind, e.g. `"addRecord"`.
    pub fn applied(&self, kind: &str) -> u64 {
        self.applied.get(kind)
    }

    /// Emitted count for one operation kind.
    pub fn emitted(&self, kind: &str) -> u64 {
        self.emitted.get(kind)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transforms_applied: self.transforms_applied(),
            writes_issued: self.writes_issued(),
            live_queries_opened: self.live_queries_opened(),
            live_queries_failed: self.live_queries_failed(),
            applied: self.applied.snapshot(),
            emitted: self.emitted.snapshot(),
        }
    }

    pub fn flush(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            metric = "flush",
            transforms_applied = snapshot.transforms_applied,
            writes_issued = snapshot.writes_issued,
            live_queries_opened = snapshot.live_queries_opened,
            live_queries_failed = snapshot.live_queries_failed,
            applied = ?snapshot.applied,
            emitted = ?snapshot.emitted,
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.transforms_applied.store(0, Ordering::Relaxed);
        self.writes_issued.store(0, Ordering::Relaxed);
        self.live_queries_opened.store(0, Ordering::Relaxed);
        self.live_queries_failed.store(0, Ordering::Relaxed);
        self.applied.reset();
        self.emitted.reset();
    }
}
