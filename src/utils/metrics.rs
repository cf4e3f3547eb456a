use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::task::TaskKind;

/// Stage counters and gauges
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Start time of the metrics collection
    start_time: DateTime<Utc>,

    catalog_page: StageCounters,
    novel: StageCounters,
    chapter: StageCounters,
}

#[derive(Debug, Default)]
struct StageCounters {
    running: AtomicI64,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    handler_millis: AtomicU64,
}

/// Point-in-time copy of one stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    /// Handler invocations in flight
    pub running: i64,

    /// Handler invocations started
    pub total: u64,

    pub succeeded: u64,

    pub failed: u64,

    /// Mean handler duration in milliseconds over finished invocations
    pub mean_millis: u64,
}

/// Snapshot of every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub start_time: DateTime<Utc>,
    pub catalog_page: StageMetrics,
    pub novel: StageMetrics,
    pub chapter: StageMetrics,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                start_time: Utc::now(),
                catalog_page: StageCounters::default(),
                novel: StageCounters::default(),
                chapter: StageCounters::default(),
            }),
        }
    }

    fn counters(&self, kind: TaskKind) -> &StageCounters {
        match kind {
            TaskKind::CatalogPage => &self.inner.catalog_page,
            TaskKind::Novel => &self.inner.novel,
            TaskKind::Chapter => &self.inner.chapter,
        }
    }

    /// Count a handler invocation for `kind` until the returned guard drops.
    ///
    /// The invocation is recorded as failed unless [`StageRun::succeed`] was called.
    pub fn start(&self, kind: TaskKind) -> StageRun {
        let counters = self.counters(kind);
        counters.running.fetch_add(1, Ordering::Relaxed);
        counters.total.fetch_add(1, Ordering::Relaxed);

        StageRun {
            collector: self.clone(),
            kind,
            start: Instant::now(),
            succeeded: false,
        }
    }

    pub fn stage(&self, kind: TaskKind) -> StageMetrics {
        let counters = self.counters(kind);
        let succeeded = counters.succeeded.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let finished = succeeded + failed;

        StageMetrics {
            running: counters.running.load(Ordering::Relaxed),
            total: counters.total.load(Ordering::Relaxed),
            succeeded,
            failed,
            mean_millis: if finished == 0 {
                0
            } else {
                counters.handler_millis.load(Ordering::Relaxed) / finished
            },
        }
    }

    /// Get all metrics
    pub fn get_metrics(&self) -> Metrics {
        Metrics {
            start_time: self.inner.start_time,
            catalog_page: self.stage(TaskKind::CatalogPage),
            novel: self.stage(TaskKind::Novel),
            chapter: self.stage(TaskKind::Chapter),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight handler invocation
pub struct StageRun {
    collector: MetricsCollector,
    kind: TaskKind,
    start: Instant,
    succeeded: bool,
}

impl StageRun {
    pub fn succeed(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for StageRun {
    fn drop(&mut self) {
        let counters = self.collector.counters(self.kind);
        counters.running.fetch_sub(1, Ordering::Relaxed);
        counters
            .handler_millis
            .fetch_add(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);

        if self.succeeded {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
