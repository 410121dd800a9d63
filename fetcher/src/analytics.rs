//! Per-second analytics: workers record outcomes into second buckets keyed
//! by `(cycle_id, second_offset)`; a 500ms timer drains the most recently
//! completed second and emits one summary line.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use broker::{keys, Broker};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[derive(Debug, Default, Clone)]
struct SecondBucket {
    ok: u64,
    fail: u64,
    timeout: u64,
    latencies_ms: Vec<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleTotals {
    ok: u64,
    total: u64,
}

/// Shared recording surface. Cheap to clone; every worker holds one.
#[derive(Debug, Clone, Default)]
pub struct Analytics {
    buckets: Arc<Mutex<HashMap<(u64, i64), SecondBucket>>>,
    cumulative: Arc<Mutex<HashMap<u64, CycleTotals>>>,
}

impl Analytics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&self, cycle_id: u64, second_offset: i64, latency_ms: u64) {
        self.bucket_mut(cycle_id, second_offset, |b| {
            b.ok += 1;
            b.latencies_ms.push(latency_ms);
        });
        self.totals_mut(cycle_id, |t| {
            t.ok += 1;
            t.total += 1;
        });
    }

    pub fn record_fail(&self, cycle_id: u64, second_offset: i64) {
        self.bucket_mut(cycle_id, second_offset, |b| b.fail += 1);
        self.totals_mut(cycle_id, |t| t.total += 1);
    }

    pub fn record_timeout(&self, cycle_id: u64, second_offset: i64) {
        self.bucket_mut(cycle_id, second_offset, |b| b.timeout += 1);
        self.totals_mut(cycle_id, |t| t.total += 1);
    }

    fn bucket_mut(&self, cycle_id: u64, second_offset: i64, f: impl FnOnce(&mut SecondBucket)) {
        #[allow(clippy::unwrap_used)]
        let mut buckets = self.buckets.lock().unwrap();
        f(buckets.entry((cycle_id, second_offset)).or_default());
    }

    fn totals_mut(&self, cycle_id: u64, f: impl FnOnce(&mut CycleTotals)) {
        #[allow(clippy::unwrap_used)]
        let mut totals = self.cumulative.lock().unwrap();
        f(totals.entry(cycle_id).or_default());
    }

    fn drain(&self, cycle_id: u64, second_offset: i64) -> Option<SecondBucket> {
        #[allow(clippy::unwrap_used)]
        self.buckets.lock().unwrap().remove(&(cycle_id, second_offset))
    }

    fn totals(&self, cycle_id: u64) -> CycleTotals {
        #[allow(clippy::unwrap_used)]
        self.cumulative.lock().unwrap().get(&cycle_id).copied().unwrap_or_default()
    }

    /// Evicts buckets and cumulative totals for cycles older than
    /// `current_cycle_id` so the maps stay bounded.
    fn reap_before(&self, current_cycle_id: u64) {
        #[allow(clippy::unwrap_used)]
        self.buckets.lock().unwrap().retain(|(cycle, _), _| *cycle >= current_cycle_id);
        #[allow(clippy::unwrap_used)]
        self.cumulative.lock().unwrap().retain(|cycle, _| *cycle >= current_cycle_id);
    }
}

/// 500ms reporter loop. Reads the broker's current cycle directly so it
/// needs no cooperation from the worker pool beyond the shared [`Analytics`]
/// buckets they write into.
pub struct AnalyticsReporter {
    analytics: Analytics,
    broker: Arc<dyn Broker>,
    last_reported: Mutex<Option<(u64, i64)>>,
}

impl AnalyticsReporter {
    #[must_use]
    pub fn new(analytics: Analytics, broker: Arc<dyn Broker>) -> Self {
        Self {
            analytics,
            broker,
            last_reported: Mutex::new(None),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) {
        let Ok(Some(cycle)) = self
            .broker
            .read_cycle(keys::CYCLE_ID, keys::CYCLE_START_MS)
            .await
        else {
            return;
        };

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let elapsed_ms = now_ms - cycle.start_ms;
        if elapsed_ms < 1000 {
            return;
        }
        let just_completed = elapsed_ms / 1000 - 1;

        #[allow(clippy::unwrap_used)]
        let already_reported = {
            let mut last = self.last_reported.lock().unwrap();
            let already = *last == Some((cycle.cycle_id, just_completed));
            if !already {
                *last = Some((cycle.cycle_id, just_completed));
            }
            already
        };
        if already_reported {
            return;
        }

        self.analytics.reap_before(cycle.cycle_id);

        let Some(bucket) = self.analytics.drain(cycle.cycle_id, just_completed) else {
            return;
        };
        let totals = self.analytics.totals(cycle.cycle_id);

        let (avg_ms, p99_ms) = latency_stats(&bucket.latencies_ms);
        info!(
            cycle_id = cycle.cycle_id,
            second = just_completed,
            ok = bucket.ok,
            fail = bucket.fail,
            timeout = bucket.timeout,
            cumulative_ok = totals.ok,
            cumulative_total = totals.total,
            avg_latency_ms = avg_ms,
            p99_latency_ms = p99_ms,
            "cycle analytics"
        );
    }
}

fn latency_stats(latencies_ms: &[u64]) -> (f64, u64) {
    if latencies_ms.is_empty() {
        return (0.0, 0);
    }
    let mut sorted = latencies_ms.to_vec();
    sorted.sort_unstable();
    let sum: u64 = sorted.iter().sum();
    let avg = sum as f64 / sorted.len() as f64;
    let p99_index = ((sorted.len() as f64) * 0.99).ceil() as usize;
    let p99_index = p99_index.saturating_sub(1).min(sorted.len() - 1);
    (avg, sorted[p99_index])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn latency_stats_computes_average_and_p99() {
        let latencies: Vec<u64> = (1..=100).collect();
        let (avg, p99) = latency_stats(&latencies);
        assert!((avg - 50.5).abs() < 0.01);
        assert_eq!(p99, 99);
    }

    #[test]
    fn latency_stats_handles_empty() {
        assert_eq!(latency_stats(&[]), (0.0, 0));
    }

    #[test]
    fn record_ok_increments_bucket_and_cumulative() {
        let analytics = Analytics::new();
        analytics.record_ok(1, 0, 120);
        analytics.record_fail(1, 0);
        let bucket = analytics.drain(1, 0).unwrap();
        assert_eq!(bucket.ok, 1);
        assert_eq!(bucket.fail, 1);
        assert_eq!(bucket.latencies_ms, vec![120]);
        let totals = analytics.totals(1);
        assert_eq!(totals.ok, 1);
        assert_eq!(totals.total, 2);
    }

    #[test]
    fn reap_before_drops_older_cycles() {
        let analytics = Analytics::new();
        analytics.record_ok(1, 0, 10);
        analytics.record_ok(2, 0, 10);
        analytics.reap_before(2);
        assert!(analytics.drain(1, 0).is_none());
        assert!(analytics.drain(2, 0).is_some());
    }
}
