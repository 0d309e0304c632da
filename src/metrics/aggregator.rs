//! Rolling per-quota counters and latency percentiles.
//!
//! Every quota owns one lock-protected cell. Observations bump both the
//! cumulative counters (reported by `current`) and the open window; `roll`
//! closes the window into a series point and starts a new one.

use crate::config::MetricsConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Err,
    R429,
}

impl Outcome {
    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            429 => Outcome::R429,
            code if code >= 400 => Outcome::Err,
            _ => Outcome::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Err => "err",
            Outcome::R429 => "r429",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub ok: u64,
    pub err: u64,
    pub r429: u64,
}

impl Counts {
    fn bump(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Err => self.err += 1,
            Outcome::R429 => self.r429 += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.ok + self.err + self.r429
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsCurrent {
    pub ok: u64,
    pub err: u64,
    pub r429: u64,
    pub tokens_remain: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeriesPoint {
    pub ts: DateTime<Utc>,
    pub quota_id: String,
    pub ok: u64,
    pub err: u64,
    pub r429: u64,
    pub latency_p95: Option<f64>,
    pub tokens_remain: Option<f64>,
}

struct QuotaMetrics {
    cumulative: Counts,
    window: Counts,
    reservoir: Vec<f64>,
    seen: u64,
    tokens_remain: Option<f64>,
    series: VecDeque<MetricSeriesPoint>,
}

impl QuotaMetrics {
    fn new() -> Self {
        Self {
            cumulative: Counts::default(),
            window: Counts::default(),
            reservoir: Vec::new(),
            seen: 0,
            tokens_remain: None,
            series: VecDeque::new(),
        }
    }

    /// Algorithm R: every sample of the window has the same chance of being
    /// kept in a reservoir of `size` slots.
    fn sample(&mut self, latency_ms: f64, size: usize) {
        self.seen += 1;
        if self.reservoir.len() < size {
            self.reservoir.push(latency_ms);
            return;
        }
        let slot = rand::thread_rng().gen_range(0..self.seen);
        if let Ok(slot) = usize::try_from(slot) {
            if slot < size {
                self.reservoir[slot] = latency_ms;
            }
        }
    }
}

pub struct MetricsAggregator {
    quotas: DashMap<String, Arc<Mutex<QuotaMetrics>>>,
    series_capacity: usize,
    reservoir_size: usize,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            quotas: DashMap::new(),
            series_capacity: config.series_capacity.max(1),
            reservoir_size: config.reservoir_size.max(1),
        }
    }

    fn cell(&self, quota_id: &str) -> Option<Arc<Mutex<QuotaMetrics>>> {
        self.quotas.get(quota_id).map(|cell| Arc::clone(cell.value()))
    }

    /// Start collecting for `quota_id`. Only tracked ids accept observations,
    /// and they get series points even while idle.
    pub fn track(&self, quota_id: &str) {
        self.quotas
            .entry(quota_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaMetrics::new())));
    }

    pub fn forget(&self, quota_id: &str) {
        self.quotas.remove(quota_id);
    }

    /// Count one outcome. Ids that are not tracked are ignored.
    pub fn observe(&self, quota_id: &str, outcome: Outcome, latency_ms: Option<f64>) {
        let Some(cell) = self.cell(quota_id) else {
            return;
        };
        let mut m = cell.lock();
        m.cumulative.bump(outcome);
        m.window.bump(outcome);
        if let Some(latency) = latency_ms.filter(|l| l.is_finite()) {
            m.sample(latency, self.reservoir_size);
        }
    }

    pub fn set_tokens(&self, quota_id: &str, tokens_remain: f64) {
        if let Some(cell) = self.cell(quota_id) {
            cell.lock().tokens_remain = Some(tokens_remain);
        }
    }

    /// Close the open window of every quota into a series point stamped `ts`.
    ///
    /// `tokens` supplies the live level; quotas it doesn't know keep their
    /// last observed level.
    pub fn roll<F>(&self, ts: DateTime<Utc>, tokens: F) -> usize
    where
        F: Fn(&str) -> Option<f64>,
    {
        let cells: Vec<(String, Arc<Mutex<QuotaMetrics>>)> = self
            .quotas
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (quota_id, cell) in &cells {
            let live = tokens(quota_id);
            let mut m = cell.lock();
            if live.is_some() {
                m.tokens_remain = live;
            }

            let point = MetricSeriesPoint {
                ts,
                quota_id: quota_id.clone(),
                ok: m.window.ok,
                err: m.window.err,
                r429: m.window.r429,
                latency_p95: p95(&mut m.reservoir),
                tokens_remain: m.tokens_remain,
            };
            m.series.push_back(point);
            while m.series.len() > self.series_capacity {
                m.series.pop_front();
            }

            m.window = Counts::default();
            m.reservoir.clear();
            m.seen = 0;
        }
        cells.len()
    }

    pub fn current(&self) -> BTreeMap<String, MetricsCurrent> {
        self.quotas
            .iter()
            .map(|e| {
                let m = e.value().lock();
                (
                    e.key().clone(),
                    MetricsCurrent {
                        ok: m.cumulative.ok,
                        err: m.cumulative.err,
                        r429: m.cumulative.r429,
                        tokens_remain: m.tokens_remain,
                    },
                )
            })
            .collect()
    }

    /// The last `limit` points, oldest first. Without a quota id the points of
    /// all quotas are merged by timestamp.
    pub fn series(&self, quota_id: Option<&str>, limit: usize) -> Vec<MetricSeriesPoint> {
        let mut points: Vec<MetricSeriesPoint> = match quota_id {
            Some(id) => match self.quotas.get(id) {
                Some(cell) => cell.value().lock().series.iter().cloned().collect(),
                None => Vec::new(),
            },
            None => {
                let mut all: Vec<MetricSeriesPoint> = self
                    .quotas
                    .iter()
                    .flat_map(|e| e.value().lock().series.iter().cloned().collect::<Vec<_>>())
                    .collect();
                all.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.quota_id.cmp(&b.quota_id)));
                all
            }
        };

        let skip = points.len().saturating_sub(limit);
        points.drain(..skip);
        points
    }

    /// Sum of the series points of `quota_id` stamped at or after `since`.
    pub fn totals_since(&self, quota_id: &str, since: DateTime<Utc>) -> Counts {
        let Some(cell) = self.quotas.get(quota_id) else {
            return Counts::default();
        };
        let m = cell.value().lock();
        m.series
            .iter()
            .filter(|p| p.ts >= since)
            .fold(Counts::default(), |acc, p| Counts {
                ok: acc.ok + p.ok,
                err: acc.err + p.err,
                r429: acc.r429 + p.r429,
            })
    }

    /// Drop series points older than `cutoff`. Returns how many went.
    pub fn prune_series_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for entry in self.quotas.iter() {
            let mut m = entry.value().lock();
            let before = m.series.len();
            m.series.retain(|p| p.ts >= cutoff);
            pruned += before - m.series.len();
        }
        pruned
    }

    /// Zero the cumulative counters. Series history is kept.
    pub fn reset(&self) {
        for entry in self.quotas.iter() {
            entry.value().lock().cumulative = Counts::default();
        }
    }
}

/// Nearest-rank 95th percentile.
fn p95(samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = (0.95 * samples.len() as f64).ceil() as usize;
    samples.get(rank.saturating_sub(1)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn aggregator(series_capacity: usize, reservoir_size: usize) -> MetricsAggregator {
        MetricsAggregator::new(&MetricsConfig {
            window: std::time::Duration::from_secs(60),
            series_capacity,
            reservoir_size,
        })
    }

    #[test]
    fn current_is_cumulative_across_rolls() {
        let agg = aggregator(10, 16);
        agg.track("q");
        agg.observe("q", Outcome::Ok, Some(5.0));
        agg.observe("q", Outcome::R429, None);
        agg.roll(Utc::now(), |_| Some(3.0));
        agg.observe("q", Outcome::Err, None);

        let current = agg.current();
        let q = &current["q"];
        assert_eq!((q.ok, q.err, q.r429), (1, 1, 1));
        assert_eq!(q.tokens_remain, Some(3.0));

        agg.reset();
        assert_eq!(agg.current()["q"].ok, 0);
    }

    #[test]
    fn series_points_hold_window_deltas() {
        let agg = aggregator(10, 16);
        let t0 = Utc::now();
        agg.track("idle");
        agg.track("q");
        agg.observe("q", Outcome::Ok, None);
        agg.observe("q", Outcome::Ok, None);
        agg.roll(t0, |_| None);
        agg.observe("q", Outcome::Err, None);
        agg.roll(t0 + Duration::seconds(60), |_| None);

        let series = agg.series(Some("q"), 10);
        assert_eq!(series.len(), 2);
        assert_eq!((series[0].ok, series[0].err), (2, 0));
        assert_eq!((series[1].ok, series[1].err), (0, 1));

        assert_eq!(agg.series(Some("idle"), 10).len(), 2);
        assert_eq!(agg.series(None, 3).len(), 3);
        assert!(agg.series(Some("missing"), 10).is_empty());
    }

    #[test]
    fn series_is_bounded_and_returns_latest() {
        let agg = aggregator(3, 16);
        agg.track("q");
        let t0 = Utc::now();
        for i in 0..5 {
            agg.observe("q", Outcome::Ok, None);
            agg.roll(t0 + Duration::seconds(i), |_| None);
        }

        let series = agg.series(Some("q"), 2);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].ts, t0 + Duration::seconds(3));
        assert_eq!(series[1].ts, t0 + Duration::seconds(4));
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let agg = aggregator(10, 1000);
        agg.track("q");
        for latency in 1..=100 {
            agg.observe("q", Outcome::Ok, Some(f64::from(latency)));
        }
        agg.roll(Utc::now(), |_| None);
        assert_eq!(agg.series(Some("q"), 1)[0].latency_p95, Some(95.0));
    }

    #[test]
    fn reservoir_never_exceeds_its_size() {
        let agg = aggregator(10, 8);
        agg.track("q");
        for latency in 0..1000 {
            agg.observe("q", Outcome::Ok, Some(f64::from(latency)));
        }
        let cell = agg.cell("q").unwrap();
        assert_eq!(cell.lock().reservoir.len(), 8);
        assert_eq!(cell.lock().seen, 1000);
    }

    #[test]
    fn totals_and_pruning_by_timestamp() {
        let agg = aggregator(10, 16);
        agg.track("q");
        let t0 = Utc::now();
        agg.observe("q", Outcome::Err, None);
        agg.roll(t0 - Duration::days(8), |_| None);
        agg.observe("q", Outcome::R429, None);
        agg.roll(t0, |_| None);

        let recent = agg.totals_since("q", t0 - Duration::minutes(3));
        assert_eq!((recent.err, recent.r429), (0, 1));

        assert_eq!(agg.prune_series_before(t0 - Duration::days(7)), 1);
        assert_eq!(agg.series(Some("q"), 10).len(), 1);
    }

    #[test]
    fn forgotten_ids_stay_gone() {
        let agg = aggregator(10, 16);
        agg.track("q");
        agg.observe("q", Outcome::Ok, None);
        agg.forget("q");

        agg.observe("q", Outcome::Ok, Some(3.0));
        agg.set_tokens("q", 4.0);
        agg.observe("never", Outcome::Err, None);

        assert!(agg.current().is_empty());
        assert_eq!(agg.roll(Utc::now(), |_| Some(1.0)), 0);
        assert!(agg.series(None, 10).is_empty());
    }
}
