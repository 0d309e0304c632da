use crate::trace::Trace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Per-function call statistics derived from the trace log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuncStats {
    pub func_id: String,
    pub func_name: Option<String>,
    pub quota_id: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub limited_calls: u64,
    pub avg_latency_ms: Option<f64>,
    pub last_call_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Acc {
    func_name: Option<String>,
    total: u64,
    success: u64,
    failed: u64,
    limited: u64,
    latency_sum: f64,
    latency_count: u64,
    last_call_at: Option<DateTime<Utc>>,
}

/// Group traces that carry a `func_id` by (func_id, quota_id), most recently
/// called first. Traces without a function id are skipped.
pub fn func_stats<'a>(traces: impl IntoIterator<Item = &'a Trace>) -> Vec<FuncStats> {
    let mut groups: HashMap<(String, String), Acc> = HashMap::new();

    for trace in traces {
        let Some(func_id) = &trace.func_id else {
            continue;
        };
        let acc = groups
            .entry((func_id.clone(), trace.quota_id.clone()))
            .or_default();

        acc.total += 1;
        match trace.status_code {
            200 => acc.success += 1,
            429 => acc.limited += 1,
            code if code >= 500 => acc.failed += 1,
            _ => {}
        }
        if let Some(latency) = trace.latency_ms {
            acc.latency_sum += latency;
            acc.latency_count += 1;
        }
        if trace.func_name.is_some() {
            acc.func_name = trace.func_name.clone();
        }
        if acc.last_call_at.map_or(true, |last| trace.created_at > last) {
            acc.last_call_at = Some(trace.created_at);
        }
    }

    let mut stats: Vec<FuncStats> = groups
        .into_iter()
        .map(|((func_id, quota_id), acc)| FuncStats {
            func_id,
            func_name: acc.func_name,
            quota_id,
            total_calls: acc.total,
            success_calls: acc.success,
            failed_calls: acc.failed,
            limited_calls: acc.limited,
            avg_latency_ms: (acc.latency_count > 0)
                .then(|| acc.latency_sum / acc.latency_count as f64),
            last_call_at: acc.last_call_at,
        })
        .collect();

    stats.sort_by(|a, b| {
        b.last_call_at
            .cmp(&a.last_call_at)
            .then_with(|| a.func_id.cmp(&b.func_id))
    });
    stats
}
