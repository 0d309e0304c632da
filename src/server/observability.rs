use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::events::Event;
use crate::metrics::{MetricSeriesPoint, MetricsCurrent};
use crate::server::AppState;
use crate::trace::{func_stats as compute_func_stats, FuncStats, Trace, TraceFilter};

const DEFAULT_TRACE_LIMIT: usize = 50;
const DEFAULT_SERIES_LIMIT: usize = 100;
const TOKEN_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct MetricsCurrentEntry {
    pub quota_id: String,
    #[serde(flatten)]
    pub metrics: MetricsCurrent,
}

/// One entry per configured quota, zeros for quotas never observed.
pub async fn metrics_current(State(app): State<AppState>) -> Json<Vec<MetricsCurrentEntry>> {
    let mut current = app.aggregator.current();
    let entries = app
        .list_quotas()
        .into_iter()
        .map(|view| {
            let mut metrics = current.remove(&view.quota.id).unwrap_or(MetricsCurrent {
                ok: 0,
                err: 0,
                r429: 0,
                tokens_remain: None,
            });
            if metrics.tokens_remain.is_none() {
                metrics.tokens_remain = view.current_tokens;
            }
            MetricsCurrentEntry {
                quota_id: view.quota.id,
                metrics,
            }
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub quota_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub items: Vec<MetricSeriesPoint>,
}

pub async fn metrics_series(
    State(app): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> Json<SeriesResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_SERIES_LIMIT);
    Json(SeriesResponse {
        items: app.aggregator.series(query.quota_id.as_deref(), limit),
    })
}

#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    pub limit: Option<usize>,
    pub quota_id: Option<String>,
    pub func_id: Option<String>,
    pub status_code: Option<u16>,
}

pub async fn list_traces(
    State(app): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Json<Vec<Trace>> {
    app.recorder.flush().await;
    let limit = query.limit.unwrap_or(DEFAULT_TRACE_LIMIT);
    let filter = TraceFilter {
        quota_id: query.quota_id,
        func_id: query.func_id,
        status_code: query.status_code,
    };
    Json(app.recorder.query(limit, &filter))
}

#[derive(Debug, Serialize)]
pub struct DeleteTracesResponse {
    pub message: String,
    pub deleted_count: usize,
}

pub async fn delete_all_traces(State(app): State<AppState>) -> Json<DeleteTracesResponse> {
    let deleted_count = app.recorder.delete_all().await;
    Json(DeleteTracesResponse {
        message: format!("Deleted {} traces", deleted_count),
        deleted_count,
    })
}

pub async fn delete_old_traces(State(app): State<AppState>) -> Json<DeleteTracesResponse> {
    let deleted_count = app.recorder.delete_older_than_today().await;
    Json(DeleteTracesResponse {
        message: format!("Deleted {} traces from before today", deleted_count),
        deleted_count,
    })
}

pub async fn func_stats(State(app): State<AppState>) -> Json<Vec<FuncStats>> {
    app.recorder.flush().await;
    let traces = app.recorder.snapshot();
    Json(compute_func_stats(&traces))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Accepted for dashboard compatibility; identity is checked upstream.
    pub token: Option<String>,
}

/// Live `trace` and `tokens` events, plus a periodic snapshot of every
/// enabled quota's level.
pub async fn event_stream(
    State(app): State<AppState>,
    Query(_query): Query<StreamQuery>,
) -> Sse<KeepAliveStream<ReceiverStream<Result<SseEvent, Infallible>>>> {
    info!(subscribers = app.events.subscriber_count() + 1, "Event stream opened");

    let (tx, rx) = mpsc::channel(app.config.events.buffer.max(1));
    tokio::spawn(forward_events(app, tx));

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

/// Pump events into one client's channel until it disconnects.
async fn forward_events(app: AppState, tx: mpsc::Sender<Result<SseEvent, Infallible>>) {
    let live = app.events.subscribe();
    tokio::pin!(live);
    let mut snapshots = tokio::time::interval(TOKEN_SNAPSHOT_INTERVAL);

    loop {
        let batch: Vec<Event> = tokio::select! {
            event = live.next() => match event {
                Some(event) => vec![event],
                None => break,
            },
            _ = snapshots.tick() => app.token_levels().into_iter().map(Event::Tokens).collect(),
            _ = tx.closed() => break,
        };

        for event in batch {
            let sse = match SseEvent::default().json_data(&event) {
                Ok(sse) => sse,
                Err(e) => {
                    warn!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if tx.send(Ok(sse)).await.is_err() {
                info!("Event stream closed");
                return;
            }
        }
    }
    info!("Event stream closed");
}
