//! Progress streaming: per-backtest sessions with best-effort broadcast
//! fan-out and an optional delta mode that only transmits changed fields.
//!
//! The simulator pushes one snapshot per processed day; a slow consumer
//! never back-pressures the loop (the broadcast channel drops intermediate
//! events for laggards). The terminal `completed`/`error` event is always
//! the last thing emitted for a session. Delta state lives here, per
//! session, never inside the simulator.

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use super::types::{Statistics, Trade};

const CHANNEL_CAPACITY: usize = 256;
pub const TOTAL_PREPARATION_STAGES: u32 = 4;

/// The four load/compute phases reported before day-by-day progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreparationStage {
    LoadingPriceData,
    LoadingFinancialData,
    CalculatingFactors,
    PreparingSimulation,
}

impl PreparationStage {
    pub fn number(self) -> u32 {
        match self {
            PreparationStage::LoadingPriceData => 1,
            PreparationStage::LoadingFinancialData => 2,
            PreparationStage::CalculatingFactors => 3,
            PreparationStage::PreparingSimulation => 4,
        }
    }
}

/// A full per-day progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub date: String,
    pub portfolio_value: f64,
    pub cash: f64,
    pub position_value: f64,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub progress_percent: u32,
    pub current_mdd: f64,
    pub buy_count: u32,
    pub sell_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Preparation {
        stage: PreparationStage,
        stage_number: u32,
        total_stages: u32,
        message: String,
    },
    Progress(ProgressState),
    Delta {
        date: String,
        changes: serde_json::Map<String, serde_json::Value>,
    },
    Trade {
        trade: Trade,
    },
    Completed {
        statistics: Statistics,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Preparation { .. } => "preparation",
            ProgressEvent::Progress(_) => "progress",
            ProgressEvent::Delta { .. } => "delta",
            ProgressEvent::Trade { .. } => "trade",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Error { .. } => "error",
        }
    }

    /// Server-Sent Events framing: one message, JSON body.
    pub fn to_sse(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_name(), body)
    }
}

/// Registry of live sessions keyed by backtest id.
pub struct ProgressHub {
    sessions: DashMap<String, broadcast::Sender<ProgressEvent>>,
    last_state: Mutex<FxHashMap<String, ProgressState>>,
    delta_mode: bool,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ProgressHub {
    pub fn new(delta_mode: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            last_state: Mutex::new(FxHashMap::default()),
            delta_mode,
        }
    }

    /// Register a consumer; creates the session when absent.
    pub fn subscribe(&self, backtest_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sessions
            .entry(backtest_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the session and its delta state.
    pub fn unregister(&self, backtest_id: &str) {
        self.sessions.remove(backtest_id);
        self.last_state.lock().remove(backtest_id);
    }

    /// Forget the last snapshot so the next emission is sent in full.
    pub fn reset_delta_state(&self, backtest_id: &str) {
        self.last_state.lock().remove(backtest_id);
    }

    fn send(&self, backtest_id: &str, event: ProgressEvent) {
        if let Some(sender) = self.sessions.get(backtest_id) {
            // A send error just means nobody is listening right now.
            let _ = sender.send(event);
        }
    }

    pub fn emit_preparation(&self, backtest_id: &str, stage: PreparationStage, message: &str) {
        self.send(
            backtest_id,
            ProgressEvent::Preparation {
                stage,
                stage_number: stage.number(),
                total_stages: TOTAL_PREPARATION_STAGES,
                message: message.to_string(),
            },
        );
    }

    /// Emit a per-day snapshot, reduced to a delta when enabled and a prior
    /// snapshot exists. The first snapshot is always sent in full; an
    /// all-equal snapshot is coalesced away entirely.
    pub fn emit_progress(&self, backtest_id: &str, state: ProgressState) {
        let event = {
            let mut last = self.last_state.lock();
            let event = match last.get(backtest_id) {
                Some(prev) if self.delta_mode => match delta_changes(prev, &state) {
                    Some(changes) => Some(ProgressEvent::Delta {
                        date: state.date.clone(),
                        changes,
                    }),
                    None => None,
                },
                _ => Some(ProgressEvent::Progress(state.clone())),
            };
            last.insert(backtest_id.to_string(), state);
            event
        };
        if let Some(event) = event {
            self.send(backtest_id, event);
        }
    }

    pub fn emit_trade(&self, backtest_id: &str, trade: Trade) {
        self.send(backtest_id, ProgressEvent::Trade { trade });
    }

    /// Terminal success event; always full, clears delta state.
    pub fn emit_completed(
        &self,
        backtest_id: &str,
        statistics: Statistics,
        summary: Option<String>,
    ) {
        self.last_state.lock().remove(backtest_id);
        self.send(
            backtest_id,
            ProgressEvent::Completed {
                statistics,
                summary,
            },
        );
    }

    /// Terminal failure event; clears delta state.
    pub fn emit_error(&self, backtest_id: &str, message: &str) {
        self.last_state.lock().remove(backtest_id);
        self.send(
            backtest_id,
            ProgressEvent::Error {
                message: message.to_string(),
            },
        );
    }
}

/// Changed fields vs the previous snapshot; `None` when nothing differs.
fn delta_changes(
    prev: &ProgressState,
    current: &ProgressState,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut changes = serde_json::Map::new();
    macro_rules! diff {
        ($field:ident) => {
            if prev.$field != current.$field {
                changes.insert(stringify!($field).to_string(), json!(current.$field));
            }
        };
    }
    diff!(portfolio_value);
    diff!(cash);
    diff!(position_value);
    diff!(daily_return);
    diff!(cumulative_return);
    diff!(progress_percent);
    diff!(current_mdd);
    diff!(buy_count);
    diff!(sell_count);

    if changes.is_empty() {
        None
    } else {
        Some(changes)
    }
}

/// SSE-framed line stream for one session, ready to hand to a response
/// body. Lagged consumers silently skip dropped snapshots; the terminal
/// event is always the last frame.
pub fn sse_stream(
    hub: &ProgressHub,
    backtest_id: &str,
) -> impl tokio_stream::Stream<Item = String> {
    use tokio_stream::StreamExt;
    tokio_stream::wrappers::BroadcastStream::new(hub.subscribe(backtest_id))
        .filter_map(|event| event.ok().map(|e| e.to_sse()))
}

/// Reapply a delta to the last full snapshot (consumer-side reconstruction;
/// also exercised by the stream-correctness tests).
pub fn apply_delta(
    base: &ProgressState,
    date: &str,
    changes: &serde_json::Map<String, serde_json::Value>,
) -> ProgressState {
    let mut next = base.clone();
    next.date = date.to_string();
    macro_rules! patch_f64 {
        ($field:ident) => {
            if let Some(v) = changes.get(stringify!($field)).and_then(|v| v.as_f64()) {
                next.$field = v;
            }
        };
    }
    patch_f64!(portfolio_value);
    patch_f64!(cash);
    patch_f64!(position_value);
    patch_f64!(daily_return);
    patch_f64!(cumulative_return);
    patch_f64!(current_mdd);
    if let Some(v) = changes.get("progress_percent").and_then(|v| v.as_u64()) {
        next.progress_percent = v as u32;
    }
    if let Some(v) = changes.get("buy_count").and_then(|v| v.as_u64()) {
        next.buy_count = v as u32;
    }
    if let Some(v) = changes.get("sell_count").and_then(|v| v.as_u64()) {
        next.sell_count = v as u32;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(date: &str, value: f64, percent: u32) -> ProgressState {
        ProgressState {
            date: date.to_string(),
            portfolio_value: value,
            cash: value,
            position_value: 0.0,
            daily_return: 0.0,
            cumulative_return: 0.0,
            progress_percent: percent,
            current_mdd: 0.0,
            buy_count: 0,
            sell_count: 0,
        }
    }

    #[tokio::test]
    async fn first_snapshot_full_then_deltas() {
        let hub = ProgressHub::new(true);
        let mut rx = hub.subscribe("bt1");

        hub.emit_progress("bt1", state("2024-01-02", 100.0, 10));
        let mut second = state("2024-01-03", 110.0, 20);
        second.buy_count = 1;
        hub.emit_progress("bt1", second);

        match rx.recv().await.unwrap() {
            ProgressEvent::Progress(s) => assert_eq!(s.progress_percent, 10),
            other => panic!("expected full snapshot, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ProgressEvent::Delta { date, changes } => {
                assert_eq!(date, "2024-01-03");
                assert_eq!(changes.len(), 4); // value, cash, percent, buys
                assert!(changes.contains_key("portfolio_value"));
                assert!(changes.contains_key("buy_count"));
                assert!(!changes.contains_key("sell_count"));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_snapshot_coalesced() {
        let hub = ProgressHub::new(true);
        let mut rx = hub.subscribe("bt1");

        hub.emit_progress("bt1", state("2024-01-02", 100.0, 10));
        // Identical fields (date excluded from comparison payload).
        hub.emit_progress("bt1", state("2024-01-03", 100.0, 10));
        hub.emit_completed("bt1", Statistics::default(), None);

        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Progress(_)));
        // Second snapshot produced no event; next is the terminal one.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ProgressEvent::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn delta_mode_off_sends_full_snapshots() {
        let hub = ProgressHub::new(false);
        let mut rx = hub.subscribe("bt1");
        hub.emit_progress("bt1", state("2024-01-02", 100.0, 10));
        hub.emit_progress("bt1", state("2024-01-03", 110.0, 20));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Progress(_)));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Progress(_)));
    }

    #[tokio::test]
    async fn reset_forces_full_snapshot() {
        let hub = ProgressHub::new(true);
        let mut rx = hub.subscribe("bt1");
        hub.emit_progress("bt1", state("2024-01-02", 100.0, 10));
        hub.reset_delta_state("bt1");
        hub.emit_progress("bt1", state("2024-01-03", 110.0, 20));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Progress(_)));
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Progress(_)));
    }

    #[tokio::test]
    async fn delta_reconstruction_matches_full_series() {
        let hub = ProgressHub::new(true);
        let mut rx = hub.subscribe("bt1");

        let series = vec![
            state("2024-01-02", 100.0, 10),
            state("2024-01-03", 110.0, 20),
            state("2024-01-04", 95.0, 30),
        ];
        for s in &series {
            hub.emit_progress("bt1", s.clone());
        }

        let mut reconstructed = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                ProgressEvent::Progress(s) => reconstructed.push(s),
                ProgressEvent::Delta { date, changes } => {
                    let base = reconstructed.last().unwrap();
                    reconstructed.push(apply_delta(base, &date, &changes));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(reconstructed, series);
    }

    #[tokio::test]
    async fn sse_stream_frames_events() {
        use tokio_stream::StreamExt;

        let hub = ProgressHub::new(false);
        let mut stream = Box::pin(sse_stream(&hub, "bt1"));
        hub.emit_progress("bt1", state("2024-01-02", 100.0, 50));
        hub.emit_completed("bt1", Statistics::default(), Some("done".into()));

        let first = stream.next().await.unwrap();
        assert!(first.starts_with("event: progress\n"));
        let second = stream.next().await.unwrap();
        assert!(second.starts_with("event: completed\n"));
        assert!(second.contains("\"summary\":\"done\""));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_harmless() {
        let hub = ProgressHub::new(true);
        hub.emit_progress("nobody", state("2024-01-02", 100.0, 10));
        hub.emit_error("nobody", "boom");
    }

    #[test]
    fn sse_framing() {
        let event = ProgressEvent::Error {
            message: "cancelled".into(),
        };
        let sse = event.to_sse();
        assert!(sse.starts_with("event: error\ndata: "));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains("\"type\":\"error\""));

        let event = ProgressEvent::Preparation {
            stage: PreparationStage::CalculatingFactors,
            stage_number: 3,
            total_stages: TOTAL_PREPARATION_STAGES,
            message: String::new(),
        };
        assert!(event.to_sse().contains("CALCULATING_FACTORS"));
    }
}
