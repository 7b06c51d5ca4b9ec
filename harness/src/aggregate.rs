//! Thread-safe accumulation of session outcomes
//!
//! Every aggregator keeps plain counters plus two HDR histograms (connect
//! latency and session duration) behind one mutex, so a snapshot is never torn.
//! Recording also feeds the `metrics` facade for live export.

use crate::session::{EndReason, SessionOutcome};
use hdrhistogram::Histogram;
use metrics::{counter, histogram};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Largest trackable latency: one hour in microseconds
const MAX_TRACKABLE_MICROS: u64 = 3_600_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Sessions reported, whatever their end
    pub sessions: u64,
    /// Connect attempts that count against the target
    pub attempted: u64,
    pub connect_succeeded: u64,
    pub connect_failed: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    /// Arrivals dropped because the pool ceiling was reached
    pub dropped: u64,
    pub malformed_rejected: u64,
    pub closed_by_peer: u64,
    /// Cancelled before the connect attempt finished
    pub interrupted: u64,
    /// Force-terminated before finishing their flow
    pub aborted: u64,
}

impl Counters {
    /// Share of connect attempts that succeeded; `None` before any attempt.
    ///
    /// Dropped arrivals never reach the denominator.
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempted > 0).then(|| self.connect_succeeded as f64 / self.attempted as f64)
    }
}

/// Immutable distribution copy
#[derive(Debug, Clone)]
pub struct Trend {
    histogram: Histogram<u64>,
}

impl Trend {
    fn new() -> Self {
        // Bounds are constants well inside hdrhistogram's limits
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_MICROS, SIGNIFICANT_FIGURES)
            .expect("constant histogram bounds are valid");
        Self { histogram }
    }

    fn record(&mut self, value: Duration) {
        self.histogram.saturating_record(value.as_micros() as u64);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Value at percentile `p` (0-100) in milliseconds
    pub fn percentile_ms(&self, p: f64) -> Option<f64> {
        (!self.is_empty())
            .then(|| micros_to_ms(self.histogram.value_at_quantile((p / 100.0).clamp(0.0, 1.0))))
    }

    pub fn mean_ms(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.histogram.mean() / 1000.0)
    }

    pub fn min_ms(&self) -> Option<f64> {
        (!self.is_empty()).then(|| micros_to_ms(self.histogram.min()))
    }

    pub fn max_ms(&self) -> Option<f64> {
        (!self.is_empty()).then(|| micros_to_ms(self.histogram.max()))
    }
}

impl Serialize for Trend {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Trend", 8)?;
        state.serialize_field("count", &self.count())?;
        state.serialize_field("min_ms", &self.min_ms())?;
        state.serialize_field("mean_ms", &self.mean_ms())?;
        state.serialize_field("p50_ms", &self.percentile_ms(50.0))?;
        state.serialize_field("p90_ms", &self.percentile_ms(90.0))?;
        state.serialize_field("p95_ms", &self.percentile_ms(95.0))?;
        state.serialize_field("p99_ms", &self.percentile_ms(99.0))?;
        state.serialize_field("max_ms", &self.max_ms())?;
        state.end()
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

/// Point-in-time copy of an aggregator
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: Counters,
    pub connect_latency: Trend,
    pub session_duration: Trend,
}

struct AggregateState {
    counters: Counters,
    connect_latency: Trend,
    session_duration: Trend,
}

/// Collects outcomes for one scenario or for the whole run
pub struct MetricsAggregator {
    /// Scenario label for exported series; `None` keeps the totals local
    export_label: Option<String>,
    state: Mutex<AggregateState>,
}

impl MetricsAggregator {
    /// Per-scenario aggregator, exported under `scenario=<label>`
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_export(Some(label.into()))
    }

    /// Run-wide totals. Each outcome is already exported by its scenario's
    /// aggregator, so this one only feeds snapshots.
    pub fn merged() -> Self {
        Self::with_export(None)
    }

    fn with_export(export_label: Option<String>) -> Self {
        Self {
            export_label,
            state: Mutex::new(AggregateState {
                counters: Counters::default(),
                connect_latency: Trend::new(),
                session_duration: Trend::new(),
            }),
        }
    }

    /// Fold one finished session into the totals
    pub fn record(&self, outcome: &SessionOutcome) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let counters = &mut state.counters;
            counters.sessions += 1;
            if outcome.attempted() {
                counters.attempted += 1;
                if outcome.connect_succeeded {
                    counters.connect_succeeded += 1;
                } else {
                    counters.connect_failed += 1;
                }
            }
            counters.sent += outcome.sent;
            counters.received += outcome.received;
            counters.errors += outcome.errors;
            counters.malformed_rejected += outcome.malformed_rejected;
            match outcome.end {
                EndReason::ClosedByPeer { .. } => counters.closed_by_peer += 1,
                EndReason::Interrupted => counters.interrupted += 1,
                EndReason::Aborted => counters.aborted += 1,
                _ => {}
            }

            if let Some(latency) = outcome.connect_latency {
                state.connect_latency.record(latency);
            }
            if outcome.connect_succeeded {
                state.session_duration.record(outcome.duration);
            }
        }

        let Some(scenario) = self.export_label.clone() else {
            return;
        };
        counter!("wssiege_sessions_total", "scenario" => scenario.clone()).increment(1);
        if outcome.attempted() && !outcome.connect_succeeded {
            counter!("wssiege_connect_failures_total", "scenario" => scenario.clone()).increment(1);
        }
        counter!("wssiege_messages_sent_total", "scenario" => scenario.clone()).increment(outcome.sent);
        counter!("wssiege_messages_received_total", "scenario" => scenario.clone())
            .increment(outcome.received);
        counter!("wssiege_session_errors_total", "scenario" => scenario.clone()).increment(outcome.errors);
        if let Some(latency) = outcome.connect_latency {
            histogram!("wssiege_connect_duration_seconds", "scenario" => scenario).record(latency);
        }
    }

    /// Count arrivals dropped at the pool ceiling
    pub fn record_dropped(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .dropped += count;
        if let Some(scenario) = &self.export_label {
            counter!("wssiege_dropped_arrivals_total", "scenario" => scenario.clone()).increment(count);
        }
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).counters
    }

    /// Immutable copy of the current totals and distributions
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            counters: state.counters,
            connect_latency: state.connect_latency.clone(),
            session_duration: state.session_duration.clone(),
        }
    }
}

/// Fans each outcome out to several aggregators (scenario + global)
#[derive(Clone, Default)]
pub struct MetricsFanout {
    sinks: Vec<Arc<MetricsAggregator>>,
}

impl MetricsFanout {
    pub fn new(sinks: Vec<Arc<MetricsAggregator>>) -> Self {
        Self { sinks }
    }

    pub fn record(&self, outcome: &SessionOutcome) {
        for sink in &self.sinks {
            sink.record(outcome);
        }
    }

    pub fn record_dropped(&self, count: u64) {
        for sink in &self.sinks {
            sink.record_dropped(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn connected(latency_ms: u64, sent: u64) -> SessionOutcome {
        SessionOutcome {
            connect_succeeded: true,
            connect_latency: Some(Duration::from_millis(latency_ms)),
            duration: Duration::from_secs(1),
            sent,
            received: sent,
            end: EndReason::Completed,
            ..Default::default()
        }
    }

    fn failed() -> SessionOutcome {
        SessionOutcome {
            end: EndReason::ConnectFailed,
            ..Default::default()
        }
    }

    #[test]
    fn test_failed_connects_add_no_traffic() {
        let aggregator = MetricsAggregator::new("test");
        aggregator.record(&failed());
        aggregator.record(&failed());

        let counters = aggregator.counters();
        assert_eq!(counters.attempted, 2);
        assert_eq!(counters.connect_failed, 2);
        assert_eq!(counters.connect_succeeded, 0);
        assert_eq!(counters.sent, 0);
        assert_eq!(counters.received, 0);
        assert_eq!(counters.errors, 0);
        assert!(aggregator.snapshot().connect_latency.is_empty());
    }

    #[test]
    fn test_dropped_arrivals_stay_out_of_success_rate() {
        let aggregator = MetricsAggregator::new("test");
        for _ in 0..4 {
            aggregator.record(&connected(10, 1));
        }
        aggregator.record_dropped(100);

        let counters = aggregator.counters();
        assert_eq!(counters.dropped, 100);
        assert_eq!(counters.attempted, 4);
        assert_eq!(counters.success_rate(), Some(1.0));
    }

    #[test]
    fn test_interrupted_sessions_are_not_attempts() {
        let aggregator = MetricsAggregator::new("test");
        aggregator.record(&SessionOutcome {
            end: EndReason::Interrupted,
            ..Default::default()
        });
        let counters = aggregator.counters();
        assert_eq!(counters.sessions, 1);
        assert_eq!(counters.attempted, 0);
        assert_eq!(counters.interrupted, 1);
        assert_eq!(counters.success_rate(), None);
    }

    #[test]
    fn test_percentiles() {
        let aggregator = MetricsAggregator::new("test");
        for ms in 1..=100 {
            aggregator.record(&connected(ms, 0));
        }
        let snapshot = aggregator.snapshot();
        let p50 = snapshot.connect_latency.percentile_ms(50.0).unwrap();
        let p95 = snapshot.connect_latency.percentile_ms(95.0).unwrap();
        let p99 = snapshot.connect_latency.percentile_ms(99.0).unwrap();
        assert!((p50 - 50.0).abs() < 1.0, "p50 = {}", p50);
        assert!((p95 - 95.0).abs() < 1.0, "p95 = {}", p95);
        assert!((p99 - 99.0).abs() < 1.0, "p99 = {}", p99);
        assert_eq!(snapshot.connect_latency.count(), 100);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let aggregator = MetricsAggregator::new("test");
        aggregator.record(&connected(12, 3));
        aggregator.record(&failed());

        let first = aggregator.snapshot();
        let second = aggregator.snapshot();
        assert_eq!(first.counters, second.counters);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_are_not_lost() {
        let aggregator = Arc::new(MetricsAggregator::new("test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let aggregator = Arc::clone(&aggregator);
            handles.push(tokio::spawn(async move {
                for _ in 0..500 {
                    aggregator.record(&connected(5, 2));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let counters = aggregator.counters();
        assert_eq!(counters.sessions, 4000);
        assert_eq!(counters.connect_succeeded, 4000);
        assert_eq!(counters.sent, 8000);
        assert_eq!(aggregator.snapshot().connect_latency.count(), 4000);
    }

    #[test]
    fn test_fanout_records_everywhere() {
        let scenario = Arc::new(MetricsAggregator::new("scenario"));
        let global = Arc::new(MetricsAggregator::merged());
        let fanout = MetricsFanout::new(vec![Arc::clone(&scenario), Arc::clone(&global)]);
        fanout.record(&connected(1, 1));
        fanout.record_dropped(2);
        assert_eq!(scenario.counters(), global.counters());
        assert_eq!(global.counters().dropped, 2);
    }

    /// Keeps every registered counter, keyed by name and labels
    #[derive(Default)]
    struct CapturingRecorder {
        counters: Mutex<Vec<(String, Vec<(String, String)>, Arc<AtomicU64>)>>,
    }

    impl CapturingRecorder {
        fn total(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _, _)| n == name)
                .map(|(_, _, value)| value.load(Ordering::SeqCst))
                .sum()
        }

        fn label_values(&self, name: &str) -> Vec<String> {
            self.counters
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _, _)| n == name)
                .flat_map(|(_, labels, _)| labels.iter().map(|(_, v)| v.clone()))
                .collect()
        }
    }

    impl Recorder for CapturingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> metrics::Counter {
            let labels = key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect::<Vec<_>>();
            let mut counters = self.counters.lock().unwrap();
            let value = match counters.iter().find(|(n, l, _)| n == key.name() && *l == labels) {
                Some((_, _, value)) => Arc::clone(value),
                None => {
                    let value = Arc::new(AtomicU64::new(0));
                    counters.push((key.name().to_string(), labels, Arc::clone(&value)));
                    value
                }
            };
            metrics::Counter::from_arc(value)
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_fanout_exports_each_outcome_once() {
        let recorder = CapturingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            let scenario = Arc::new(MetricsAggregator::new("scenario"));
            let global = Arc::new(MetricsAggregator::merged());
            let fanout = MetricsFanout::new(vec![scenario, Arc::clone(&global)]);
            fanout.record(&connected(1, 3));
            fanout.record_dropped(2);
            assert_eq!(global.counters().sessions, 1);
        });

        assert_eq!(recorder.total("wssiege_sessions_total"), 1);
        assert_eq!(recorder.total("wssiege_messages_sent_total"), 3);
        assert_eq!(recorder.total("wssiege_dropped_arrivals_total"), 2);
        assert_eq!(recorder.label_values("wssiege_sessions_total"), vec!["scenario"]);
    }
}
