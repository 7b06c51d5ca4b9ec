//! Pass/fail thresholds over aggregated metrics
//!
//! Thresholds are declared per metric, k6 style:
//!
//! ```text
//! "checks":                          ["rate>0.999"]
//! "ws_connecting":                   ["p(95)<200", "max<1000"]
//! "ws_errors{scenario:spam}":        [{"threshold": "count<10", "abort_on_fail": true}]
//! ```
//!
//! Trend values are in milliseconds. `checks` is the connect success rate;
//! arrivals dropped at the pool ceiling never enter it.

use crate::aggregate::MetricsSnapshot;
use crate::config::duration_str;
use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One threshold as written in the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdDecl {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        /// Grace period before a failure may abort the run
        #[serde(default, with = "duration_str::option")]
        delay_abort_eval: Option<Duration>,
    },
}

impl From<&str> for ThresholdDecl {
    fn from(expression: &str) -> Self {
        ThresholdDecl::Expr(expression.to_string())
    }
}

impl ThresholdDecl {
    pub fn expression(&self) -> &str {
        match self {
            ThresholdDecl::Expr(expression) => expression,
            ThresholdDecl::Detailed { threshold, .. } => threshold,
        }
    }
}

/// Metrics thresholds can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricName {
    /// Connect success rate
    Checks,
    /// Connect latency trend
    WsConnecting,
    /// Session duration trend
    WsSessionDuration,
    WsSessions,
    WsMsgsSent,
    WsMsgsReceived,
    WsErrors,
    WsDroppedSessions,
    WsMalformedRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Rate,
    Trend,
    Counter,
}

impl MetricName {
    fn parse(name: &str) -> Result<Self, ConfigError> {
        Ok(match name {
            "checks" => MetricName::Checks,
            "ws_connecting" => MetricName::WsConnecting,
            "ws_session_duration" => MetricName::WsSessionDuration,
            "ws_sessions" => MetricName::WsSessions,
            "ws_msgs_sent" => MetricName::WsMsgsSent,
            "ws_msgs_received" => MetricName::WsMsgsReceived,
            "ws_errors" => MetricName::WsErrors,
            "ws_dropped_sessions" => MetricName::WsDroppedSessions,
            "ws_malformed_rejected" => MetricName::WsMalformedRejected,
            other => return Err(ConfigError::UnknownMetric(other.to_string())),
        })
    }

    fn kind(&self) -> MetricKind {
        match self {
            MetricName::Checks => MetricKind::Rate,
            MetricName::WsConnecting | MetricName::WsSessionDuration => MetricKind::Trend,
            _ => MetricKind::Counter,
        }
    }
}

/// How a metric is reduced to one number
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    fn parse(text: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidThreshold(expression.to_string());
        Ok(match text {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let inner = text
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(invalid)?;
                let p: f64 = inner.parse().map_err(|_| invalid())?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(invalid());
                }
                Aggregation::Percentile(p)
            }
        })
    }

    fn supported_by(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Rate => matches!(self, Aggregation::Rate),
            MetricKind::Counter => matches!(self, Aggregation::Rate | Aggregation::Count),
            MetricKind::Trend => !matches!(self, Aggregation::Rate),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Longer operators first so `<=` is not read as `<`
    const OPERATORS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// A parsed threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    /// Declaration key, e.g. `ws_connecting{scenario:spike}`
    pub name: String,
    pub expression: String,
    pub metric: MetricName,
    /// Restricts evaluation to one scenario's metrics
    pub scenario: Option<String>,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    pub fn parse(key: &str, decl: &ThresholdDecl) -> Result<Self, ConfigError> {
        let (metric, scenario) = parse_key(key)?;
        let expression = decl.expression().trim();
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let invalid = || ConfigError::InvalidThreshold(expression.to_string());

        let (position, operator, comparison) = compact
            .char_indices()
            .find_map(|(i, _)| {
                Comparison::OPERATORS
                    .iter()
                    .find(|(op, _)| compact[i..].starts_with(op))
                    .map(|(op, cmp)| (i, *op, *cmp))
            })
            .ok_or_else(invalid)?;

        let aggregation = Aggregation::parse(&compact[..position], expression)?;
        let bound: f64 = compact[position + operator.len()..]
            .parse()
            .map_err(|_| invalid())?;
        if !aggregation.supported_by(metric.kind()) {
            return Err(ConfigError::UnsupportedAggregation {
                metric: key.to_string(),
                aggregation: aggregation.to_string(),
            });
        }

        let (abort_on_fail, delay_abort_eval) = match decl {
            ThresholdDecl::Expr(_) => (false, Duration::ZERO),
            ThresholdDecl::Detailed {
                abort_on_fail,
                delay_abort_eval,
                ..
            } => (*abort_on_fail, delay_abort_eval.unwrap_or_default()),
        };

        Ok(Self {
            name: key.to_string(),
            expression: expression.to_string(),
            metric,
            scenario,
            aggregation,
            comparison,
            bound,
            abort_on_fail,
            delay_abort_eval,
        })
    }

    /// Reduce the snapshot to the value the predicate is checked against.
    /// `None` when the metric has no data yet.
    pub fn observe(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> Option<f64> {
        let counters = &snapshot.counters;
        match self.metric.kind() {
            MetricKind::Rate => counters.success_rate(),
            MetricKind::Trend => {
                let trend = match self.metric {
                    MetricName::WsConnecting => &snapshot.connect_latency,
                    _ => &snapshot.session_duration,
                };
                match self.aggregation {
                    Aggregation::Count => Some(trend.count() as f64),
                    Aggregation::Avg => trend.mean_ms(),
                    Aggregation::Min => trend.min_ms(),
                    Aggregation::Max => trend.max_ms(),
                    Aggregation::Med => trend.percentile_ms(50.0),
                    Aggregation::Percentile(p) => trend.percentile_ms(p),
                    Aggregation::Rate => None,
                }
            }
            MetricKind::Counter => {
                let value = match self.metric {
                    MetricName::WsSessions => counters.sessions,
                    MetricName::WsMsgsSent => counters.sent,
                    MetricName::WsMsgsReceived => counters.received,
                    MetricName::WsErrors => counters.errors,
                    MetricName::WsDroppedSessions => counters.dropped,
                    _ => counters.malformed_rejected,
                } as f64;
                match self.aggregation {
                    Aggregation::Rate => {
                        (!elapsed.is_zero()).then(|| value / elapsed.as_secs_f64())
                    }
                    _ => Some(value),
                }
            }
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> ThresholdResult {
        let observed = self.observe(snapshot, elapsed);
        ThresholdResult {
            name: self.name.clone(),
            expression: self.expression.clone(),
            observed,
            // Nothing observed yet: nothing to violate
            passed: observed.is_none_or(|value| self.comparison.holds(value, self.bound)),
        }
    }
}

/// Split `metric{scenario:name}` into its parts
fn parse_key(key: &str) -> Result<(MetricName, Option<String>), ConfigError> {
    let key = key.trim();
    let Some((metric, tags)) = key.split_once('{') else {
        return Ok((MetricName::parse(key)?, None));
    };
    let tags = tags
        .strip_suffix('}')
        .ok_or_else(|| ConfigError::InvalidThreshold(key.to_string()))?;
    let scenario = match tags.split_once(':') {
        Some((tag, value)) if tag.trim() == "scenario" && !value.trim().is_empty() => {
            value.trim().to_string()
        }
        _ => return Err(ConfigError::InvalidThreshold(key.to_string())),
    };
    Ok((MetricName::parse(metric.trim())?, Some(scenario)))
}

/// Verdict for one threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub name: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Snapshots a threshold pass reads from
#[derive(Debug, Clone)]
pub struct SnapshotSet {
    pub global: MetricsSnapshot,
    pub scenarios: IndexMap<String, MetricsSnapshot>,
    /// Time since the run started, for counter rates
    pub elapsed: Duration,
}

/// Parsed thresholds of a run
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    specs: Vec<ThresholdSpec>,
}

impl ThresholdEvaluator {
    pub fn from_decls(decls: &IndexMap<String, Vec<ThresholdDecl>>) -> Result<Self, ConfigError> {
        let specs = decls
            .iter()
            .flat_map(|(key, list)| list.iter().map(move |decl| ThresholdSpec::parse(key, decl)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Every scenario a threshold is scoped to must exist
    pub fn check_scopes(&self, scenarios: &[&str]) -> Result<(), ConfigError> {
        for spec in &self.specs {
            if let Some(scope) = &spec.scenario
                && !scenarios.contains(&scope.as_str())
            {
                return Err(ConfigError::UnknownScenario(scope.clone()));
            }
        }
        Ok(())
    }

    /// Evaluate every threshold; read-only
    pub fn evaluate(&self, snapshots: &SnapshotSet) -> Vec<ThresholdResult> {
        self.specs
            .iter()
            .map(|spec| self.evaluate_one(spec, snapshots))
            .collect()
    }

    fn evaluate_one(&self, spec: &ThresholdSpec, snapshots: &SnapshotSet) -> ThresholdResult {
        let snapshot = match &spec.scenario {
            Some(name) => snapshots.scenarios.get(name),
            None => Some(&snapshots.global),
        };
        match snapshot {
            Some(snapshot) => spec.evaluate(snapshot, snapshots.elapsed),
            // The scoped scenario never ran, so it cannot meet its objective
            None => ThresholdResult {
                name: spec.name.clone(),
                expression: spec.expression.clone(),
                observed: None,
                passed: false,
            },
        }
    }

    /// First failing threshold allowed to abort the run at this point.
    /// Only observed values can abort; a scenario that never ran cannot.
    pub fn abort_trigger<'a>(
        &'a self,
        results: &[ThresholdResult],
        elapsed: Duration,
    ) -> Option<&'a ThresholdSpec> {
        self.specs
            .iter()
            .zip(results)
            .find(|(spec, result)| {
                spec.abort_on_fail
                    && !result.passed
                    && result.observed.is_some()
                    && elapsed >= spec.delay_abort_eval
            })
            .map(|(spec, _)| spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MetricsAggregator;
    use crate::session::{EndReason, SessionOutcome};

    fn spec(key: &str, expression: &str) -> ThresholdSpec {
        ThresholdSpec::parse(key, &ThresholdDecl::from(expression)).unwrap()
    }

    fn outcome(connected: bool, latency_ms: u64) -> SessionOutcome {
        SessionOutcome {
            connect_succeeded: connected,
            connect_latency: connected.then(|| Duration::from_millis(latency_ms)),
            end: if connected {
                EndReason::Completed
            } else {
                EndReason::ConnectFailed
            },
            sent: connected as u64,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_expressions() {
        let rate = spec("checks", "rate>0.999");
        assert_eq!(rate.metric, MetricName::Checks);
        assert_eq!(rate.aggregation, Aggregation::Rate);
        assert_eq!(rate.comparison, Comparison::Gt);
        assert_eq!(rate.bound, 0.999);

        let p95 = spec("ws_connecting", "p(95) <= 200");
        assert_eq!(p95.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(p95.comparison, Comparison::Le);

        let scoped = spec("ws_errors{scenario:spam}", "count==0");
        assert_eq!(scoped.scenario.as_deref(), Some("spam"));
        assert_eq!(scoped.comparison, Comparison::Eq);
    }

    #[test]
    fn test_parse_errors() {
        let parse = |key: &str, expr: &str| ThresholdSpec::parse(key, &ThresholdDecl::from(expr));
        assert!(matches!(parse("nope", "rate>1"), Err(ConfigError::UnknownMetric(_))));
        assert!(matches!(parse("checks", "rate"), Err(ConfigError::InvalidThreshold(_))));
        assert!(matches!(parse("checks", "rate>abc"), Err(ConfigError::InvalidThreshold(_))));
        assert!(matches!(parse("ws_connecting", "p(150)<1"), Err(ConfigError::InvalidThreshold(_))));
        assert!(matches!(
            parse("checks", "p(95)<1"),
            Err(ConfigError::UnsupportedAggregation { .. })
        ));
        assert!(matches!(
            parse("ws_errors{name:x}", "count<1"),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_detailed_declaration() {
        let decl: ThresholdDecl =
            serde_json::from_str(r#"{"threshold": "rate>0.9", "abort_on_fail": true, "delay_abort_eval": "10s"}"#)
                .unwrap();
        let parsed = ThresholdSpec::parse("checks", &decl).unwrap();
        assert!(parsed.abort_on_fail);
        assert_eq!(parsed.delay_abort_eval, Duration::from_secs(10));
    }

    #[test]
    fn test_checks_rate() {
        let aggregator = MetricsAggregator::merged();
        for i in 0..100 {
            aggregator.record(&outcome(i % 2 == 0, 10));
        }
        aggregator.record_dropped(1000);
        let snapshot = aggregator.snapshot();

        let result = spec("checks", "rate>0.999").evaluate(&snapshot, Duration::from_secs(1));
        assert_eq!(result.observed, Some(0.5));
        assert!(!result.passed);

        let result = spec("checks", "rate>0.4").evaluate(&snapshot, Duration::from_secs(1));
        assert!(result.passed);
    }

    #[test]
    fn test_trend_and_counter_aggregations() {
        let aggregator = MetricsAggregator::merged();
        for ms in 1..=100 {
            aggregator.record(&outcome(true, ms));
        }
        let snapshot = aggregator.snapshot();
        let elapsed = Duration::from_secs(10);

        assert!(spec("ws_connecting", "p(95)<200").evaluate(&snapshot, elapsed).passed);
        assert!(!spec("ws_connecting", "max<50").evaluate(&snapshot, elapsed).passed);
        assert!(spec("ws_connecting", "count==100").evaluate(&snapshot, elapsed).passed);

        let rate = spec("ws_msgs_sent", "rate>5").evaluate(&snapshot, elapsed);
        assert_eq!(rate.observed, Some(10.0));
        assert!(rate.passed);
    }

    #[test]
    fn test_no_data_passes() {
        let snapshot = MetricsAggregator::new("empty").snapshot();
        let result = spec("ws_connecting", "p(95)<200").evaluate(&snapshot, Duration::ZERO);
        assert_eq!(result.observed, None);
        assert!(result.passed);
    }

    #[test]
    fn test_scoped_thresholds_use_scenario_snapshot() {
        let good = MetricsAggregator::new("good");
        let bad = MetricsAggregator::new("bad");
        let global = MetricsAggregator::merged();
        for _ in 0..10 {
            good.record(&outcome(true, 5));
            bad.record(&outcome(false, 0));
            global.record(&outcome(true, 5));
            global.record(&outcome(false, 0));
        }

        let mut decls = IndexMap::new();
        decls.insert("checks{scenario:good}".to_string(), vec![ThresholdDecl::from("rate>0.99")]);
        decls.insert("checks{scenario:bad}".to_string(), vec![ThresholdDecl::from("rate>0.99")]);
        decls.insert("checks".to_string(), vec![ThresholdDecl::from("rate>0.99")]);
        let evaluator = ThresholdEvaluator::from_decls(&decls).unwrap();

        let mut scenarios = IndexMap::new();
        scenarios.insert("good".to_string(), good.snapshot());
        scenarios.insert("bad".to_string(), bad.snapshot());
        let snapshots = SnapshotSet {
            global: global.snapshot(),
            scenarios,
            elapsed: Duration::from_secs(1),
        };

        let passed: Vec<bool> = evaluator.evaluate(&snapshots).iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, false]);

        // A scoped scenario missing from the snapshots never ran
        let mut missing = snapshots.clone();
        missing.scenarios.shift_remove("bad");
        let results = evaluator.evaluate(&missing);
        assert_eq!(results[1].observed, None);
        assert!(!results[1].passed);

        assert!(evaluator.check_scopes(&["good", "bad"]).is_ok());
        assert!(matches!(
            evaluator.check_scopes(&["good"]),
            Err(ConfigError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_abort_trigger_respects_delay() {
        let mut decls = IndexMap::new();
        decls.insert(
            "checks".to_string(),
            vec![ThresholdDecl::Detailed {
                threshold: "rate>0.99".to_string(),
                abort_on_fail: true,
                delay_abort_eval: Some(Duration::from_secs(5)),
            }],
        );
        let evaluator = ThresholdEvaluator::from_decls(&decls).unwrap();
        let failing = vec![ThresholdResult {
            name: "checks".to_string(),
            expression: "rate>0.99".to_string(),
            observed: Some(0.5),
            passed: false,
        }];

        assert!(evaluator.abort_trigger(&failing, Duration::from_secs(1)).is_none());
        assert!(evaluator.abort_trigger(&failing, Duration::from_secs(6)).is_some());

        let never_ran = vec![ThresholdResult {
            observed: None,
            ..failing[0].clone()
        }];
        assert!(evaluator.abort_trigger(&never_ran, Duration::from_secs(6)).is_none());
    }
}
