//! Harness configuration
//!
//! Runtime settings come from environment variables. The traffic itself is
//! described by a [`RunPlan`], read from a JSON file or taken from a preset.

use crate::arrival::{ScenarioMode, Stage};
use crate::error::ConfigError;
use crate::session::{Flow, FlowOverrides};
use crate::threshold::ThresholdDecl;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default pool ceiling for open-loop scenarios without `pool_limit`
pub const DEFAULT_OPEN_LOOP_POOL: usize = 100;

/// Longest span a scenario, or one of its sessions, may be configured for
pub const MAX_SCENARIO_SPAN: Duration = Duration::from_secs(30 * 24 * 3600);

/// Main harness configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub target: TargetConfig,
    pub timing: TimingConfig,
    pub dry_run: DryRunConfig,
    /// JSON run plan; the preset is used when absent
    pub plan_path: Option<PathBuf>,
    pub preset: Preset,
    /// Where to write the JSON run report
    pub report_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address while running
    pub metrics_addr: Option<SocketAddr>,
}

/// Target endpoint configuration
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub url: String,
    /// Bearer token sent with every handshake
    pub auth_token: Option<String>,
    /// Also pass the token as `token` query parameter
    pub token_in_query: bool,
}

/// Timers used by sessions, scenarios and the orchestrator
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    /// How long a finished scenario waits for in-flight sessions
    pub graceful_stop: Duration,
    /// How long force-closed sessions get before being terminated
    pub force_close: Duration,
    /// Arrival controller cadence
    pub tick: Duration,
    /// Progress log and live threshold cadence
    pub progress_interval: Duration,
}

/// In-process stub target
#[derive(Debug, Clone, Default)]
pub struct DryRunConfig {
    pub enabled: bool,
    /// Share of connect attempts the stub fails
    pub failure_rate: f64,
}

/// Built-in run plans
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preset {
    /// Always-on, intermittent and reconnect-storm devices
    #[default]
    Soak,
    /// Message flood, connection burst and malformed input attacks
    Abuse,
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "soak" => Ok(Preset::Soak),
            "abuse" => Ok(Preset::Abuse),
            other => Err(format!("unknown preset '{}'", other)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            timing: TimingConfig::default(),
            dry_run: DryRunConfig::default(),
            plan_path: None,
            preset: Preset::default(),
            report_path: None,
            metrics_addr: None,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/v1/ws".to_string(),
            auth_token: None,
            token_in_query: false,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            graceful_stop: Duration::from_secs(30),
            force_close: Duration::from_secs(5),
            tick: Duration::from_millis(50),
            progress_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Target
        if let Ok(url) = env::var("SIEGE_TARGET_URL")
            && !url.is_empty()
        {
            config.target.url = url;
        }
        if let Ok(token) = env::var("SIEGE_AUTH_TOKEN")
            && !token.is_empty()
        {
            config.target.auth_token = Some(token);
        }
        if let Ok(val) = env::var("SIEGE_TOKEN_IN_QUERY") {
            config.target.token_in_query = is_truthy(&val);
        }

        // Plan
        if let Ok(path) = env::var("SIEGE_PLAN")
            && !path.is_empty()
        {
            config.plan_path = Some(PathBuf::from(path));
        }
        if let Some(preset) = parse_var("SIEGE_PRESET") {
            config.preset = preset;
        }

        // Dry run
        if let Ok(val) = env::var("SIEGE_DRY_RUN") {
            config.dry_run.enabled = is_truthy(&val);
        }
        if let Some(rate) = parse_var::<f64>("SIEGE_DRY_RUN_FAILURE_RATE") {
            config.dry_run.failure_rate = rate.clamp(0.0, 1.0);
        }

        // Timing
        if let Some(secs) = parse_var::<u64>("SIEGE_CONNECT_TIMEOUT_SECS") {
            config.timing.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("SIEGE_GRACEFUL_STOP_SECS") {
            config.timing.graceful_stop = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("SIEGE_FORCE_CLOSE_SECS") {
            config.timing.force_close = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>("SIEGE_TICK_MS")
            && ms > 0
        {
            config.timing.tick = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("SIEGE_PROGRESS_SECS")
            && secs > 0
        {
            config.timing.progress_interval = Duration::from_secs(secs);
        }

        // Output
        if let Ok(path) = env::var("SIEGE_REPORT_PATH")
            && !path.is_empty()
        {
            config.report_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = parse_var("SIEGE_METRICS_ADDR") {
            config.metrics_addr = Some(addr);
        }

        config
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Parse an environment variable, warning about unparsable values
fn parse_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok().filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// One independently scheduled group of sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub flow: Flow,
    #[serde(default)]
    pub overrides: FlowOverrides,
    pub mode: ScenarioMode,
    /// Delay relative to the run start
    #[serde(default, with = "duration_str")]
    pub start_offset: Duration,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Session count for constant concurrency
    #[serde(default)]
    pub constant_value: Option<u32>,
    /// Duration for constant concurrency
    #[serde(default, with = "duration_str::option")]
    pub duration: Option<Duration>,
    /// Level the first stage ramps from (sessions or arrivals per `time_unit`)
    #[serde(default, alias = "start_rate")]
    pub start_value: f64,
    #[serde(default = "default_time_unit", with = "duration_str")]
    pub time_unit: Duration,
    /// Ceiling on sessions in flight
    #[serde(default)]
    pub pool_limit: Option<usize>,
}

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

impl ScenarioConfig {
    /// Scenario with only the required fields set
    pub fn new(name: impl Into<String>, flow: Flow, mode: ScenarioMode) -> Self {
        Self {
            name: name.into(),
            flow,
            overrides: FlowOverrides::default(),
            mode,
            start_offset: Duration::ZERO,
            stages: Vec::new(),
            constant_value: None,
            duration: None,
            start_value: 0.0,
            time_unit: default_time_unit(),
            pool_limit: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyScenarioName);
        }
        match self.mode {
            ScenarioMode::ConstantConcurrency => {
                if self.constant_value.is_none() {
                    return Err(ConfigError::MissingConstantValue(name.clone()));
                }
                if self.duration.is_none() {
                    return Err(ConfigError::MissingDuration(name.clone()));
                }
            }
            ScenarioMode::RampingArrivalRate | ScenarioMode::RampingConcurrency => {
                if self.stages.is_empty() {
                    return Err(ConfigError::MissingStages(name.clone()));
                }
            }
        }
        for target in self.stages.iter().map(|s| s.target).chain([self.start_value]) {
            if !target.is_finite() || target < 0.0 {
                return Err(ConfigError::InvalidStageTarget {
                    scenario: name.clone(),
                    target,
                });
            }
        }
        if self.time_unit.is_zero() {
            return Err(ConfigError::InvalidTimeUnit(name.clone()));
        }
        if self.pool_limit == Some(0) {
            return Err(ConfigError::InvalidPoolLimit(name.clone()));
        }
        if let Some(hold) = &self.overrides.hold {
            hold.validate(name)?;
        }

        let too_long = |what| ConfigError::DurationTooLong {
            scenario: name.clone(),
            what,
            max: MAX_SCENARIO_SPAN,
        };
        if self.ends_at() > MAX_SCENARIO_SPAN {
            return Err(too_long("start_offset plus duration"));
        }
        let flow = self.flow.spec(&self.overrides);
        let session_span = flow
            .send
            .span()
            .and_then(|send| send.checked_add(flow.hold.longest()));
        if !session_span.is_some_and(|span| span <= MAX_SCENARIO_SPAN) {
            return Err(too_long("session send schedule plus hold"));
        }
        Ok(())
    }

    /// Time the scenario keeps starting sessions; saturates instead of overflowing
    pub fn total_duration(&self) -> Duration {
        match self.mode {
            ScenarioMode::ConstantConcurrency => self.duration.unwrap_or_default(),
            _ => self
                .stages
                .iter()
                .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration)),
        }
    }

    /// Offset from the run start at which the scenario stops starting sessions
    pub fn ends_at(&self) -> Duration {
        self.start_offset.saturating_add(self.total_duration())
    }

    /// Pool ceiling, derived from the mode when not configured
    pub fn effective_pool_limit(&self) -> usize {
        if let Some(limit) = self.pool_limit {
            return limit;
        }
        match self.mode {
            ScenarioMode::ConstantConcurrency => self.constant_value.unwrap_or(0) as usize,
            ScenarioMode::RampingConcurrency => self
                .stages
                .iter()
                .map(|s| s.target)
                .fold(self.start_value, f64::max)
                .ceil() as usize,
            ScenarioMode::RampingArrivalRate => DEFAULT_OPEN_LOOP_POOL,
        }
    }
}

/// Scenarios plus the thresholds that judge them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioConfig>,
    /// Metric name (optionally `{scenario:name}` scoped) to threshold expressions
    #[serde(default)]
    pub thresholds: IndexMap<String, Vec<ThresholdDecl>>,
}

impl RunPlan {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Soak => soak_plan(),
            Preset::Abuse => abuse_plan(),
        }
    }
}

fn stage(target: f64, secs: u64) -> Stage {
    Stage {
        target,
        duration: Duration::from_secs(secs),
    }
}

fn soak_plan() -> RunPlan {
    let mut stable = ScenarioConfig::new("stable_connections", Flow::Stable, ScenarioMode::ConstantConcurrency);
    stable.constant_value = Some(50);
    stable.duration = Some(Duration::from_secs(5 * 60));

    let mut intermittent = ScenarioConfig::new(
        "intermittent_connections",
        Flow::Intermittent,
        ScenarioMode::RampingArrivalRate,
    );
    intermittent.start_value = 10.0;
    intermittent.stages = vec![stage(20.0, 60), stage(20.0, 180), stage(0.0, 60)];
    intermittent.pool_limit = Some(100);

    let mut spike = ScenarioConfig::new(
        "reconnection_spike",
        Flow::ReconnectSpike,
        ScenarioMode::RampingConcurrency,
    );
    spike.start_offset = Duration::from_secs(2 * 60);
    spike.stages = vec![stage(150.0, 10), stage(150.0, 30), stage(0.0, 10)];

    let mut thresholds = IndexMap::new();
    thresholds.insert("checks".to_string(), vec![ThresholdDecl::from("rate>0.999")]);
    thresholds.insert("ws_connecting".to_string(), vec![ThresholdDecl::from("p(95)<200")]);

    RunPlan {
        scenarios: vec![stable, intermittent, spike],
        thresholds,
    }
}

/// Attacks run one after another, each given room to finish
fn abuse_plan() -> RunPlan {
    // One arrival over one second starts exactly one session
    let single = |name: &str, flow: Flow, offset: u64| {
        let mut scenario = ScenarioConfig::new(name, flow, ScenarioMode::RampingArrivalRate);
        scenario.start_offset = Duration::from_secs(offset);
        scenario.start_value = 1.0;
        scenario.stages = vec![stage(1.0, 1)];
        scenario.pool_limit = Some(1);
        scenario
    };

    let spam = single("message_spam", Flow::MessageSpam, 0);

    let mut burst = ScenarioConfig::new("multi_connect", Flow::MultiConnect, ScenarioMode::RampingArrivalRate);
    burst.start_offset = Duration::from_secs(15);
    burst.start_value = 50.0;
    burst.stages = vec![stage(50.0, 1)];
    burst.pool_limit = Some(50);

    let malformed = single("malformed_injection", Flow::MalformedInjection, 20);

    RunPlan {
        scenarios: vec![spam, burst, malformed],
        thresholds: IndexMap::new(),
    }
}

/// k6-style duration strings: `"200ms"`, `"10s"`, `"1m30s"`, `"2h"`, `"1.5s"`.
///
/// A bare number is milliseconds. Use with `#[serde(with = "duration_str")]`.
pub mod duration_str {
    use crate::error::ConfigError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    impl Raw {
        fn into_duration(self) -> Result<Duration, ConfigError> {
            match self {
                Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
                Raw::Text(text) => parse(&text),
            }
        }
    }

    pub fn parse(input: &str) -> Result<Duration, ConfigError> {
        let invalid = || ConfigError::InvalidDuration(input.to_string());
        let text = input.trim();
        if text.is_empty() {
            return Err(invalid());
        }
        if let Ok(ms) = text.parse::<f64>() {
            return Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| invalid());
        }

        let is_number = |c: char| c.is_ascii_digit() || c == '.';
        let mut seconds = 0.0;
        let mut rest = text;
        while !rest.is_empty() {
            let unit_start = rest.find(|c: char| !is_number(c)).ok_or_else(invalid)?;
            if unit_start == 0 {
                return Err(invalid());
            }
            let value: f64 = rest[..unit_start].parse().map_err(|_| invalid())?;
            let unit_end = rest[unit_start..]
                .find(is_number)
                .map_or(rest.len(), |i| unit_start + i);
            let scale = match &rest[unit_start..unit_end] {
                "ms" => 0.001,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                _ => return Err(invalid()),
            };
            seconds += value * scale;
            rest = &rest[unit_end..];
        }
        Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
    }

    pub fn format(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            return "0s".to_string();
        }
        if millis % 1000 != 0 {
            return format!("{}ms", millis);
        }
        let secs = millis / 1000;
        let (hours, minutes, secs) = (secs / 3600, secs / 60 % 60, secs % 60);
        let mut out = String::new();
        if hours > 0 {
            out.push_str(&format!("{}h", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}m", minutes));
        }
        if secs > 0 {
            out.push_str(&format!("{}s", secs));
        }
        out
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Raw::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(Raw::into_duration)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
