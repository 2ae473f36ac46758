use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::stats::thresholds::ThresholdSpec;
use crate::utils::parse_duration;

/// One waypoint in a scenario's ramp schedule: hold or ramp toward `target`
/// over `duration`. For arrival-rate executors the target is an iteration
/// rate instead of a user count.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct StageStep {
    pub duration: String,
    pub target: f64,
}

/// Bounded random pause between iterations.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ThinkTimeConfig {
    pub min: Option<String>,
    pub max: Option<String>,
}

/// One weighted entry in a behavior set. Either references a probe registered
/// by the embedding binary (`probe`) or uses the built-in HTTP GET probe
/// (`url`, with `${VAR}` expansion against the injected environment).
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct BehaviorStep {
    pub name: String,
    pub weight: f64,
    pub probe: Option<String>,
    pub url: Option<String>,
}

/// Configuration for a single scenario within a run
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ScenarioConfig {
    /// Executor type (constant-vus, ramping-vus, constant-arrival-rate)
    pub executor: Option<String>,
    /// Number of concurrent virtual users (constant-vus)
    pub vus: Option<usize>,
    /// Duration of the scenario (constant executors)
    pub duration: Option<String>,
    /// Ramping schedule (stages)
    pub stages: Option<Vec<StageStep>>,
    /// Delay before starting this scenario (e.g., "30s")
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    /// Iteration rate for arrival-rate executors
    pub rate: Option<f64>,
    /// Time unit the rate is expressed over (default "1s")
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<String>,
    /// Users assumed available up-front for arrival-rate executors
    #[serde(alias = "preAllocatedVUs")]
    pub preallocated_vus: Option<usize>,
    /// Upper bound on users an arrival-rate executor may scale to
    #[serde(alias = "maxVUs")]
    pub max_vus: Option<usize>,
    /// Static tags attached to every sample this scenario produces
    pub tags: Option<HashMap<String, String>>,
    /// Name of the behavior set iterated by this scenario's users
    pub behaviors: Option<String>,
    /// Pause between iterations
    #[serde(alias = "thinkTime")]
    pub think_time: Option<ThinkTimeConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RunConfig {
    /// Global ceiling on concurrently active virtual users across scenarios.
    /// Defaults to the sum of per-scenario peaks.
    pub vus: Option<usize>,
    /// Hard cap on total run time; triggers a graceful stop of every scenario
    pub duration: Option<String>,
    /// Grace period before in-flight iterations are force-cancelled
    pub stop: Option<String>,
    /// Seed for behavior selection and think-time jitter; runs with the same
    /// seed and configuration are reproducible
    pub seed: Option<u64>,
    /// Tags attached to every sample of the run
    pub tags: Option<HashMap<String, String>>,
    /// Named string variables passed opaquely to probes (target host,
    /// credentials); the engine never inspects their content
    pub env: Option<HashMap<String, String>>,
    /// Named weighted behavior sets referenced by scenarios
    pub behaviors: Option<HashMap<String, Vec<BehaviorStep>>>,
    /// Scenarios with independent schedules, executed concurrently
    pub scenarios: Option<HashMap<String, ScenarioConfig>>,
    /// Pass/fail criteria: metric selector -> comparison expressions
    pub thresholds: Option<HashMap<String, Vec<String>>>,
    /// Re-evaluate thresholds once per second and stop the run on a breach
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
}

impl RunConfig {
    /// Load a run configuration from a YAML or JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON config {}", path.display()))?
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid YAML config {}", path.display()))?
        };
        Ok(config)
    }

    pub fn grace_period(&self) -> Result<Duration> {
        match &self.stop {
            Some(s) => parse_duration(s, "stop"),
            None => Ok(Duration::from_secs(10)),
        }
    }

    pub fn run_cap(&self) -> Result<Option<Duration>> {
        self.duration
            .as_deref()
            .map(|s| parse_duration(s, "duration"))
            .transpose()
    }

    /// Validate the whole configuration. Any error here is fatal and is
    /// reported before a single virtual user starts.
    pub fn validate(&self) -> Result<()> {
        let scenarios = match &self.scenarios {
            Some(s) if !s.is_empty() => s,
            _ => bail!("config declares no scenarios"),
        };
        let behaviors = self.behaviors.clone().unwrap_or_default();

        for (name, set) in &behaviors {
            if set.is_empty() {
                bail!("behavior set '{}' is empty", name);
            }
            for step in set {
                if !step.weight.is_finite() || step.weight <= 0.0 {
                    bail!(
                        "behavior '{}' in set '{}' has non-positive weight {}",
                        step.name,
                        name,
                        step.weight
                    );
                }
                if step.probe.is_none() && step.url.is_none() {
                    bail!(
                        "behavior '{}' in set '{}' names neither a probe nor a url",
                        step.name,
                        name
                    );
                }
            }
        }

        for (name, scenario) in scenarios {
            validate_scenario(name, scenario, &behaviors)?;
        }

        if let Some(vus) = self.vus {
            if vus == 0 {
                bail!("global vus ceiling must be at least 1");
            }
        }
        self.grace_period()?;
        self.run_cap()?;

        for (selector, exprs) in self.thresholds.clone().unwrap_or_default() {
            if exprs.is_empty() {
                bail!("threshold '{}' has no expressions", selector);
            }
            for expr in &exprs {
                ThresholdSpec::parse(&selector, expr)
                    .with_context(|| format!("invalid threshold '{}': '{}'", selector, expr))?;
            }
        }

        Ok(())
    }

    /// Parsed threshold specs, in deterministic order.
    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>> {
        let mut selectors: Vec<_> = self
            .thresholds
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        selectors.sort_by(|a, b| a.0.cmp(&b.0));
        let mut specs = Vec::new();
        for (selector, exprs) in selectors {
            for expr in exprs {
                specs.push(ThresholdSpec::parse(&selector, &expr)?);
            }
        }
        Ok(specs)
    }
}

fn validate_scenario(
    name: &str,
    scenario: &ScenarioConfig,
    behaviors: &HashMap<String, Vec<BehaviorStep>>,
) -> Result<()> {
    let set = scenario
        .behaviors
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("scenario '{}' names no behavior set", name))?;
    if !behaviors.contains_key(set) {
        bail!(
            "scenario '{}' references unknown behavior set '{}'",
            name,
            set
        );
    }

    let executor = scenario.executor_kind()?;
    if let Some(stages) = &scenario.stages {
        if stages.is_empty() {
            bail!("scenario '{}' has an empty stage list", name);
        }
        for (i, stage) in stages.iter().enumerate() {
            let d = parse_duration(&stage.duration, "stage duration")
                .with_context(|| format!("scenario '{}' stage {}", name, i))?;
            if d.is_zero() {
                bail!("scenario '{}' stage {} has zero duration", name, i);
            }
            if !stage.target.is_finite() || stage.target < 0.0 {
                bail!(
                    "scenario '{}' stage {} has negative target {}",
                    name,
                    i,
                    stage.target
                );
            }
        }
    }

    match executor {
        ExecutorKind::RampingVus => {
            if scenario.stages.is_none() {
                bail!(
                    "scenario '{}' uses ramping-vus but declares no stages",
                    name
                );
            }
        }
        ExecutorKind::ConstantVus => {
            if scenario.stages.is_none() {
                if scenario.vus.unwrap_or(0) == 0 {
                    bail!("scenario '{}' needs vus >= 1", name);
                }
                if scenario.duration.is_none() {
                    bail!("scenario '{}' needs a duration", name);
                }
            }
        }
        ExecutorKind::ConstantArrivalRate => {
            if scenario.stages.is_none() {
                let rate = scenario.rate.unwrap_or(0.0);
                if !rate.is_finite() || rate <= 0.0 {
                    bail!("scenario '{}' needs a positive rate", name);
                }
                if scenario.duration.is_none() {
                    bail!("scenario '{}' needs a duration", name);
                }
            }
            if let Some(unit) = &scenario.time_unit {
                let d = parse_duration(unit, "time_unit")
                    .with_context(|| format!("scenario '{}'", name))?;
                if d.is_zero() {
                    bail!("scenario '{}' has a zero time_unit", name);
                }
            }
            let pre = scenario.preallocated_vus.unwrap_or(1);
            if let Some(max) = scenario.max_vus {
                if max < pre {
                    bail!(
                        "scenario '{}' max_vus {} is below preallocated_vus {}",
                        name,
                        max,
                        pre
                    );
                }
            }
        }
    }

    if let Some(d) = &scenario.duration {
        parse_duration(d, "duration").with_context(|| format!("scenario '{}'", name))?;
    }
    if let Some(offset) = &scenario.start_time {
        parse_duration(offset, "start_time").with_context(|| format!("scenario '{}'", name))?;
    }
    if let Some(think) = &scenario.think_time {
        let min = think
            .min
            .as_deref()
            .map(|s| parse_duration(s, "think_time.min"))
            .transpose()?
            .unwrap_or_default();
        let max = think
            .max
            .as_deref()
            .map(|s| parse_duration(s, "think_time.max"))
            .transpose()?
            .unwrap_or(min);
        if max < min {
            bail!("scenario '{}' think_time max below min", name);
        }
    }
    Ok(())
}

/// How a scenario converts its schedule into a user-count target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    ConstantVus,
    RampingVus,
    ConstantArrivalRate,
}

impl ScenarioConfig {
    pub fn executor_kind(&self) -> Result<ExecutorKind> {
        match self.executor.as_deref() {
            None | Some("constant-vus") => Ok(ExecutorKind::ConstantVus),
            Some("ramping-vus") => Ok(ExecutorKind::RampingVus),
            Some("constant-arrival-rate") | Some("ramping-arrival-rate") => {
                Ok(ExecutorKind::ConstantArrivalRate)
            }
            Some(other) => bail!("unknown executor '{}'", other),
        }
    }
}
