//! Run orchestration: builds the metric pipeline and one runner per
//! scenario, drives them on a shared tokio runtime, and folds the shards
//! into the final summary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

pub mod dispatch;
pub mod probe;
pub mod runner;
pub mod scheduler;

use crate::cli::config::RunConfig;
use crate::stats::report::RunSummary;
use crate::stats::thresholds::{evaluate_all, ThresholdSpec};
use crate::stats::{MetricsRegistry, Recorder, Tags};
use probe::{Probe, ProbeSet};
use runner::{ScenarioRunner, ScenarioSpec};

// Scenarios get disjoint user id ranges; ids index RNG streams and metric
// shards, so overlap would correlate scenarios.
const SCENARIO_ID_STRIDE: u64 = 1_000_000;

const ABORT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Global cap on concurrently active users across all scenarios.
pub struct UserCeiling {
    limit: usize,
    active: AtomicUsize,
}

impl UserCeiling {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            active: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<UserSlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(UserSlot {
                        ceiling: self.clone(),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Permit for one active user. The owning task holds it for its lifetime;
/// dropping it returns the slot, including when the task's future is
/// dropped by an abort.
pub struct UserSlot {
    ceiling: Arc<UserCeiling>,
}

impl Drop for UserSlot {
    fn drop(&mut self) {
        self.ceiling.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Load-test engine. Embedding binaries register probes, then hand over a
/// validated config; `run` owns the runtime for the duration of the test.
#[derive(Default)]
pub struct Engine {
    probes: ProbeSet,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_probe(&mut self, name: &str, probe: Arc<dyn Probe>) {
        self.probes.register(name, probe);
    }

    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    /// Execute a full run and return the final summary. Blocks until every
    /// scenario has drained or the run cap fired.
    pub fn run(&self, config: &RunConfig) -> Result<RunSummary> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build runtime")?;
        runtime.block_on(self.execute(config))
    }

    async fn execute(&self, config: &RunConfig) -> Result<RunSummary> {
        let specs = config.threshold_specs()?;
        let filters = bucket_filters(&specs);
        let shards = num_cpus::get().max(1);
        let registry = Arc::new(MetricsRegistry::new(shards, filters));
        let run_tags: Tags = config.tags.clone().unwrap_or_default().into_iter().collect();
        let recorder = Recorder::new(registry.clone(), run_tags);
        let vars = Arc::new(config.env.clone().unwrap_or_default());
        let behaviors = config.behaviors.clone().unwrap_or_default();
        let seed = config.seed.unwrap_or_else(rand::random);
        info!(seed, "run seed");

        // Deterministic scenario order fixes id ranges across runs.
        let scenarios = config.scenarios.clone().unwrap_or_default();
        let mut scenario_names: Vec<&String> = scenarios.keys().collect();
        scenario_names.sort();

        let mut scenario_specs = Vec::with_capacity(scenario_names.len());
        for name in &scenario_names {
            scenario_specs.push(ScenarioSpec::from_config(
                name.as_str(),
                &scenarios[*name],
                &behaviors,
            )?);
        }

        let default_ceiling: usize = scenario_specs.iter().map(|s| s.peak_users()).sum();
        let ceiling = Arc::new(UserCeiling::new(
            config.vus.unwrap_or(default_ceiling).max(1),
        ));
        let grace = config.grace_period()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(scenario_specs.len());
        for (index, spec) in scenario_specs.into_iter().enumerate() {
            let runner = ScenarioRunner::new(
                spec,
                &self.probes,
                &recorder,
                ceiling.clone(),
                vars.clone(),
                seed,
                index as u64 * SCENARIO_ID_STRIDE,
            )?;
            handles.push(tokio::spawn(runner.run(stop_rx.clone(), grace)));
        }

        let mut watchdogs = Vec::new();
        if let Some(cap) = config.run_cap()? {
            let stop = stop_tx.clone();
            watchdogs.push(tokio::spawn(async move {
                sleep(cap).await;
                warn!("run duration cap reached, stopping all scenarios");
                let _ = stop.send(true);
            }));
        }
        if config.abort_on_fail.unwrap_or(false) && !specs.is_empty() {
            let stop = stop_tx.clone();
            let registry = registry.clone();
            let specs = specs.clone();
            watchdogs.push(tokio::spawn(async move {
                loop {
                    sleep(ABORT_CHECK_INTERVAL).await;
                    let snapshot = registry.merge();
                    if snapshot.is_empty() {
                        continue;
                    }
                    let breached: Vec<_> = evaluate_all(&specs, &snapshot)
                        .into_iter()
                        .filter(|r| !r.passed)
                        .collect();
                    if !breached.is_empty() {
                        for result in &breached {
                            warn!(
                                selector = %result.selector,
                                expression = %result.expression,
                                "threshold breached, aborting run"
                            );
                        }
                        let _ = stop.send(true);
                        return;
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.context("scenario task panicked")??;
        }
        for watchdog in watchdogs {
            watchdog.abort();
        }

        let merged = registry.merge();
        Ok(RunSummary::build(&merged, &specs))
    }
}

/// Declared sub-buckets, derived from the tag filters thresholds reference.
fn bucket_filters(specs: &[ThresholdSpec]) -> HashMap<String, Vec<Tags>> {
    let mut filters: HashMap<String, Vec<Tags>> = HashMap::new();
    for spec in specs {
        if spec.filter().is_empty() {
            continue;
        }
        let entry = filters.entry(spec.metric().to_string()).or_default();
        if !entry.contains(spec.filter()) {
            entry.push(spec.filter().clone());
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::probe::{ProbeContext, ProbeOutcome};
    use async_trait::async_trait;
    use std::time::Instant;

    struct PauseProbe(Duration);

    #[async_trait]
    impl Probe for PauseProbe {
        async fn execute(&self, _ctx: &ProbeContext) -> ProbeOutcome {
            sleep(self.0).await;
            ProbeOutcome::ok()
        }
    }

    fn engine_with_pause(delay: Duration) -> Engine {
        let mut engine = Engine::new();
        engine.register_probe("pause", Arc::new(PauseProbe(delay)));
        engine
    }

    fn config(yaml: &str) -> RunConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_ceiling_slots_release_on_drop() {
        let ceiling = Arc::new(UserCeiling::new(2));
        let first = ceiling.try_acquire().unwrap();
        let second = ceiling.try_acquire().unwrap();
        assert!(ceiling.try_acquire().is_none());
        assert_eq!(ceiling.active(), 2);
        drop(first);
        assert_eq!(ceiling.active(), 1);
        let _third = ceiling.try_acquire().unwrap();
        assert!(ceiling.try_acquire().is_none());
        assert_eq!(ceiling.limit(), 2);
        drop(second);
    }

    #[test]
    fn test_end_to_end_run_passes_thresholds() {
        let engine = engine_with_pause(Duration::from_millis(5));
        let config = config(
            r#"
seed: 7
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  steady:
    vus: 2
    duration: "400ms"
    behaviors: mix
thresholds:
  iterations:
    - "count>0"
  iteration_duration:
    - "p(95)<10000"
"#,
        );
        let summary = engine.run(&config).unwrap();
        assert!(summary.passed, "{}", summary.to_json());
        assert_eq!(summary.thresholds.len(), 2);
        assert!(!summary.metrics.is_empty());
    }

    #[test]
    fn test_unmeetable_threshold_fails_run() {
        let engine = engine_with_pause(Duration::from_millis(2));
        let config = config(
            r#"
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  steady:
    vus: 1
    duration: "200ms"
    behaviors: mix
thresholds:
  iterations:
    - "count>1000000"
"#,
        );
        let summary = engine.run(&config).unwrap();
        assert!(!summary.passed);
    }

    #[test]
    fn test_run_cap_stops_long_scenarios() {
        let engine = engine_with_pause(Duration::from_millis(5));
        let config = config(
            r#"
duration: "300ms"
stop: "500ms"
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  forever:
    vus: 2
    duration: "60s"
    behaviors: mix
"#,
        );
        let started = Instant::now();
        let summary = engine.run(&config).unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "run cap did not fire, took {:?}",
            started.elapsed()
        );
        assert!(summary.passed);
    }

    #[test]
    fn test_abort_on_fail_stops_early() {
        let engine = engine_with_pause(Duration::from_millis(5));
        // count<0 can never pass once any iteration lands
        let config = config(
            r#"
abort_on_fail: true
stop: "500ms"
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  forever:
    vus: 2
    duration: "60s"
    behaviors: mix
thresholds:
  iterations:
    - "count<0"
"#,
        );
        let started = Instant::now();
        let summary = engine.run(&config).unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(20),
            "abort_on_fail did not fire, took {:?}",
            started.elapsed()
        );
        assert!(!summary.passed);
    }

    #[test]
    fn test_invalid_config_rejected_before_start() {
        let engine = engine_with_pause(Duration::from_millis(1));
        let config = config(
            r#"
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  broken:
    vus: 0
    duration: "1s"
    behaviors: mix
"#,
        );
        assert!(engine.run(&config).is_err());
    }

    #[test]
    fn test_unregistered_probe_rejected_at_startup() {
        let engine = Engine::new();
        let config = config(
            r#"
behaviors:
  mix:
    - { name: missing, weight: 1, probe: nope }
scenarios:
  steady:
    vus: 1
    duration: "1s"
    behaviors: mix
"#,
        );
        let err = engine.run(&config).unwrap_err();
        assert!(err.to_string().contains("no probe registered"));
    }

    #[test]
    fn test_scenarios_partition_metrics_by_tag() {
        let engine = engine_with_pause(Duration::from_millis(5));
        let config = config(
            r#"
seed: 11
behaviors:
  mix:
    - { name: pause, weight: 1, probe: pause }
scenarios:
  alpha:
    vus: 1
    duration: "300ms"
    behaviors: mix
  beta:
    vus: 1
    duration: "300ms"
    behaviors: mix
thresholds:
  "iterations{scenario:alpha}":
    - "count>0"
  "iterations{scenario:beta}":
    - "count>0"
"#,
        );
        let summary = engine.run(&config).unwrap();
        assert!(summary.passed, "{}", summary.to_json());
        // Untagged bucket plus one sub-bucket per scenario.
        let iteration_buckets: Vec<_> = summary
            .metrics
            .iter()
            .filter(|m| m.name == "iterations")
            .collect();
        assert_eq!(iteration_buckets.len(), 3);
    }

    #[test]
    fn test_non_overlapping_scenarios_never_coexist() {
        struct TrackingProbe {
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl Probe for TrackingProbe {
            async fn execute(&self, _ctx: &ProbeContext) -> ProbeOutcome {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                ProbeOutcome::ok()
            }
        }

        let probe = Arc::new(TrackingProbe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut engine = Engine::new();
        engine.register_probe("track", probe.clone());

        // One user each; the 200ms gap between the windows means a peak
        // above 1 would prove the scenarios overlapped.
        let config = config(
            r#"
behaviors:
  mix:
    - { name: track, weight: 1, probe: track }
scenarios:
  early:
    vus: 1
    duration: "300ms"
    behaviors: mix
  late:
    vus: 1
    duration: "300ms"
    start_time: "500ms"
    behaviors: mix
thresholds:
  "iterations{scenario:early}":
    - "count>0"
  "iterations{scenario:late}":
    - "count>0"
"#,
        );
        let summary = engine.run(&config).unwrap();
        assert!(summary.passed, "{}", summary.to_json());
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bucket_filters_deduplicate() {
        let specs = vec![
            ThresholdSpec::parse("duration{scenario:a}", "avg<10").unwrap(),
            ThresholdSpec::parse("duration{scenario:a}", "p(95)<100").unwrap(),
            ThresholdSpec::parse("duration{scenario:b}", "avg<10").unwrap(),
            ThresholdSpec::parse("iterations", "count>0").unwrap(),
        ];
        let filters = bucket_filters(&specs);
        assert_eq!(filters["duration"].len(), 2);
        assert!(!filters.contains_key("iterations"));
    }
}
