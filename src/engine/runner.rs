//! Per-scenario execution: spawns and retires virtual users against the
//! scenario's schedule, paces arrival-rate scenarios, and records the
//! engine's built-in metrics.
//!
//! Each virtual user is a tokio task looping draw -> execute -> record ->
//! pause. Users only observe their stop signal at the loop top and during
//! pauses, so an iteration that has started always runs to completion unless
//! the grace period expires and the task is aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::dispatch::{BehaviorAction, BehaviorDispatcher};
use super::probe::{HttpProbe, Probe, ProbeContext, ProbeSet};
use super::scheduler::{build_schedule, Schedule};
use super::{UserCeiling, UserSlot};
use crate::cli::config::{BehaviorStep, ExecutorKind, ScenarioConfig};
use crate::stats::{metric, Recorder, Tags};
use crate::utils::parse_duration;

const TICK: Duration = Duration::from_millis(100);

// Distinct per-user RNG streams from one run seed.
const SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Bounded random pause between iterations of a closed-model user.
#[derive(Debug, Clone, Copy)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn from_config(config: Option<&crate::cli::config::ThinkTimeConfig>) -> Result<Self> {
        let config = match config {
            Some(c) => c,
            None => return Ok(Self::none()),
        };
        let min = config
            .min
            .as_deref()
            .map(|s| parse_duration(s, "think_time.min"))
            .transpose()?
            .unwrap_or(Duration::ZERO);
        let max = config
            .max
            .as_deref()
            .map(|s| parse_duration(s, "think_time.max"))
            .transpose()?
            .unwrap_or(min);
        if max < min {
            return Err(anyhow!("think_time max below min"));
        }
        Ok(Self { min, max })
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

/// Exponential moving average of iteration durations. Arrival-rate scaling
/// uses it to estimate how many concurrent users sustain the target rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaceTracker {
    ema_secs: Option<f64>,
}

impl PaceTracker {
    const ALPHA: f64 = 0.3;

    pub fn observe(&mut self, took: Duration) {
        let secs = took.as_secs_f64();
        self.ema_secs = Some(match self.ema_secs {
            Some(ema) => ema + Self::ALPHA * (secs - ema),
            None => secs,
        });
    }

    pub fn estimate(&self) -> Option<Duration> {
        self.ema_secs.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Default)]
struct PaceState {
    tracker: PaceTracker,
    /// Per-user inter-iteration interval, set by the scheduler tick.
    interval: Option<Duration>,
}

/// Everything a scenario needs at run time, resolved from config up front so
/// no user ever fails on a missing probe or bad duration mid-run.
pub struct ScenarioSpec {
    pub name: String,
    pub executor: ExecutorKind,
    pub schedule: Schedule,
    pub start_offset: Duration,
    pub dispatcher: BehaviorDispatcher,
    pub think: ThinkTime,
    pub tags: Tags,
    pub preallocated: usize,
    pub max_users: Option<usize>,
}

impl ScenarioSpec {
    pub fn from_config(
        name: &str,
        config: &ScenarioConfig,
        behaviors: &HashMap<String, Vec<BehaviorStep>>,
    ) -> Result<Self> {
        let set_name = config
            .behaviors
            .as_deref()
            .ok_or_else(|| anyhow!("scenario '{}' names no behavior set", name))?;
        let steps = behaviors
            .get(set_name)
            .ok_or_else(|| anyhow!("scenario '{}' references unknown behavior set '{}'", name, set_name))?;
        let dispatcher = BehaviorDispatcher::from_steps(steps)?;
        let schedule = build_schedule(config)?;
        let executor = config.executor_kind()?;
        let start_offset = config
            .start_time
            .as_deref()
            .map(|s| parse_duration(s, "start_time"))
            .transpose()?
            .unwrap_or(Duration::ZERO);
        let think = ThinkTime::from_config(config.think_time.as_ref())?;
        let tags = config
            .tags
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok(Self {
            name: name.to_string(),
            executor,
            schedule,
            start_offset,
            dispatcher,
            think,
            tags,
            preallocated: config.preallocated_vus.unwrap_or(1),
            max_users: config.max_vus,
        })
    }

    /// Most users this scenario can ever have active at once.
    pub fn peak_users(&self) -> usize {
        match self.executor {
            ExecutorKind::ConstantArrivalRate => {
                self.max_users.unwrap_or(self.preallocated).max(1)
            }
            _ => self.schedule.peak().ceil() as usize,
        }
    }

    pub fn end_at(&self) -> Duration {
        self.start_offset + self.schedule.total_duration()
    }
}

/// State shared by every user task of one scenario.
struct WorkerEnv {
    scenario: String,
    executor: ExecutorKind,
    recorder: Recorder,
    dispatcher: BehaviorDispatcher,
    resolved: HashMap<String, Arc<dyn Probe>>,
    vars: Arc<HashMap<String, String>>,
    think: ThinkTime,
    pace: Mutex<PaceState>,
}

struct UserHandle {
    id: u64,
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    busy: Arc<AtomicBool>,
}

pub struct ScenarioRunner {
    spec: ScenarioSpec,
    env: Arc<WorkerEnv>,
    ceiling: Arc<UserCeiling>,
    seed: u64,
    /// Offset into the run-wide user id space, so writer ids and RNG streams
    /// never collide across scenarios.
    id_base: u64,
}

impl ScenarioRunner {
    pub fn new(
        spec: ScenarioSpec,
        probes: &ProbeSet,
        run_recorder: &Recorder,
        ceiling: Arc<UserCeiling>,
        vars: Arc<HashMap<String, String>>,
        seed: u64,
        id_base: u64,
    ) -> Result<Self> {
        let resolved = resolve_probes(&spec.dispatcher, probes)?;
        let mut scenario_tags = spec.tags.clone();
        scenario_tags.insert("scenario".to_string(), spec.name.clone());
        let recorder = run_recorder.with_tags(scenario_tags);
        let env = Arc::new(WorkerEnv {
            scenario: spec.name.clone(),
            executor: spec.executor,
            recorder,
            dispatcher: spec.dispatcher.clone(),
            resolved,
            vars,
            think: spec.think,
            pace: Mutex::new(PaceState::default()),
        });
        Ok(Self {
            spec,
            env,
            ceiling,
            seed,
            id_base,
        })
    }

    /// Drive the scenario to completion. Returns once every user has exited
    /// or been aborted after `grace`.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>, grace: Duration) -> Result<()> {
        if !self.spec.start_offset.is_zero() {
            tokio::select! {
                _ = sleep(self.spec.start_offset) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }

        info!(scenario = %self.spec.name, "scenario started");
        let started = Instant::now();
        let total = self.spec.schedule.total_duration();
        let mut ticker = interval(TICK);
        let mut users: Vec<UserHandle> = Vec::new();
        let mut retiring: Vec<UserHandle> = Vec::new();
        let mut next_id: u64 = 0;
        let mut deficit_warned = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }

            let desired = self.desired_users(elapsed);
            self.reconcile(desired, &mut users, &mut retiring, &mut next_id, &mut deficit_warned);
            self.env
                .recorder
                .gauge(metric::VUS, users.len() as f64, Tags::new());
            retiring.retain(|u| !u.handle.is_finished());
        }

        // Graceful stop: signal everyone, then wait out the grace period.
        for user in users.iter().chain(retiring.iter()) {
            let _ = user.stop_tx.send(true);
        }
        let deadline = Instant::now() + grace;
        for mut user in users.drain(..).chain(retiring.drain(..)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut user.handle).await.is_err() {
                if user.busy.load(Ordering::Relaxed) {
                    self.env
                        .recorder
                        .counter(metric::ITERATIONS_TRUNCATED, 1.0, Tags::new());
                }
                debug!(scenario = %self.spec.name, user = user.id, "aborting user past grace period");
                user.handle.abort();
                // Wait for the cancelled future to drop so its ceiling slot
                // is back before the run reports.
                let _ = user.handle.await;
            }
        }
        self.env.recorder.gauge(metric::VUS, 0.0, Tags::new());
        info!(scenario = %self.spec.name, "scenario finished");
        Ok(())
    }

    /// User count the schedule asks for at `elapsed`. For arrival-rate
    /// scenarios this converts the target rate into a concurrency estimate
    /// and refreshes the shared pacing interval.
    fn desired_users(&self, elapsed: Duration) -> usize {
        match self.spec.executor {
            ExecutorKind::ConstantArrivalRate => {
                let rate = self.spec.schedule.target_at(elapsed);
                if rate <= 0.0 {
                    self.env.pace.lock().interval = None;
                    return 0;
                }
                let estimate = self.env.pace.lock().tracker.estimate();
                let want = match estimate {
                    Some(d) => (rate * d.as_secs_f64()).ceil() as usize,
                    None => self.spec.preallocated,
                }
                .max(1);
                let cap = self.spec.max_users.unwrap_or(self.spec.preallocated).max(1);
                let desired = want.min(cap);
                self.env.pace.lock().interval =
                    Some(Duration::from_secs_f64(desired as f64 / rate));
                if want > cap {
                    self.env.recorder.counter(
                        metric::SCHEDULING_DEFICIT,
                        (want - cap) as f64,
                        Tags::new(),
                    );
                }
                desired
            }
            _ => self.spec.schedule.users_at(elapsed),
        }
    }

    fn reconcile(
        &self,
        desired: usize,
        users: &mut Vec<UserHandle>,
        retiring: &mut Vec<UserHandle>,
        next_id: &mut u64,
        deficit_warned: &mut bool,
    ) {
        while users.len() < desired {
            let Some(slot) = self.ceiling.try_acquire() else {
                let shortfall = (desired - users.len()) as f64;
                self.env
                    .recorder
                    .counter(metric::SCHEDULING_DEFICIT, shortfall, Tags::new());
                if !*deficit_warned {
                    warn!(
                        scenario = %self.env.scenario,
                        shortfall,
                        "user ceiling reached, running below target"
                    );
                    *deficit_warned = true;
                }
                return;
            };
            let id = self.id_base + *next_id;
            *next_id += 1;
            users.push(self.spawn_user(id, slot));
        }
        *deficit_warned = false;

        // Retire oldest first so long-lived users drain ahead of fresh ones.
        while users.len() > desired {
            let user = users.remove(0);
            let _ = user.stop_tx.send(true);
            retiring.push(user);
        }
    }

    fn spawn_user(&self, id: u64, slot: UserSlot) -> UserHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let busy = Arc::new(AtomicBool::new(false));
        let env = self.env.clone();
        let seed = self.seed ^ id.wrapping_mul(SEED_MIX);
        let busy_task = busy.clone();
        let handle = tokio::spawn(async move {
            // The slot lives as long as the task; an abort drops the future
            // and returns it.
            let _slot = slot;
            user_loop(env, id, seed, stop_rx, busy_task).await;
        });
        UserHandle {
            id,
            handle,
            stop_tx,
            busy,
        }
    }
}

/// Pre-resolve every behavior to its probe so misconfiguration fails at
/// startup rather than on the first draw.
fn resolve_probes(
    dispatcher: &BehaviorDispatcher,
    probes: &ProbeSet,
) -> Result<HashMap<String, Arc<dyn Probe>>> {
    let mut resolved: HashMap<String, Arc<dyn Probe>> = HashMap::new();
    for behavior in dispatcher.behaviors() {
        let probe: Arc<dyn Probe> = match &behavior.action {
            BehaviorAction::Probe(name) => probes.get(name)?,
            BehaviorAction::HttpGet(url) => Arc::new(HttpProbe::new(url)?),
        };
        resolved.insert(behavior.name.clone(), probe);
    }
    Ok(resolved)
}

async fn user_loop(
    env: Arc<WorkerEnv>,
    id: u64,
    seed: u64,
    mut stop_rx: watch::Receiver<bool>,
    busy: Arc<AtomicBool>,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let recorder = env.recorder.for_writer(id);
    let mut iteration: u64 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        let behavior = env.dispatcher.draw(&mut rng);
        let probe = match env.resolved.get(&behavior.name) {
            Some(p) => p.clone(),
            // resolve_probes covered every behavior at startup
            None => break,
        };
        let name = behavior.name.clone();
        let ctx = ProbeContext {
            vars: env.vars.clone(),
            user: id,
            iteration,
        };

        busy.store(true, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = probe.execute(&ctx).await;
        let took = started.elapsed();
        busy.store(false, Ordering::Relaxed);
        iteration += 1;

        let mut tags = outcome.tags.clone();
        tags.insert("behavior".to_string(), name.clone());
        recorder.trend(
            metric::ITERATION_DURATION,
            took.as_secs_f64() * 1000.0,
            tags.clone(),
        );
        recorder.counter(metric::ITERATIONS, 1.0, tags.clone());
        recorder.rate(metric::FAILED_RATE, !outcome.success, tags.clone());
        if !outcome.success {
            recorder.counter(metric::FAILED_ITERATIONS, 1.0, tags);
            debug!(
                scenario = %env.scenario,
                behavior = %name,
                user = id,
                error = outcome.error.as_deref().unwrap_or("unspecified"),
                "iteration failed"
            );
        }

        let pause = match env.executor {
            ExecutorKind::ConstantArrivalRate => {
                let mut pace = env.pace.lock();
                pace.tracker.observe(took);
                match pace.interval {
                    Some(i) => i.saturating_sub(took),
                    None => Duration::ZERO,
                }
            }
            _ => env.think.sample(&mut rng),
        };
        if !pause.is_zero() {
            tokio::select! {
                _ = sleep(pause) => {}
                _ = stop_rx.changed() => break,
            }
        }
    }
}
