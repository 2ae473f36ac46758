//! Converts a stage list into a target function of elapsed time.
//!
//! Each stage is an independent linear segment from the previous stage's
//! target to its own, so interpolation at any instant uses only the two
//! waypoints bounding that instant. Staged schedules start from zero, so
//! the first stage is the warm-up ramp; constant executors are a single
//! held value. For arrival-rate executors the curve is an iteration rate
//! (per second) instead of a user count; the runner scales users to
//! sustain it.

use std::time::Duration;

use crate::cli::config::{ExecutorKind, ScenarioConfig, StageStep};
use crate::utils::parse_duration;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Stage {
    pub duration: Duration,
    pub target: f64,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    /// Value the first stage ramps from.
    initial: f64,
    stages: Vec<Stage>,
}

impl Schedule {
    /// Staged schedule ramping from zero through each waypoint in turn.
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self {
            initial: 0.0,
            stages,
        }
    }

    /// A single held value for `duration`.
    pub fn constant(target: f64, duration: Duration) -> Self {
        Self {
            initial: target,
            stages: vec![Stage { duration, target }],
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Target value at `elapsed`. Piecewise-linear between waypoints, held at
    /// the final target once the schedule ends, never below zero. At each
    /// stage boundary the declared target is met exactly.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let mut offset = 0.0;
        let mut prev = self.initial;
        for stage in &self.stages {
            let d = stage.duration.as_secs_f64();
            if t < offset + d {
                let progress = (t - offset) / d;
                return (prev + (stage.target - prev) * progress).max(0.0);
            }
            offset += d;
            prev = stage.target;
        }
        prev.max(0.0)
    }

    /// `target_at` rounded to a whole user count.
    pub fn users_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round().max(0.0) as usize
    }

    /// Highest waypoint value in the schedule.
    pub fn peak(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.initial, f64::max)
    }
}

/// Build the schedule a scenario's executor runs on. For arrival-rate
/// executors the values are normalized to iterations per second.
pub fn build_schedule(config: &ScenarioConfig) -> Result<Schedule> {
    let executor = config.executor_kind()?;
    let unit_secs = match &config.time_unit {
        Some(u) => parse_duration(u, "time_unit")?.as_secs_f64(),
        None => 1.0,
    };

    if let Some(stages) = &config.stages {
        let mut parsed = Vec::with_capacity(stages.len());
        for StageStep { duration, target } in stages {
            let mut target = *target;
            if executor == ExecutorKind::ConstantArrivalRate {
                target /= unit_secs;
            }
            parsed.push(Stage {
                duration: parse_duration(duration, "stage duration")?,
                target,
            });
        }
        return Ok(Schedule::from_stages(parsed));
    }

    let duration = parse_duration(config.duration.as_deref().unwrap_or("10s"), "duration")?;
    let target = match executor {
        ExecutorKind::ConstantArrivalRate => config.rate.unwrap_or(0.0) / unit_secs,
        _ => config.vus.unwrap_or(1) as f64,
    };
    Ok(Schedule::constant(target, duration))
}
