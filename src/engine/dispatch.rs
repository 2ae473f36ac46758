//! Weighted behavior selection. Each iteration draws one behavior from the
//! scenario's set; over many draws the observed mix converges to the declared
//! weight ratios. Selection uses the caller's RNG so a seeded run replays the
//! same sequence per user.

use anyhow::{bail, Result};
use rand::Rng;

use crate::cli::config::BehaviorStep;

/// What a drawn behavior executes: a named probe registered with the engine,
/// or the built-in HTTP GET probe against a URL template.
#[derive(Debug, Clone, PartialEq)]
pub enum BehaviorAction {
    Probe(String),
    HttpGet(String),
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub name: String,
    pub action: BehaviorAction,
    weight: f64,
}

/// Immutable weighted set shared by every user of a scenario.
#[derive(Debug, Clone)]
pub struct BehaviorDispatcher {
    behaviors: Vec<Behavior>,
    cumulative: Vec<f64>,
    total: f64,
}

impl BehaviorDispatcher {
    pub fn from_steps(steps: &[BehaviorStep]) -> Result<Self> {
        if steps.is_empty() {
            bail!("behavior set is empty");
        }
        let mut behaviors = Vec::with_capacity(steps.len());
        let mut cumulative = Vec::with_capacity(steps.len());
        let mut total = 0.0;
        for step in steps {
            if !step.weight.is_finite() || step.weight <= 0.0 {
                bail!("behavior '{}' has non-positive weight", step.name);
            }
            let action = match (&step.probe, &step.url) {
                (Some(probe), _) => BehaviorAction::Probe(probe.clone()),
                (None, Some(url)) => BehaviorAction::HttpGet(url.clone()),
                (None, None) => bail!("behavior '{}' has no probe or url", step.name),
            };
            total += step.weight;
            cumulative.push(total);
            behaviors.push(Behavior {
                name: step.name.clone(),
                action,
                weight: step.weight,
            });
        }
        Ok(Self {
            behaviors,
            cumulative,
            total,
        })
    }

    /// Draw one behavior. A point is sampled uniformly in [0, total) and
    /// mapped through the cumulative weights, so each behavior is picked with
    /// probability weight / total.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> &Behavior {
        let point = rng.gen_range(0.0..self.total);
        let idx = match self.cumulative.binary_search_by(|edge| edge.total_cmp(&point)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        // point < total guarantees idx is in range
        &self.behaviors[idx.min(self.behaviors.len() - 1)]
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }

    #[cfg(test)]
    fn share(&self, name: &str) -> f64 {
        self.behaviors
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.weight / self.total)
            .unwrap_or(0.0)
    }
}
