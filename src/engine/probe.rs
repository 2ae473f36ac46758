//! Probes are the unit of work a virtual user executes. The engine measures
//! and schedules them without knowing what they do; embedding binaries
//! register their own implementations under a name and reference them from
//! behavior sets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::stats::Tags;
use crate::utils::parse_duration;

/// Run-scoped context handed to every probe call.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Opaque variables from the run config's `env` section.
    pub vars: Arc<HashMap<String, String>>,
    /// Virtual user executing this call.
    pub user: u64,
    /// Per-user iteration counter, starting at 0.
    pub iteration: u64,
}

/// Result of one probe call. `error` is recorded for the failure rate but
/// never aborts the user; `tags` are merged into the call's samples at the
/// highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub tags: Tags,
}

impl ProbeOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            tags: Tags::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn execute(&self, ctx: &ProbeContext) -> ProbeOutcome;
}

/// Named probe registry built before the run starts and shared read-only by
/// every user afterwards.
#[derive(Default)]
pub struct ProbeSet {
    probes: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, probe: Arc<dyn Probe>) {
        self.probes.insert(name.to_string(), probe);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Probe>> {
        match self.probes.get(name) {
            Some(p) => Ok(p.clone()),
            None => bail!("no probe registered under '{}'", name),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.probes.contains_key(name)
    }
}

/// Substitute `${NAME}` placeholders from the run variables. Unknown names
/// are left in place so the resulting request fails visibly instead of
/// silently hitting the wrong target.
pub fn expand_vars(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 3 + end]),
                }
                rest = &rest[start + 3 + end..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Built-in probe issuing an HTTP GET against a URL template. Any response
/// with status >= 400, or a transport error, counts as a failed iteration.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn execute(&self, ctx: &ProbeContext) -> ProbeOutcome {
        let url = expand_vars(&self.url, &ctx.vars);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let outcome = if status.as_u16() >= 400 {
                    ProbeOutcome::failed(format!("http status {}", status))
                } else {
                    ProbeOutcome::ok()
                };
                outcome.with_tag("status", status.as_u16().to_string())
            }
            Err(e) => ProbeOutcome::failed(format!("request failed: {}", e)),
        }
    }
}

/// Built-in probe that sleeps for a fixed duration. Useful for dry runs and
/// schedule shakeouts where no target system exists.
pub struct SleepProbe {
    duration: Duration,
}

impl SleepProbe {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Duration comes from the `SLEEP` run variable when present.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let duration = vars
            .get("SLEEP")
            .and_then(|s| parse_duration(s, "SLEEP").ok())
            .unwrap_or(Duration::from_millis(10));
        Self::new(duration)
    }
}

#[async_trait]
impl Probe for SleepProbe {
    async fn execute(&self, _ctx: &ProbeContext) -> ProbeOutcome {
        tokio::time::sleep(self.duration).await;
        ProbeOutcome::ok()
    }
}
