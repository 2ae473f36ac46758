//! Pass/fail criteria over aggregated metrics.
//!
//! A threshold names a metric (optionally narrowed by a tag-equality filter,
//! `duration{scenario:browse}`) and a comparison over one of its statistics,
//! e.g. `p(95)<1000`, `rate<0.05`, `count>100`. Comparisons use strict
//! semantics exactly as written. All specs are independent; the run passes
//! only if every spec does.

use anyhow::{bail, Result};
use serde::Serialize;

use super::{Aggregator, BucketStats, Tags};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Count,
    Rate,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Op {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Op::Lt => left < right,
            Op::Le => left <= right,
            Op::Gt => left > right,
            Op::Ge => left >= right,
            Op::Eq => (left - right).abs() < f64::EPSILON,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
        }
    }
}

/// One parsed pass/fail criterion.
#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    metric: String,
    filter: Tags,
    stat: Stat,
    op: Op,
    bound: f64,
}

/// Outcome of evaluating one spec, kept per-spec so operators can see which
/// SLA was violated, not just an overall boolean.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub selector: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

impl ThresholdSpec {
    /// Parse a metric selector (`name` or `name{key:value,...}`) and a
    /// comparison expression (`p(95)<1000`). Whitespace is insignificant.
    pub fn parse(selector: &str, expression: &str) -> Result<Self> {
        let (metric, filter) = parse_selector(selector)?;
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();

        let (op_at, op, op_len) = find_operator(&compact)?;
        let stat = parse_stat(&compact[..op_at])?;
        let bound_str = &compact[op_at + op_len..];
        let bound: f64 = bound_str
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid threshold bound '{}'", bound_str))?;
        if !bound.is_finite() {
            bail!("threshold bound must be finite");
        }

        Ok(Self {
            metric,
            filter,
            stat,
            op,
            bound,
        })
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn filter(&self) -> &Tags {
        &self.filter
    }

    pub fn selector(&self) -> String {
        if self.filter.is_empty() {
            self.metric.clone()
        } else {
            let inner: Vec<String> = self
                .filter
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect();
            format!("{}{{{}}}", self.metric, inner.join(","))
        }
    }

    pub fn expression(&self) -> String {
        let stat = match self.stat {
            Stat::Percentile(q) => format!("p({})", q * 100.0),
            Stat::Avg => "avg".to_string(),
            Stat::Min => "min".to_string(),
            Stat::Max => "max".to_string(),
            Stat::Count => "count".to_string(),
            Stat::Rate => "rate".to_string(),
            Stat::Value => "value".to_string(),
        };
        format!("{}{}{}", stat, self.op.symbol(), self.bound)
    }

    /// Resolve the matching bucket and apply the comparison. A metric with no
    /// recorded data fails: an absent bucket cannot demonstrate an SLA.
    pub fn evaluate(&self, aggregate: &Aggregator) -> ThresholdResult {
        let observed = aggregate
            .get(&self.metric, &self.filter)
            .and_then(|bucket| stat_value(bucket, self.stat));
        let passed = observed.map(|v| self.op.apply(v, self.bound)).unwrap_or(false);
        ThresholdResult {
            selector: self.selector(),
            expression: self.expression(),
            observed,
            passed,
        }
    }
}

/// Evaluate every spec; overall status is the AND of all results.
pub fn evaluate_all(specs: &[ThresholdSpec], aggregate: &Aggregator) -> Vec<ThresholdResult> {
    specs.iter().map(|s| s.evaluate(aggregate)).collect()
}

fn parse_selector(selector: &str) -> Result<(String, Tags)> {
    let selector = selector.trim();
    let Some(open) = selector.find('{') else {
        if selector.is_empty() {
            bail!("empty metric selector");
        }
        return Ok((selector.to_string(), Tags::new()));
    };
    if !selector.ends_with('}') {
        bail!("unterminated tag filter in selector '{}'", selector);
    }
    let metric = selector[..open].trim();
    if metric.is_empty() {
        bail!("empty metric name in selector '{}'", selector);
    }
    let mut filter = Tags::new();
    let inner = &selector[open + 1..selector.len() - 1];
    for pair in inner.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once(':') else {
            bail!("tag filter '{}' is not key:value", pair);
        };
        filter.insert(key.trim().to_string(), value.trim().to_string());
    }
    if filter.is_empty() {
        bail!("empty tag filter in selector '{}'", selector);
    }
    Ok((metric.to_string(), filter))
}

fn find_operator(expr: &str) -> Result<(usize, Op, usize)> {
    for (sym, op) in [("<=", Op::Le), (">=", Op::Ge), ("==", Op::Eq)] {
        if let Some(at) = expr.find(sym) {
            return Ok((at, op, 2));
        }
    }
    for (sym, op) in [("<", Op::Lt), (">", Op::Gt)] {
        if let Some(at) = expr.find(sym) {
            return Ok((at, op, 1));
        }
    }
    bail!("no comparison operator in '{}'", expr)
}

fn parse_stat(token: &str) -> Result<Stat> {
    match token {
        "avg" => return Ok(Stat::Avg),
        "min" => return Ok(Stat::Min),
        "max" => return Ok(Stat::Max),
        "count" => return Ok(Stat::Count),
        "rate" => return Ok(Stat::Rate),
        "value" => return Ok(Stat::Value),
        _ => {}
    }
    // p(95) or the bare p95 form
    let digits = if let Some(inner) = token.strip_prefix("p(").and_then(|t| t.strip_suffix(')')) {
        inner
    } else if let Some(inner) = token.strip_prefix('p') {
        inner
    } else {
        bail!("unknown statistic '{}'", token);
    };
    let pct: f64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid percentile '{}'", token))?;
    if !(0.0..=100.0).contains(&pct) {
        bail!("percentile out of range in '{}'", token);
    }
    Ok(Stat::Percentile(pct / 100.0))
}

/// The requested statistic for a bucket, None when the statistic does not
/// apply to the bucket's kind.
pub fn stat_value(bucket: &BucketStats, stat: Stat) -> Option<f64> {
    match (bucket, stat) {
        (BucketStats::Counter { total, .. }, Stat::Count | Stat::Value) => Some(*total),
        (BucketStats::Rate { total, trues }, Stat::Rate) => {
            if *total > 0 {
                Some(*trues as f64 / *total as f64)
            } else {
                None
            }
        }
        (BucketStats::Rate { total, .. }, Stat::Count) => Some(*total as f64),
        (bucket @ BucketStats::Trend { .. }, Stat::Percentile(q)) => bucket.percentile(q),
        (BucketStats::Trend { count, sum, .. }, Stat::Avg) => {
            if *count > 0 {
                Some(sum / *count as f64)
            } else {
                None
            }
        }
        (BucketStats::Trend { min, count, .. }, Stat::Min) if *count > 0 => Some(*min),
        (BucketStats::Trend { max, count, .. }, Stat::Max) if *count > 0 => Some(*max),
        (BucketStats::Trend { count, .. }, Stat::Count) => Some(*count as f64),
        (BucketStats::Gauge { last }, Stat::Value) => Some(*last),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{tag_set, Sample, SampleKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn aggregator_with(samples: Vec<Sample>, filters: HashMap<String, Vec<Tags>>) -> Aggregator {
        let mut agg = Aggregator::new(Arc::new(filters));
        for s in samples {
            agg.add(s);
        }
        agg
    }

    fn trend(name: &str, value: f64, tags: Tags) -> Sample {
        Sample::new(name, SampleKind::Trend, value, tags)
    }

    #[test]
    fn test_parse_percentile_forms() {
        let a = ThresholdSpec::parse("duration", "p(95)<1000").unwrap();
        let b = ThresholdSpec::parse("duration", "p95 < 1000").unwrap();
        assert_eq!(a.stat, Stat::Percentile(0.95));
        assert_eq!(a.stat, b.stat);
        assert_eq!(a.op, Op::Lt);
        assert_eq!(a.bound, 1000.0);
    }

    #[test]
    fn test_parse_selector_with_filter() {
        let spec = ThresholdSpec::parse("duration{scenario:browse, behavior:list}", "avg<=200")
            .unwrap();
        assert_eq!(spec.metric(), "duration");
        assert_eq!(
            spec.filter(),
            &tag_set(&[("scenario", "browse"), ("behavior", "list")])
        );
        assert_eq!(spec.op, Op::Le);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ThresholdSpec::parse("duration", "pfff(95)<100").is_err());
        assert!(ThresholdSpec::parse("duration", "p(95)100").is_err());
        assert!(ThresholdSpec::parse("duration", "p(95)<abc").is_err());
        assert!(ThresholdSpec::parse("duration", "p(150)<100").is_err());
        assert!(ThresholdSpec::parse("duration{", "avg<1").is_err());
        assert!(ThresholdSpec::parse("duration{scenario}", "avg<1").is_err());
        assert!(ThresholdSpec::parse("", "avg<1").is_err());
    }

    #[test]
    fn test_strict_inequality_at_boundary() {
        // p95 exactly 999 -> p(95)<1000 passes
        let agg = aggregator_with(
            (0..100).map(|_| trend("duration", 999.0, Tags::new())).collect(),
            HashMap::new(),
        );
        let spec = ThresholdSpec::parse("duration", "p(95)<1000").unwrap();
        assert!(spec.evaluate(&agg).passed);

        // p95 exactly 1000 -> same expression fails
        let agg = aggregator_with(
            (0..100).map(|_| trend("duration", 1000.0, Tags::new())).collect(),
            HashMap::new(),
        );
        let result = spec.evaluate(&agg);
        assert!(!result.passed, "observed {:?}", result.observed);
    }

    #[test]
    fn test_rate_threshold() {
        let mut samples = Vec::new();
        for i in 0..100 {
            samples.push(Sample::new(
                "failed_rate",
                SampleKind::Rate,
                if i < 3 { 1.0 } else { 0.0 },
                Tags::new(),
            ));
        }
        let agg = aggregator_with(samples, HashMap::new());
        assert!(ThresholdSpec::parse("failed_rate", "rate<0.05")
            .unwrap()
            .evaluate(&agg)
            .passed);
        assert!(!ThresholdSpec::parse("failed_rate", "rate<0.03")
            .unwrap()
            .evaluate(&agg)
            .passed);
    }

    #[test]
    fn test_counter_threshold() {
        let samples = (0..150)
            .map(|_| Sample::new("iterations", SampleKind::Counter, 1.0, Tags::new()))
            .collect();
        let agg = aggregator_with(samples, HashMap::new());
        assert!(ThresholdSpec::parse("iterations", "count>100")
            .unwrap()
            .evaluate(&agg)
            .passed);
        assert!(!ThresholdSpec::parse("iterations", "count>200")
            .unwrap()
            .evaluate(&agg)
            .passed);
    }

    #[test]
    fn test_filtered_threshold_resolves_sub_bucket() {
        let filters: HashMap<String, Vec<Tags>> = [(
            "duration".to_string(),
            vec![tag_set(&[("scenario", "slow")])],
        )]
        .into_iter()
        .collect();
        let mut samples = Vec::new();
        for _ in 0..50 {
            samples.push(trend("duration", 10.0, tag_set(&[("scenario", "fast")])));
            samples.push(trend("duration", 500.0, tag_set(&[("scenario", "slow")])));
        }
        let agg = aggregator_with(samples, filters);

        // The untagged bucket mixes both; the filtered one sees only "slow".
        let all = ThresholdSpec::parse("duration", "max>=500").unwrap();
        assert!(all.evaluate(&agg).passed);
        let slow = ThresholdSpec::parse("duration{scenario:slow}", "min>=500").unwrap();
        assert!(slow.evaluate(&agg).passed);
    }

    #[test]
    fn test_missing_metric_fails() {
        let agg = aggregator_with(Vec::new(), HashMap::new());
        let result = ThresholdSpec::parse("nothing", "count>0")
            .unwrap()
            .evaluate(&agg);
        assert!(!result.passed);
        assert!(result.observed.is_none());
    }

    #[test]
    fn test_evaluate_all_is_independent() {
        let samples = (0..10)
            .map(|_| trend("duration", 50.0, Tags::new()))
            .collect();
        let agg = aggregator_with(samples, HashMap::new());
        let specs = vec![
            ThresholdSpec::parse("duration", "avg<100").unwrap(),
            ThresholdSpec::parse("duration", "avg<10").unwrap(),
            ThresholdSpec::parse("duration", "count==10").unwrap(),
        ];
        let results = evaluate_all(&specs, &agg);
        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, true]);
    }
}
