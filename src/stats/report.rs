//! Final run snapshot: per-bucket statistics, threshold breakdown, overall
//! pass/fail. Persisted report formats (files, dashboards) consume this
//! structure; the engine itself only prints the console summary.

use serde::Serialize;
use std::collections::BTreeMap;

use super::thresholds::{evaluate_all, ThresholdResult, ThresholdSpec};
use super::{metric, Aggregator, BucketStats, Tags};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSnapshot {
    Counter {
        count: u64,
        total: f64,
    },
    Rate {
        total: u64,
        trues: u64,
        rate: f64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        max: f64,
        p50: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
    Gauge {
        last: f64,
    },
}

impl MetricSnapshot {
    fn from_bucket(bucket: &BucketStats) -> Self {
        match bucket {
            BucketStats::Counter { count, total } => MetricSnapshot::Counter {
                count: *count,
                total: *total,
            },
            BucketStats::Rate { total, trues } => MetricSnapshot::Rate {
                total: *total,
                trues: *trues,
                rate: if *total > 0 {
                    *trues as f64 / *total as f64
                } else {
                    0.0
                },
            },
            BucketStats::Trend {
                count, sum, min, max, ..
            } => {
                let count = *count;
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                let pct = |q| bucket.percentile(q).unwrap_or(0.0);
                MetricSnapshot::Trend {
                    count,
                    avg,
                    min: if count > 0 { *min } else { 0.0 },
                    max: if count > 0 { *max } else { 0.0 },
                    p50: pct(0.50),
                    p90: pct(0.90),
                    p95: pct(0.95),
                    p99: pct(0.99),
                }
            }
            BucketStats::Gauge { last } => MetricSnapshot::Gauge { last: *last },
        }
    }
}

/// One (metric, tag set) bucket in the final snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    #[serde(flatten)]
    pub stats: MetricSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub metrics: Vec<BucketReport>,
    pub thresholds: Vec<ThresholdResult>,
    /// Logical AND of every threshold result.
    pub passed: bool,
    /// Total users arrival-rate scenarios wanted but could not allocate.
    pub scheduling_deficit: f64,
}

impl RunSummary {
    pub fn build(aggregate: &Aggregator, specs: &[ThresholdSpec]) -> Self {
        let metrics = aggregate
            .buckets()
            .into_iter()
            .map(|(key, bucket)| BucketReport {
                name: key.name.clone(),
                tags: key.tags.clone(),
                stats: MetricSnapshot::from_bucket(bucket),
            })
            .collect();

        let thresholds = evaluate_all(specs, aggregate);
        let passed = thresholds.iter().all(|t| t.passed);
        let scheduling_deficit = match aggregate.get(metric::SCHEDULING_DEFICIT, &Tags::new()) {
            Some(BucketStats::Counter { total, .. }) => *total,
            _ => 0.0,
        };

        RunSummary {
            metrics,
            thresholds,
            passed,
            scheduling_deficit,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Console summary table, printed at run end.
    pub fn print(&self) {
        println!("\n--- Run Summary ---");
        if self.metrics.is_empty() {
            println!("No metrics collected.");
        }

        for bucket in &self.metrics {
            let label = if bucket.tags.is_empty() {
                bucket.name.clone()
            } else {
                let inner: Vec<String> = bucket
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v))
                    .collect();
                format!("{}{{{}}}", bucket.name, inner.join(","))
            };
            match &bucket.stats {
                MetricSnapshot::Counter { count, total } => {
                    println!("  {}: total={:.2} ({} samples)", label, total, count);
                }
                MetricSnapshot::Rate { total, trues, rate } => {
                    println!(
                        "  {}: {:.2}% ({}/{})",
                        label,
                        rate * 100.0,
                        trues,
                        total
                    );
                }
                MetricSnapshot::Trend {
                    count,
                    avg,
                    min,
                    max,
                    p50,
                    p90,
                    p95,
                    p99,
                } => {
                    println!(
                        "  {}: count={} avg={:.2} min={:.2} max={:.2} p50={:.2} p90={:.2} p95={:.2} p99={:.2}",
                        label, count, avg, min, max, p50, p90, p95, p99
                    );
                }
                MetricSnapshot::Gauge { last } => {
                    println!("  {}: {:.2}", label, last);
                }
            }
        }

        if self.scheduling_deficit > 0.0 {
            println!(
                "\nScheduling deficit: {:.0} user-slots short of the requested rate",
                self.scheduling_deficit
            );
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                match t.observed {
                    Some(v) => println!(
                        "  {} {} {} (observed: {:.2})",
                        mark, t.selector, t.expression, v
                    ),
                    None => println!("  {} {} {} (no data)", mark, t.selector, t.expression),
                }
            }
            println!(
                "\nResult: {}",
                if self.passed { "PASSED" } else { "FAILED" }
            );
        }
        println!("-------------------\n");
    }
}
