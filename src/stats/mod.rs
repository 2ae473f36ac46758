//! Tagged sample recording and online aggregation.
//!
//! One `MetricsRegistry` is constructed per run and shared by reference with
//! every component; there is no process-wide metric state. Writers record
//! into per-shard accumulators behind `parking_lot` locks and the shards are
//! merged into a single `Aggregator` at read time.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

pub mod report;
pub mod thresholds;

/// Ordered tag set. Ordering makes bucket keys deterministic.
pub type Tags = BTreeMap<String, String>;

/// Well-known metric names emitted by the engine itself.
pub mod metric {
    /// Trend: wall-clock time of one behavior iteration, in milliseconds.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Counter: iterations completed (successful or failed).
    pub const ITERATIONS: &str = "iterations";
    /// Counter: iterations whose probe reported failure.
    pub const FAILED_ITERATIONS: &str = "failed_iterations";
    /// Rate: fraction of iterations whose probe reported failure.
    pub const FAILED_RATE: &str = "failed_rate";
    /// Counter: iterations force-cancelled at stop time, mid-flight.
    pub const ITERATIONS_TRUNCATED: &str = "iterations_truncated";
    /// Counter: users an arrival-rate scenario wanted but could not allocate.
    pub const SCHEDULING_DEFICIT: &str = "scheduling_deficit";
    /// Gauge: active virtual users, sampled per scheduler tick.
    pub const VUS: &str = "vus";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

/// A single observation. Transient: folded into aggregate buckets on record,
/// never retained individually.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub kind: SampleKind,
    pub value: f64,
    pub tags: Tags,
    /// Capture instant. Aggregation is online, so only record order matters
    /// downstream; the timestamp is for streaming consumers.
    pub timestamp: Instant,
}

impl Sample {
    pub fn new(name: impl Into<String>, kind: SampleKind, value: f64, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            tags,
            timestamp: Instant::now(),
        }
    }
}

// Trend values are recorded at 1/1000 resolution so fractional milliseconds
// survive the integer histogram. Bounds cover 1µs..1h of scaled values.
const TREND_SCALE: f64 = 1000.0;
const TREND_HIGH: u64 = 3_600_000_000;

fn new_trend_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, TREND_HIGH, 3).expect("static histogram bounds")
}

/// Running statistics for one (metric, tag set) bucket.
#[derive(Debug, Clone)]
pub enum BucketStats {
    Counter {
        count: u64,
        total: f64,
    },
    Rate {
        total: u64,
        trues: u64,
    },
    Trend {
        hist: Histogram<u64>,
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
    Gauge {
        last: f64,
    },
}

impl BucketStats {
    fn new(kind: SampleKind) -> Self {
        match kind {
            SampleKind::Counter => BucketStats::Counter {
                count: 0,
                total: 0.0,
            },
            SampleKind::Rate => BucketStats::Rate { total: 0, trues: 0 },
            SampleKind::Trend => BucketStats::Trend {
                hist: new_trend_histogram(),
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            SampleKind::Gauge => BucketStats::Gauge { last: 0.0 },
        }
    }

    fn update(&mut self, value: f64) {
        match self {
            BucketStats::Counter { count, total } => {
                *count += 1;
                *total += value;
            }
            BucketStats::Rate { total, trues } => {
                *total += 1;
                if value != 0.0 {
                    *trues += 1;
                }
            }
            BucketStats::Trend {
                hist,
                count,
                sum,
                min,
                max,
            } => {
                let scaled = (value * TREND_SCALE).round().max(1.0) as u64;
                let _ = hist.record(scaled.min(TREND_HIGH));
                *count += 1;
                *sum += value;
                if value < *min {
                    *min = value;
                }
                if value > *max {
                    *max = value;
                }
            }
            BucketStats::Gauge { last } => {
                *last = value;
            }
        }
    }

    fn merge_from(&mut self, other: &BucketStats) {
        match (self, other) {
            (
                BucketStats::Counter { count, total },
                BucketStats::Counter {
                    count: c,
                    total: t,
                },
            ) => {
                *count += c;
                *total += t;
            }
            (
                BucketStats::Rate { total, trues },
                BucketStats::Rate {
                    total: t,
                    trues: s,
                },
            ) => {
                *total += t;
                *trues += s;
            }
            (
                BucketStats::Trend {
                    hist,
                    count,
                    sum,
                    min,
                    max,
                },
                BucketStats::Trend {
                    hist: h,
                    count: c,
                    sum: s,
                    min: mn,
                    max: mx,
                },
            ) => {
                let _ = hist.add(h);
                *count += c;
                *sum += s;
                if *mn < *min {
                    *min = *mn;
                }
                if *mx > *max {
                    *max = *mx;
                }
            }
            (BucketStats::Gauge { last }, BucketStats::Gauge { last: l }) => {
                // Last write across shards is ambiguous; take the other
                // shard's value in shard order, same as merging gauges by map
                // insertion would.
                *last = *l;
            }
            _ => {}
        }
    }

    pub fn kind(&self) -> SampleKind {
        match self {
            BucketStats::Counter { .. } => SampleKind::Counter,
            BucketStats::Rate { .. } => SampleKind::Rate,
            BucketStats::Trend { .. } => SampleKind::Trend,
            BucketStats::Gauge { .. } => SampleKind::Gauge,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            BucketStats::Counter { count, .. } => *count,
            BucketStats::Rate { total, .. } => *total,
            BucketStats::Trend { count, .. } => *count,
            BucketStats::Gauge { .. } => 1,
        }
    }

    /// Percentile for Trend buckets, in original (unscaled) units.
    pub fn percentile(&self, quantile: f64) -> Option<f64> {
        match self {
            BucketStats::Trend { hist, count, .. } if *count > 0 => {
                Some(hist.value_at_quantile(quantile) as f64 / TREND_SCALE)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub name: String,
    pub tags: Tags,
}

/// Reduces a sample stream into per-(metric, tag set) statistics.
///
/// Every sample updates the metric's untagged bucket plus every declared
/// tagged sub-bucket whose tag filter is a subset of the sample's tags. The
/// untagged bucket and all sub-buckets for a metric coexist, which is what
/// makes hierarchical queries (`duration` vs `duration{label:x}`) work.
#[derive(Debug, Default)]
pub struct Aggregator {
    buckets: HashMap<BucketKey, BucketStats>,
    filters: Arc<HashMap<String, Vec<Tags>>>,
}

impl Aggregator {
    pub fn new(filters: Arc<HashMap<String, Vec<Tags>>>) -> Self {
        Self {
            buckets: HashMap::new(),
            filters,
        }
    }

    pub fn add(&mut self, sample: Sample) {
        let untagged = BucketKey {
            name: sample.name.clone(),
            tags: Tags::new(),
        };
        self.buckets
            .entry(untagged)
            .or_insert_with(|| BucketStats::new(sample.kind))
            .update(sample.value);

        if let Some(filters) = self.filters.get(&sample.name) {
            for filter in filters {
                if tags_subset(filter, &sample.tags) {
                    let key = BucketKey {
                        name: sample.name.clone(),
                        tags: filter.clone(),
                    };
                    self.buckets
                        .entry(key)
                        .or_insert_with(|| BucketStats::new(sample.kind))
                        .update(sample.value);
                }
            }
        }
    }

    pub fn get(&self, name: &str, tags: &Tags) -> Option<&BucketStats> {
        self.buckets.get(&BucketKey {
            name: name.to_string(),
            tags: tags.clone(),
        })
    }

    pub fn merge_from(&mut self, other: &Aggregator) {
        for (key, stats) in &other.buckets {
            match self.buckets.get_mut(key) {
                Some(existing) => existing.merge_from(stats),
                None => {
                    self.buckets.insert(key.clone(), stats.clone());
                }
            }
        }
    }

    /// Buckets in deterministic (name, tags) order.
    pub fn buckets(&self) -> Vec<(&BucketKey, &BucketStats)> {
        let mut entries: Vec<_> = self.buckets.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// True when every (key, value) pair of `filter` appears in `tags`.
pub fn tags_subset(filter: &Tags, tags: &Tags) -> bool {
    filter.iter().all(|(k, v)| tags.get(k) == Some(v))
}

/// Concurrent-writer entry point: per-shard aggregators merged at read time.
/// Shard selection by writer id keeps a virtual user on one lock.
pub struct MetricsRegistry {
    shards: Vec<RwLock<Aggregator>>,
}

impl MetricsRegistry {
    pub fn new(num_shards: usize, filters: HashMap<String, Vec<Tags>>) -> Self {
        let filters = Arc::new(filters);
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(Aggregator::new(filters.clone())))
            .collect();
        Self { shards }
    }

    pub fn record(&self, writer_id: u64, sample: Sample) {
        let shard = (writer_id as usize) % self.shards.len();
        self.shards[shard].write().add(sample);
    }

    /// Merge all shards into a single aggregator snapshot.
    pub fn merge(&self) -> Aggregator {
        let mut merged = Aggregator::new(Arc::new(HashMap::new()));
        for shard in &self.shards {
            merged.merge_from(&shard.read());
        }
        merged
    }
}

/// Writer handle carrying pre-merged base tags (run globals, then scenario
/// statics). Call-site tags win on key collision.
#[derive(Clone)]
pub struct Recorder {
    registry: Arc<MetricsRegistry>,
    writer_id: u64,
    base_tags: Tags,
}

impl Recorder {
    pub fn new(registry: Arc<MetricsRegistry>, base_tags: Tags) -> Self {
        Self {
            registry,
            writer_id: 0,
            base_tags,
        }
    }

    /// Layer additional tags over this recorder's base; the new layer wins.
    pub fn with_tags(&self, tags: Tags) -> Recorder {
        let mut base = self.base_tags.clone();
        base.extend(tags);
        Recorder {
            registry: self.registry.clone(),
            writer_id: self.writer_id,
            base_tags: base,
        }
    }

    pub fn for_writer(&self, writer_id: u64) -> Recorder {
        Recorder {
            registry: self.registry.clone(),
            writer_id,
            base_tags: self.base_tags.clone(),
        }
    }

    fn merged(&self, call_tags: Tags) -> Tags {
        let mut tags = self.base_tags.clone();
        tags.extend(call_tags);
        tags
    }

    pub fn record(&self, name: &str, kind: SampleKind, value: f64, call_tags: Tags) {
        self.registry.record(
            self.writer_id,
            Sample::new(name, kind, value, self.merged(call_tags)),
        );
    }

    pub fn counter(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, SampleKind::Counter, value, tags);
    }

    pub fn rate(&self, name: &str, flag: bool, tags: Tags) {
        self.record(name, SampleKind::Rate, if flag { 1.0 } else { 0.0 }, tags);
    }

    pub fn trend(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, SampleKind::Trend, value, tags);
    }

    pub fn gauge(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, SampleKind::Gauge, value, tags);
    }
}

#[cfg(test)]
pub(crate) fn tag_set(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend_sample(name: &str, value: f64, tags: Tags) -> Sample {
        Sample::new(name, SampleKind::Trend, value, tags)
    }

    fn plain_aggregator() -> Aggregator {
        Aggregator::new(Arc::new(HashMap::new()))
    }

    #[test]
    fn test_counter_sums() {
        let mut agg = plain_aggregator();
        for v in [5.0, 3.0, 2.0] {
            agg.add(Sample::new("items", SampleKind::Counter, v, Tags::new()));
        }
        match agg.get("items", &Tags::new()).unwrap() {
            BucketStats::Counter { count, total } => {
                assert_eq!(*count, 3);
                assert_eq!(*total, 10.0);
            }
            other => panic!("unexpected bucket {:?}", other),
        }
    }

    #[test]
    fn test_rate_fraction() {
        let mut agg = plain_aggregator();
        for flag in [true, true, true, false] {
            agg.add(Sample::new(
                "hit",
                SampleKind::Rate,
                if flag { 1.0 } else { 0.0 },
                Tags::new(),
            ));
        }
        match agg.get("hit", &Tags::new()).unwrap() {
            BucketStats::Rate { total, trues } => {
                assert_eq!(*total, 4);
                assert_eq!(*trues, 3);
            }
            other => panic!("unexpected bucket {:?}", other),
        }
    }

    #[test]
    fn test_gauge_last_wins() {
        let mut agg = plain_aggregator();
        for v in [10.0, 25.0, 5.0] {
            agg.add(Sample::new("queue", SampleKind::Gauge, v, Tags::new()));
        }
        match agg.get("queue", &Tags::new()).unwrap() {
            BucketStats::Gauge { last } => assert_eq!(*last, 5.0),
            other => panic!("unexpected bucket {:?}", other),
        }
    }

    #[test]
    fn test_trend_stats() {
        let mut agg = plain_aggregator();
        for i in 1..=100 {
            agg.add(trend_sample("duration", i as f64, Tags::new()));
        }
        let bucket = agg.get("duration", &Tags::new()).unwrap();
        match bucket {
            BucketStats::Trend {
                count, sum, min, max, ..
            } => {
                assert_eq!(*count, 100);
                assert_eq!(*min, 1.0);
                assert_eq!(*max, 100.0);
                assert!((sum - 5050.0).abs() < 1e-9);
            }
            other => panic!("unexpected bucket {:?}", other),
        }
        let p50 = bucket.percentile(0.5).unwrap();
        assert!((49.0..=51.0).contains(&p50), "p50 was {}", p50);
        let p99 = bucket.percentile(0.99).unwrap();
        assert!((98.0..=100.5).contains(&p99), "p99 was {}", p99);
    }

    #[test]
    fn test_percentile_monotonicity() {
        let mut agg = plain_aggregator();
        for v in [3.0, 17.0, 240.0, 240.0, 999.0, 1.5, 88.0] {
            agg.add(trend_sample("duration", v, Tags::new()));
        }
        let bucket = agg.get("duration", &Tags::new()).unwrap();
        let p50 = bucket.percentile(0.50).unwrap();
        let p90 = bucket.percentile(0.90).unwrap();
        let p95 = bucket.percentile(0.95).unwrap();
        let p99 = bucket.percentile(0.99).unwrap();
        assert!(p99 >= p95 && p95 >= p90 && p90 >= p50);
    }

    #[test]
    fn test_idempotent_replay() {
        let stream: Vec<Sample> = (0..500)
            .map(|i| {
                trend_sample(
                    "duration",
                    ((i * 37) % 211) as f64 + 0.25,
                    tag_set(&[("scenario", "a")]),
                )
            })
            .collect();

        let filters: HashMap<String, Vec<Tags>> = [(
            "duration".to_string(),
            vec![tag_set(&[("scenario", "a")])],
        )]
        .into_iter()
        .collect();
        let filters = Arc::new(filters);

        let mut first = Aggregator::new(filters.clone());
        let mut second = Aggregator::new(filters);
        for s in &stream {
            first.add(s.clone());
        }
        for s in &stream {
            second.add(s.clone());
        }

        for tags in [Tags::new(), tag_set(&[("scenario", "a")])] {
            let a = first.get("duration", &tags).unwrap();
            let b = second.get("duration", &tags).unwrap();
            assert_eq!(a.count(), b.count());
            for q in [0.5, 0.9, 0.95, 0.99] {
                assert_eq!(a.percentile(q), b.percentile(q));
            }
        }
    }

    #[test]
    fn test_tag_hierarchy_partition() {
        // Untagged bucket count equals the sum over a mutually exclusive
        // partition of tagged sub-buckets.
        let filters: HashMap<String, Vec<Tags>> = [(
            "duration".to_string(),
            vec![
                tag_set(&[("scenario", "a")]),
                tag_set(&[("scenario", "b")]),
            ],
        )]
        .into_iter()
        .collect();
        let mut agg = Aggregator::new(Arc::new(filters));

        for i in 0..30 {
            agg.add(trend_sample("duration", i as f64 + 1.0, tag_set(&[("scenario", "a")])));
        }
        for i in 0..70 {
            agg.add(trend_sample("duration", i as f64 + 1.0, tag_set(&[("scenario", "b")])));
        }

        let total = agg.get("duration", &Tags::new()).unwrap().count();
        let a = agg.get("duration", &tag_set(&[("scenario", "a")])).unwrap().count();
        let b = agg.get("duration", &tag_set(&[("scenario", "b")])).unwrap().count();
        assert_eq!(total, 100);
        assert_eq!(a + b, total);
    }

    #[test]
    fn test_filter_matches_subset_of_sample_tags() {
        let filters: HashMap<String, Vec<Tags>> = [(
            "duration".to_string(),
            vec![tag_set(&[("behavior", "browse")])],
        )]
        .into_iter()
        .collect();
        let mut agg = Aggregator::new(Arc::new(filters));

        // Sample carries more tags than the filter; subset match applies.
        agg.add(trend_sample(
            "duration",
            12.0,
            tag_set(&[("behavior", "browse"), ("scenario", "a")]),
        ));
        // Different behavior does not match the filter.
        agg.add(trend_sample(
            "duration",
            40.0,
            tag_set(&[("behavior", "checkout"), ("scenario", "a")]),
        ));

        assert_eq!(agg.get("duration", &Tags::new()).unwrap().count(), 2);
        let sub = agg
            .get("duration", &tag_set(&[("behavior", "browse")]))
            .unwrap();
        assert_eq!(sub.count(), 1);
    }

    #[test]
    fn test_registry_merges_shards() {
        let registry = MetricsRegistry::new(4, HashMap::new());
        for writer in 0..8u64 {
            registry.record(
                writer,
                Sample::new("iterations", SampleKind::Counter, 1.0, Tags::new()),
            );
        }
        let merged = registry.merge();
        match merged.get("iterations", &Tags::new()).unwrap() {
            BucketStats::Counter { count, total } => {
                assert_eq!(*count, 8);
                assert_eq!(*total, 8.0);
            }
            other => panic!("unexpected bucket {:?}", other),
        }
    }

    #[test]
    fn test_recorder_tag_precedence() {
        let registry = Arc::new(MetricsRegistry::new(
            1,
            [(
                "duration".to_string(),
                vec![tag_set(&[("env", "call"), ("scenario", "s")])],
            )]
            .into_iter()
            .collect::<HashMap<_, _>>(),
        ));

        // global -> scenario -> call-site, later layer wins per key
        let run = Recorder::new(registry.clone(), tag_set(&[("env", "global"), ("region", "eu")]));
        let scenario = run.with_tags(tag_set(&[("scenario", "s")]));
        scenario.trend("duration", 5.0, tag_set(&[("env", "call")]));

        let merged = registry.merge();
        let tagged = merged
            .get("duration", &tag_set(&[("env", "call"), ("scenario", "s")]))
            .expect("call-site tag should have overridden the global value");
        assert_eq!(tagged.count(), 1);
    }
}
