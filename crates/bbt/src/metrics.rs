//! Metrics collection and reporting using metrics-rs.
//!
//! Records how many functions were analyzed, why analyses were abandoned
//! and how frames were recovered, with a terminal summary under `--metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use bbt_cfg::{AnalysisError, FunctionAnalysis};
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge,
    histogram,
};
use parking_lot::RwLock;

use crate::FrameMode;

// ============================================================================
// Metric descriptions
// ============================================================================

/// Initialize metric descriptions.
///
/// Call this once at startup to register metric descriptions.
pub fn init() {
    describe_counter!(
        "bbt_functions_analyzed_total",
        Unit::Count,
        "Functions whose analysis completed"
    );
    describe_counter!(
        "bbt_analysis_abandoned_total",
        Unit::Count,
        "Function analyses abandoned, by failure kind"
    );
    describe_counter!(
        "bbt_frames_total",
        Unit::Count,
        "Backtrace frames produced, by recovery mode"
    );
    describe_gauge!(
        "bbt_backtrace_depth",
        Unit::Count,
        "Frames in the most recent backtrace"
    );
    describe_histogram!(
        "bbt_pass2_sweeps",
        Unit::Count,
        "Dataflow sweeps needed to reach a fixed point"
    );
}

// ============================================================================
// Metric recording functions
// ============================================================================

/// Record the outcome of one function analysis.
pub fn record_analysis(result: &Result<FunctionAnalysis, AnalysisError>) {
    match result {
        Ok(analysis) => {
            counter!("bbt_functions_analyzed_total").increment(1);
            #[allow(clippy::cast_precision_loss)]
            histogram!("bbt_pass2_sweeps").record(analysis.stats.sweeps as f64);
        }
        Err(err) => {
            let labels = [("kind", err.kind().as_str().to_string())];
            counter!("bbt_analysis_abandoned_total", &labels).increment(1);
        }
    }
}

/// Record one produced frame.
pub fn record_frame(mode: FrameMode) {
    let labels = [("mode", mode.as_str().to_string())];
    counter!("bbt_frames_total", &labels).increment(1);
}

/// Record the depth of a finished backtrace.
#[allow(clippy::cast_precision_loss)]
pub fn record_depth(frames: usize) {
    gauge!("bbt_backtrace_depth").set(frames as f64);
}

// ============================================================================
// In-memory recorder for the --metrics summary
// ============================================================================

/// One recorded series.
#[derive(Clone, Debug, PartialEq)]
enum Reading {
    Count(u64),
    Level(f64),
    Samples(Vec<f64>),
}

impl Reading {
    fn render(&self) -> String {
        match self {
            Self::Count(n) => n.to_string(),
            Self::Level(v) => v.to_string(),
            Self::Samples(values) => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                #[allow(clippy::cast_precision_loss)]
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                format!("count={}, min={min}, max={max}, avg={avg:.2}", values.len())
            }
        }
    }
}

/// Readings keyed by rendered metric key, kept in key order.
type Tally = RwLock<BTreeMap<String, Reading>>;

/// Handle for a single series. Registered once per key for whichever
/// metric kind asked for it.
struct Series {
    key: String,
    tally: Arc<Tally>,
}

impl Series {
    fn update(&self, empty: Reading, apply: impl FnOnce(&mut Reading)) {
        let mut tally = self.tally.write();
        apply(tally.entry(self.key.clone()).or_insert(empty));
    }

    fn shift(&self, delta: f64) {
        self.update(Reading::Level(0.0), |r| {
            if let Reading::Level(v) = r {
                *v += delta;
            }
        });
    }
}

impl CounterFn for Series {
    fn increment(&self, value: u64) {
        self.update(Reading::Count(0), |r| {
            if let Reading::Count(n) = r {
                *n += value;
            }
        });
    }

    fn absolute(&self, value: u64) {
        self.tally.write().insert(self.key.clone(), Reading::Count(value));
    }
}

impl GaugeFn for Series {
    fn increment(&self, value: f64) {
        self.shift(value);
    }

    fn decrement(&self, value: f64) {
        self.shift(-value);
    }

    fn set(&self, value: f64) {
        self.tally.write().insert(self.key.clone(), Reading::Level(value));
    }
}

impl HistogramFn for Series {
    fn record(&self, value: f64) {
        self.update(Reading::Samples(Vec::new()), |r| {
            if let Reading::Samples(values) = r {
                values.push(value);
            }
        });
    }
}

/// Recorder that keeps every series in memory until the end of the run.
#[derive(Default)]
pub struct SummaryRecorder {
    tally: Arc<Tally>,
}

impl SummaryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the global recorder. `None` if one is already set.
    pub fn install(self) -> Option<Summary> {
        let tally = Arc::clone(&self.tally);
        metrics::set_global_recorder(self).ok()?;
        Some(Summary { tally })
    }

    fn series(&self, key: &Key) -> Arc<Series> {
        Arc::new(Series {
            key: render_key(key),
            tally: Arc::clone(&self.tally),
        })
    }
}

/// `name` or `name{label=value,...}`.
fn render_key(key: &Key) -> String {
    let mut out = key.name().to_string();
    let mut labels = key.labels().peekable();
    if labels.peek().is_some() {
        out.push('{');
        for (i, label) in labels.enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}={}", label.key(), label.value());
        }
        out.push('}');
    }
    out
}

impl Recorder for SummaryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.series(key))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.series(key))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.series(key))
    }
}

/// Read side of an installed [`SummaryRecorder`].
pub struct Summary {
    tally: Arc<Tally>,
}

impl Summary {
    /// Summary lines in key order.
    fn lines(&self) -> Vec<String> {
        self.tally
            .read()
            .iter()
            .filter(|(_, reading)| !matches!(reading, Reading::Samples(v) if v.is_empty()))
            .map(|(key, reading)| format!("{key}: {}", reading.render()))
            .collect()
    }

    /// Print the collected metrics to stderr.
    pub fn print_summary(&self) {
        let lines = self.lines();
        if lines.is_empty() {
            eprintln!("No metrics collected.");
            return;
        }
        eprintln!();
        eprintln!("## Metrics");
        for line in lines {
            eprintln!("  {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;

    #[test]
    fn test_render_key() {
        assert_eq!(render_key(&Key::from_name("bbt_backtrace_depth")), "bbt_backtrace_depth");

        let key = Key::from_parts("bbt_frames_total", vec![Label::new("mode", "full")]);
        assert_eq!(render_key(&key), "bbt_frames_total{mode=full}");

        let key = Key::from_parts(
            "bbt_analysis_abandoned_total",
            vec![Label::new("kind", "structural"), Label::new("mode", "degraded")],
        );
        assert_eq!(
            render_key(&key),
            "bbt_analysis_abandoned_total{kind=structural,mode=degraded}"
        );
    }

    #[test]
    fn test_summary_lines() {
        let recorder = SummaryRecorder::new();
        let summary = Summary {
            tally: Arc::clone(&recorder.tally),
        };
        assert!(summary.lines().is_empty());

        let frames = recorder.series(&Key::from_parts(
            "bbt_frames_total",
            vec![Label::new("mode", "full")],
        ));
        CounterFn::increment(&*frames, 2);
        CounterFn::increment(&*frames, 3);

        let depth = recorder.series(&Key::from_name("bbt_backtrace_depth"));
        GaugeFn::set(&*depth, 4.0);
        GaugeFn::decrement(&*depth, 1.0);

        let sweeps = recorder.series(&Key::from_name("bbt_pass2_sweeps"));
        HistogramFn::record(&*sweeps, 1.0);
        HistogramFn::record(&*sweeps, 4.0);

        assert_eq!(
            summary.lines(),
            vec![
                "bbt_backtrace_depth: 3".to_string(),
                "bbt_frames_total{mode=full}: 5".to_string(),
                "bbt_pass2_sweeps: count=2, min=1, max=4, avg=2.50".to_string(),
            ]
        );

        CounterFn::absolute(&*frames, 1);
        assert_eq!(summary.lines()[1], "bbt_frames_total{mode=full}: 1");
    }
}
