//! Telemetry sinks for evaluation events.
//!
//! - [`LoggingSink`] - structured `tracing` events
//! - [`MetricsJsonSink`] - JSONL metrics file, one object per event
//! - [`CompositeSink`] - fans events out to several sinks
//!
//! Sinks only observe. A failing sink never aborts training; write errors
//! are logged and dropped.

use planact_core::{MetricMap, TelemetrySink};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Logs the headline numbers of every evaluation event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl LoggingSink {
    /// Create a new logging sink.
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySink for LoggingSink {
    fn on_run_start(&mut self, run_name: &str) {
        tracing::info!(run = run_name, "Run started");
    }

    fn emit(&mut self, step: usize, metrics: &MetricMap) {
        let get = |key: &str| metrics.get(key).copied().unwrap_or(f64::NAN);
        tracing::info!(
            step,
            train_loss = get("train/loss"),
            val_loss = get("val/loss/causal"),
            val_pplx = get("val/pplx/causal"),
            planning_loss = get("val/loss/planning"),
            acting_loss = get("val/loss/acting"),
            tokens_seen = get("tokens_seen"),
            sequence_length = get("sequence_length"),
            "Evaluation"
        );
    }

    fn on_run_end(&mut self) {
        tracing::info!("Run finished");
    }
}

/// JSONL metrics sink.
///
/// ```json
/// {"event": "run_start", "run_name": "depth_1_width_64_seed_0", "timestamp": "2026-01-01T12:00:00Z"}
/// {"step": 10, "metrics": {"train/loss": 5.1, "val/loss/causal": 5.3}, "timestamp": "2026-01-01T12:00:04Z"}
/// ```
pub struct MetricsJsonSink {
    writer: BufWriter<File>,
    path: PathBuf,
    run_name: Option<String>,
    config: Option<serde_json::Value>,
}

impl MetricsJsonSink {
    /// Create (or truncate) the JSONL file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::open(path, false)
    }

    /// Append to the JSONL file at `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::open(path, true)
    }

    fn open(path: impl AsRef<Path>, append: bool) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            run_name: None,
            config: None,
        })
    }

    /// Fix the run name instead of taking it from `on_run_start`.
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Record the run configuration in the start event.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Path of the metrics file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, entry: serde_json::Value) {
        let written = serde_json::to_string(&entry)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.writer, "{line}"));
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "Dropping metrics entry");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush metrics");
        }
    }
}

impl TelemetrySink for MetricsJsonSink {
    fn on_run_start(&mut self, run_name: &str) {
        let name = self.run_name.get_or_insert_with(|| run_name.to_string()).clone();
        let mut entry = serde_json::json!({
            "event": "run_start",
            "run_name": name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(ref config) = self.config {
            entry["config"] = config.clone();
        }
        self.write_entry(entry);
        self.flush();
    }

    fn emit(&mut self, step: usize, metrics: &MetricMap) {
        let mut entry = serde_json::json!({
            "step": step,
            "metrics": metrics,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(ref name) = self.run_name {
            entry["run_name"] = serde_json::json!(name);
        }
        self.write_entry(entry);
        self.flush();
    }

    fn on_run_end(&mut self) {
        self.write_entry(serde_json::json!({
            "event": "run_end",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        self.flush();
    }
}

/// Forwards every event to each contained sink in order.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl CompositeSink {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn add(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for CompositeSink {
    fn on_run_start(&mut self, run_name: &str) {
        for sink in &mut self.sinks {
            sink.on_run_start(run_name);
        }
    }

    fn emit(&mut self, step: usize, metrics: &MetricMap) {
        for sink in &mut self.sinks {
            sink.emit(step, metrics);
        }
    }

    fn on_run_end(&mut self) {
        for sink in &mut self.sinks {
            sink.on_run_end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn metrics() -> MetricMap {
        let mut map = MetricMap::new();
        map.insert("train/loss".into(), 4.5);
        map.insert("val/loss/causal".into(), 4.75);
        map
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_jsonl_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("metrics.jsonl");
        let mut sink = MetricsJsonSink::new(&path)
            .unwrap()
            .with_config(serde_json::json!({"seed": 3}));
        sink.on_run_start("depth_1_width_8_seed_3");
        sink.emit(10, &metrics());
        sink.on_run_end();
        drop(sink);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "run_start");
        assert_eq!(lines[0]["run_name"], "depth_1_width_8_seed_3");
        assert_eq!(lines[0]["config"]["seed"], 3);
        assert_eq!(lines[1]["step"], 10);
        assert_eq!(lines[1]["metrics"]["train/loss"], 4.5);
        assert!(lines[1]["timestamp"].as_str().is_some());
        assert_eq!(lines[2]["event"], "run_end");
    }

    #[test]
    fn test_jsonl_append_keeps_previous_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        {
            let mut sink = MetricsJsonSink::new(&path).unwrap();
            sink.emit(1, &metrics());
        }
        {
            let mut sink = MetricsJsonSink::append(&path).unwrap();
            sink.emit(2, &metrics());
        }
        let steps: Vec<_> = read_lines(&path).iter().map(|l| l["step"].clone()).collect();
        assert_eq!(steps, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    struct Recorder(Rc<RefCell<Vec<usize>>>);

    impl TelemetrySink for Recorder {
        fn emit(&mut self, step: usize, _metrics: &MetricMap) {
            self.0.borrow_mut().push(step);
        }
    }

    #[test]
    fn test_composite_forwards_to_all() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut composite = CompositeSink::new();
        assert!(composite.is_empty());
        composite.add(Box::new(Recorder(seen.clone())));
        composite.add(Box::new(LoggingSink::new()));
        composite.add(Box::new(Recorder(seen.clone())));
        assert_eq!(composite.len(), 3);

        composite.on_run_start("run");
        composite.emit(7, &metrics());
        composite.on_run_end();
        assert_eq!(*seen.borrow(), vec![7, 7]);
    }
}
