//! CSV persistence for full evaluations and run summaries.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use planact_core::{
    FullEvaluationTable, PlanActError, Result, ResultWriter, RunSummaryRow, TaskMetrics,
};
use serde::Serialize;

const BREAKDOWN_TASKS: [&str; 5] = [
    "planning",
    "acting_full",
    "acting_causal",
    "acting_acting",
    "acting_planning",
];

fn csv_error(e: csv::Error) -> PlanActError {
    PlanActError::Serialization(e.to_string())
}

fn metric_fields(metrics: &TaskMetrics) -> [String; 3] {
    [
        metrics.loss.to_string(),
        metrics.accuracy.to_string(),
        metrics.perplexity.to_string(),
    ]
}

fn optional_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// JSON list in one CSV cell. Non-finite values become `null`.
fn json_list<T: Serialize>(values: impl IntoIterator<Item = T>) -> Result<String> {
    let values: Vec<T> = values.into_iter().collect();
    serde_json::to_string(&values).map_err(|e| PlanActError::Serialization(e.to_string()))
}

fn metric_lists(history: &[TaskMetrics]) -> Result<[String; 3]> {
    Ok([
        json_list(history.iter().map(|m| m.loss))?,
        json_list(history.iter().map(|m| m.accuracy))?,
        json_list(history.iter().map(|m| m.perplexity))?,
    ])
}

fn full_evaluation_header() -> Vec<String> {
    let mut header: Vec<String> = [
        "setting",
        "acting_width",
        "first_acting_idx",
        "last_acting_idx",
        "top_k",
        "loss",
        "acc",
        "pplx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for task in BREAKDOWN_TASKS {
        for metric in ["loss", "acc", "pplx"] {
            header.push(format!("{metric}_{task}"));
        }
    }
    header
}

const SUMMARY_HEADER: [&str; 41] = [
    "run_name",
    "seed",
    "num_params",
    "plan_act",
    "planning_divider",
    "acting_divider",
    "top_k",
    "steps",
    "tokens_seen",
    "epoch",
    "train_seconds",
    "val_loss_causal",
    "val_acc_causal",
    "val_pplx_causal",
    "val_loss_planning",
    "val_loss_acting",
    "max_steps",
    "max_epochs",
    "max_tokens",
    "max_time_seconds",
    "train_loss_history",
    "train_acc_history",
    "train_pplx_history",
    "val_loss_causal_history",
    "val_acc_causal_history",
    "val_pplx_causal_history",
    "val_loss_planning_history",
    "val_acc_planning_history",
    "val_pplx_planning_history",
    "val_loss_acting_history",
    "val_acc_acting_history",
    "val_pplx_acting_history",
    "grad_norm_history",
    "cumulative_time_history",
    "tokens_seen_history",
    "epoch_history",
    "batch_size_history",
    "seq_length_history",
    "learning_rate_history",
    "weight_decay_history",
    "full_evaluation_file",
];

/// Writes `<dir>/full_evaluations/<run_name>.csv` and appends summaries to
/// a single log file.
#[derive(Debug, Clone)]
pub struct CsvResultWriter {
    dir: PathBuf,
    logfile: PathBuf,
    append: bool,
    summary_started: bool,
}

impl CsvResultWriter {
    /// Write full evaluations below `dir` and summaries to `logfile`.
    ///
    /// Without [`with_append`](Self::with_append) the log file is truncated
    /// by the first summary this writer produces.
    pub fn new(dir: impl AsRef<Path>, logfile: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            logfile: logfile.as_ref().to_path_buf(),
            append: false,
            summary_started: false,
        }
    }

    /// Keep existing summary rows.
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Where the full evaluation of `run_name` is written.
    pub fn full_evaluation_path(&self, run_name: &str) -> PathBuf {
        self.dir.join("full_evaluations").join(format!("{run_name}.csv"))
    }

    /// Summary log path.
    pub fn logfile(&self) -> &Path {
        &self.logfile
    }

    fn open_logfile(&mut self) -> Result<(File, bool)> {
        if let Some(parent) = self.logfile.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let keep = self.summary_started || self.append;
        let write_header = !keep || !self.logfile.exists();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(keep)
            .truncate(!keep)
            .open(&self.logfile)?;
        self.summary_started = true;
        Ok((file, write_header))
    }
}

impl ResultWriter for CsvResultWriter {
    fn write_full_evaluation(&mut self, run_name: &str, table: &FullEvaluationTable) -> Result<()> {
        let path = self.full_evaluation_path(run_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        writer
            .write_record(full_evaluation_header())
            .map_err(csv_error)?;

        let empty = || String::new();
        let mut causal = vec!["causal".to_string(), empty(), empty(), empty(), empty()];
        causal.extend(metric_fields(&table.causal));
        causal.extend(std::iter::repeat_with(empty).take(3 * BREAKDOWN_TASKS.len()));
        writer.write_record(&causal).map_err(csv_error)?;

        for row in &table.rows {
            let b = &row.breakdown;
            let mut record = vec![
            format!("({}, {})", row.first_acting_idx, row.last_acting_idx),
            row.acting_width.to_string(),
            row.first_acting_idx.to_string(),
            row.last_acting_idx.to_string(),
            row.top_k.to_string(),
            empty(),
            empty(),
            empty(),
            ];
            for metrics in [
            &b.planning,
            &b.acting,
            &b.acting_causal,
            &b.acting_acting,
            &b.acting_planning,
            ] {
            record.extend(metric_fields(metrics));
            }
            writer.write_record(&record).map_err(csv_error)?;
        }
        writer.flush()?;
        tracing::info!(path = %path.display(), rows = table.rows.len() + 1, "Wrote full evaluation");
        Ok(())
    }

    fn write_run_summary(&mut self, row: &RunSummaryRow) -> Result<()> {
        let (file, write_header) = self.open_logfile()?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(SUMMARY_HEADER).map_err(csv_error)?;
        }
        let [loss, acc, pplx] = metric_fields(&row.causal);
        let limits = &row.limits;
        let history = &row.history;
        let mut record = vec![
            row.run_name.clone(),
            row.seed.to_string(),
            row.num_params.to_string(),
            row.plan_act.to_string(),
            row.planning_divider.to_string(),
            row.acting_divider.to_string(),
            row.top_k.to_string(),
            row.steps.to_string(),
            row.tokens_seen.to_string(),
            row.epoch.to_string(),
            row.train_seconds.to_string(),
            loss,
            acc,
            pplx,
            row.planning_loss.to_string(),
            row.acting_loss.to_string(),
            optional_field(limits.max_steps),
            optional_field(limits.max_epochs),
            optional_field(limits.max_tokens),
            optional_field(limits.max_time_seconds),
        ];
        for metrics in [
            &history.train,
            &history.val_causal,
            &history.val_planning,
            &history.val_acting,
        ] {
            record.extend(metric_lists(metrics)?);
        }
        record.extend([
            json_list(&history.grad_norm)?,
            json_list(&history.cumulative_time)?,
            json_list(&history.tokens_seen)?,
            json_list(&history.epoch)?,
            json_list(&history.batch_size)?,
            json_list(&history.seq_length)?,
            json_list(&history.learning_rate)?,
            json_list(&history.weight_decay)?,
            optional_field(row.full_evaluation_file.as_deref()),
        ]);
        writer.write_record(&record).map_err(csv_error)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planact_core::{ActingBreakdown, FullEvalRow, RunTrajectory, StopConfig};

    fn summary(name: &str) -> RunSummaryRow {
        RunSummaryRow {
            run_name: name.to_string(),
            seed: 1,
            num_params: 1000,
            plan_act: true,
            planning_divider: 2.0,
            acting_divider: 1.0,
            top_k: 5,
            steps: 20,
            tokens_seen: 4096,
            epoch: 0.5,
            train_seconds: 1.25,
            causal: TaskMetrics::new(2.0, 0.25),
            planning_loss: 3.0,
            acting_loss: 2.5,
            limits: StopConfig {
                max_tokens: Some(4096),
                ..Default::default()
            },
            history: RunTrajectory::default(),
            full_evaluation_file: None,
        }
    }

    fn read(path: &Path) -> Vec<csv::StringRecord> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap()
            .records()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_full_evaluation_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::new(dir.path(), dir.path().join("results.csv"));
        let metrics = TaskMetrics::new(1.0, 0.5);
        let breakdown = ActingBreakdown {
            planning: metrics,
            acting: metrics,
            acting_causal: metrics,
            acting_acting: metrics,
            acting_planning: metrics,
        };
        let table = FullEvaluationTable {
            length: 32,
            causal: TaskMetrics::new(0.5, 0.75),
            rows: vec![
                FullEvalRow {
                    acting_width: 1,
                    first_acting_idx: 12,
                    last_acting_idx: 13,
                    top_k: 1,
                    breakdown,
                },
                FullEvalRow {
                    acting_width: 1,
                    first_acting_idx: 12,
                    last_acting_idx: 13,
                    top_k: 2,
                    breakdown,
                },
            ],
        };
        writer.write_full_evaluation("run", &table).unwrap();

        let records = read(&writer.full_evaluation_path("run"));
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].len(), 8 + 15);
        assert_eq!(&records[0][8], "loss_planning");
        assert_eq!(&records[1][0], "causal");
        assert_eq!(&records[1][5], "0.5");
        assert_eq!(&records[1][8], "");
        assert_eq!(&records[2][0], "(12, 13)");
        assert_eq!(&records[3][4], "2");
        assert_eq!(&records[3][8], "1");
    }

    #[test]
    fn test_summary_header_once_and_truncates_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("results.csv");
        std::fs::write(&logfile, "stale\n").unwrap();

        let mut writer = CsvResultWriter::new(dir.path(), &logfile);
        writer.write_run_summary(&summary("a")).unwrap();
        writer.write_run_summary(&summary("b")).unwrap();

        let records = read(&logfile);
        assert_eq!(records.len(), 3);
        assert_eq!(&records[0][0], "run_name");
        assert_eq!(&records[1][0], "a");
        assert_eq!(&records[2][0], "b");
    }

    #[test]
    fn test_summary_append_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("results.csv");
        CsvResultWriter::new(dir.path(), &logfile)
            .write_run_summary(&summary("a"))
            .unwrap();
        CsvResultWriter::new(dir.path(), &logfile)
            .with_append(true)
            .write_run_summary(&summary("b"))
            .unwrap();

        let records = read(&logfile);
        assert_eq!(records.len(), 3);
        assert_eq!(&records[2][0], "b");
        assert_eq!(&records[2][3], "true");
    }

    #[test]
    fn test_summary_history_columns() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("results.csv");
        let mut row = summary("hist");
        row.limits.max_epochs = Some(0.5);
        row.history = RunTrajectory {
            train: vec![TaskMetrics::new(f64::NAN, 0.0), TaskMetrics::new(3.0, 0.5)],
            tokens_seen: vec![128, 1280],
            seq_length: vec![32, 64],
            learning_rate: vec![0.001, 0.002],
            ..Default::default()
        };
        let mut writer = CsvResultWriter::new(dir.path(), &logfile);
        let row = row.with_full_evaluation_file(
            writer.full_evaluation_path("hist").display().to_string(),
        );
        writer.write_run_summary(&row).unwrap();

        let records = read(&logfile);
        assert_eq!(records[0].len(), SUMMARY_HEADER.len());
        assert_eq!(records[1].len(), SUMMARY_HEADER.len());
        let column = |name: &str| {
            let index = records[0].iter().position(|h| h == name).unwrap();
            records[1][index].to_string()
        };
        assert_eq!(column("max_tokens"), "4096");
        assert_eq!(column("max_epochs"), "0.5");
        assert_eq!(column("max_steps"), "");
        assert_eq!(column("train_loss_history"), "[null,3.0]");
        assert_eq!(column("tokens_seen_history"), "[128,1280]");
        assert_eq!(column("seq_length_history"), "[32,64]");
        assert_eq!(column("learning_rate_history"), "[0.001,0.002]");
        assert_eq!(column("grad_norm_history"), "[]");
        assert!(column("full_evaluation_file").ends_with("hist.csv"));

        let train_loss: Vec<Option<f64>> = serde_json::from_str(&column("train_loss_history")).unwrap();
        assert_eq!(train_loss, vec![None, Some(3.0)]);
    }
}
