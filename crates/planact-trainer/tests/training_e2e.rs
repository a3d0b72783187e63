//! End-to-end training integration tests.
//!
//! These tests drive the controller against the CPU reference model:
//! - Causal and plan-act microbatches through the optimizer
//! - Stop conditions and the forced final evaluation
//! - Sequence-length growth
//! - Full evaluation grid and result persistence
//! - Telemetry events

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use planact_core::{MetricMap, ResultWriter, RunConfig, TelemetrySink};
use planact_data::Corpus;
use planact_models::{ReferenceLm, ReferenceLmConfig};
use planact_trainer::{CsvResultWriter, StepOutcome, StopReason, TrainingController};

const VOCAB: u32 = 40;

fn corpus(train_len: usize) -> Arc<Corpus> {
    let train: Vec<u32> = (0..train_len)
        .map(|i| ((i * 13 + i / 7) % VOCAB as usize) as u32)
        .collect();
    let eval: Vec<u32> = (0..2_000)
        .map(|i| ((i * 11 + i / 5) % VOCAB as usize) as u32)
        .collect();
    Arc::new(Corpus::new(train, eval).unwrap())
}

fn model() -> ReferenceLm {
    ReferenceLm::new(
        ReferenceLmConfig::new(VOCAB as usize + 4)
            .with_width(16)
            .with_seed(7),
    )
    .unwrap()
}

/// Length 32 at batch size 4, growing to 64 at batch size 2.
fn base_config() -> RunConfig {
    let mut config = RunConfig {
        vocab_size: VOCAB,
        seed: 11,
        ..Default::default()
    };
    config.sequence.initial_length = 32;
    config.sequence.max_length = 64;
    config.memory.token_budget = Some(128);
    config.eval.eval_token_budget = 640;
    config
}

#[test]
fn test_single_causal_iteration() {
    let mut config = base_config();
    config.stop.max_steps = Some(100);
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();
    assert_eq!(controller.state().current_sequence_length, 32);
    assert_eq!(controller.state().current_batchsize, 4);

    assert_eq!(controller.step().unwrap(), StepOutcome::Continue);

    let stats = controller.last_train_stats().unwrap();
    assert!(stats.loss.is_finite());
    assert!(stats.loss >= 0.0);
    assert!(stats.planning_loss.is_none());
    assert_eq!(controller.state().tokens_seen, 128);
    assert!((controller.state().epoch_fraction - 128.0 / 10_000.0).abs() < 1e-12);
}

#[test]
fn test_plan_act_run_stops_on_tokens_with_final_eval() {
    let mut config = base_config();
    config.stop.max_tokens = Some(128 * 6);
    config.plan_act.enabled = true;
    config.plan_act.planning_divider = 2.0;
    config.plan_act.acting_divider = 4.0;
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();

    let history = controller.run().unwrap();
    assert_eq!(history.stop_reason, Some(StopReason::MaxTokens));
    let last = history.last_evaluation().unwrap();
    assert_eq!(last.tokens_seen, 128 * 6);
    for metrics in [last.val.causal, last.val.planning, last.val.acting] {
        assert!(metrics.loss.is_finite());
    }

    let stats = controller.last_train_stats().unwrap();
    let planning = stats.planning_loss.unwrap();
    let acting = stats.acting_loss.unwrap();
    assert!((stats.loss - (planning / 2.0 + acting / 4.0)).abs() < 1e-9);
}

#[test]
fn test_randomized_masking_rates_train() {
    let mut config = base_config();
    config.stop.max_steps = Some(4);
    config.plan_act.enabled = true;
    config.plan_act.randomize_masking_rate = true;
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();

    let history = controller.run().unwrap();
    assert_eq!(history.stop_reason, Some(StopReason::MaxSteps));
    assert!(history
        .evaluations
        .iter()
        .all(|record| record.train.loss.is_finite()));
}

#[test]
fn test_sequence_length_grows_and_keeps_budget() {
    let mut config = base_config();
    config.sequence.initial_length = 16;
    config.sequence.growth_steps = 2;
    config.stop.max_steps = Some(6);
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();

    let history = controller.run().unwrap().clone();
    let lengths: Vec<_> = history.growth_events.iter().map(|e| (e.step, e.length)).collect();
    assert_eq!(lengths, vec![(2, 32), (4, 64)]);
    for event in &history.growth_events {
        assert_eq!(event.batchsize, 128 / event.length);
    }
    assert_eq!(controller.state().current_sequence_length, 64);
    assert_eq!(controller.state().current_batchsize, 2);
}

#[test]
fn test_epoch_limit() {
    let mut config = base_config();
    config.stop.max_epochs = Some(1.0);
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(1_000)).unwrap();

    let history = controller.run().unwrap();
    assert_eq!(history.stop_reason, Some(StopReason::MaxEpochs));
    assert!(controller.state().epoch_fraction >= 1.0);
    assert!(controller.state().tokens_seen < 1_000 + 128);
}

#[test]
fn test_fractional_epoch_limit() {
    let mut config = base_config();
    config.stop.max_epochs = Some(0.5);
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();

    let history = controller.run().unwrap();
    assert_eq!(history.stop_reason, Some(StopReason::MaxEpochs));
    let tokens = controller.state().tokens_seen;
    assert!(tokens >= 5_000, "stopped early at {tokens} tokens");
    assert!(tokens < 5_000 + 128, "overshot to {tokens} tokens");
    assert!(controller.state().epoch_fraction < 1.0);
}

#[test]
fn test_plan_act_at_shortest_length() {
    let mut config = base_config();
    config.sequence.initial_length = 2;
    config.stop.max_steps = Some(2);
    config.plan_act.enabled = true;
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000)).unwrap();
    assert_eq!(controller.state().current_sequence_length, 2);

    assert_eq!(controller.step().unwrap(), StepOutcome::Continue);
    let stats = controller.last_train_stats().unwrap();
    assert!(stats.planning_loss.unwrap().is_finite());
    assert!(stats.acting_loss.unwrap().is_finite());

    let history = controller.run().unwrap();
    assert_eq!(history.stop_reason, Some(StopReason::MaxSteps));
}

#[test]
fn test_full_evaluation_grid_and_csv() {
    let mut config = base_config();
    config.stop.max_steps = Some(1);
    config.plan_act.enabled = true;
    config.eval.eval_token_budget = 64;
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000))
        .unwrap()
        .with_run_name("grid");
    controller.run().unwrap();

    let table = controller.full_evaluation().unwrap();
    // last indices 13, 23, 33, 43, 53, 63 at length 64
    assert_eq!(table.rows.len(), 10 * 6 * 5);
    for row in &table.rows {
        assert_eq!(row.last_acting_idx - row.first_acting_idx, row.acting_width);
        let b = row.breakdown;
        for m in [b.planning, b.acting, b.acting_causal, b.acting_acting, b.acting_planning] {
            assert!(m.loss.is_finite());
            assert!((m.perplexity - m.loss.exp()).abs() <= 1e-9 * m.perplexity);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut writer = CsvResultWriter::new(dir.path(), dir.path().join("results.csv"));
    writer.write_full_evaluation(controller.run_name(), &table).unwrap();
    let path = writer.full_evaluation_path("grid").display().to_string();
    let row = controller.summary().unwrap().with_full_evaluation_file(path.clone());
    assert_eq!(row.history.len(), controller.history().evaluations.len());
    writer.write_run_summary(&row).unwrap();

    let grid = std::fs::read_to_string(writer.full_evaluation_path("grid")).unwrap();
    assert_eq!(grid.lines().count(), 1 + 1 + 300);

    let mut reader = csv::Reader::from_path(dir.path().join("results.csv")).unwrap();
    let header = reader.headers().unwrap().clone();
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(&record[0], "grid");
    assert_eq!(&record[1], "11");
    let column = |name: &str| {
        let index = header.iter().position(|h| h == name).unwrap();
        record[index].to_string()
    };
    assert_eq!(column("max_steps"), "1");
    assert_eq!(column("full_evaluation_file"), path);

    let tokens: Vec<usize> = serde_json::from_str(&column("tokens_seen_history")).unwrap();
    let evaluations = &controller.history().evaluations;
    assert_eq!(tokens, evaluations.iter().map(|r| r.tokens_seen).collect::<Vec<_>>());
    let lengths: Vec<usize> = serde_json::from_str(&column("seq_length_history")).unwrap();
    assert_eq!(lengths, vec![32; evaluations.len()]);
    for name in [
        "train_loss_history",
        "val_loss_causal_history",
        "val_pplx_planning_history",
        "val_acc_acting_history",
        "grad_norm_history",
        "learning_rate_history",
        "weight_decay_history",
    ] {
        let values: Vec<f64> = serde_json::from_str(&column(name)).unwrap();
        assert_eq!(values.len(), evaluations.len(), "{name}");
        assert!(values.iter().all(|v| v.is_finite()), "{name}");
    }
}

#[derive(Default)]
struct Captured {
    started: Vec<String>,
    events: Vec<(usize, MetricMap)>,
    ended: usize,
}

struct CaptureSink(Rc<RefCell<Captured>>);

impl TelemetrySink for CaptureSink {
    fn on_run_start(&mut self, run_name: &str) {
        self.0.borrow_mut().started.push(run_name.to_string());
    }

    fn emit(&mut self, step: usize, metrics: &MetricMap) {
        self.0.borrow_mut().events.push((step, metrics.clone()));
    }

    fn on_run_end(&mut self) {
        self.0.borrow_mut().ended += 1;
    }
}

#[test]
fn test_telemetry_matches_history() {
    let captured = Rc::new(RefCell::new(Captured::default()));
    let mut config = base_config();
    config.stop.max_steps = Some(12);
    let mut controller = TrainingController::new(Arc::new(config), model(), corpus(10_000))
        .unwrap()
        .with_run_name("telemetry")
        .with_sink(Box::new(CaptureSink(captured.clone())));

    let history = controller.run().unwrap();
    let captured = captured.borrow();
    assert_eq!(captured.started, vec!["telemetry".to_string()]);
    assert_eq!(captured.ended, 1);
    assert_eq!(captured.events.len(), history.evaluations.len());

    // regular evaluations after steps 0 and 10, forced one at 12
    let steps: Vec<_> = captured.events.iter().map(|(step, _)| *step).collect();
    assert_eq!(steps, vec![1, 11, 12]);
    let (_, metrics) = &captured.events[2];
    for key in [
        "train/loss",
        "val/loss/causal",
        "val/pplx/planning",
        "val/acc/acting",
        "tokens_seen",
        "sequence_length",
        "learning_rate",
        "weight_decay",
    ] {
        assert!(metrics.contains_key(key), "missing {key}");
    }
}

#[test]
fn test_token_budget_too_small_is_rejected() {
    let mut config = base_config();
    config.stop.max_steps = Some(1);
    config.memory.token_budget = Some(100);
    let err = TrainingController::new(Arc::new(config), model(), corpus(10_000))
        .err()
        .unwrap();
    assert!(err.is_configuration());
}
