//! planact CLI - plan-act language model training experiments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use planact_core::{LossDividerMethod, ResultWriter, RunConfig};
use planact_data::Corpus;
use planact_models::{ReferenceLm, ReferenceLmConfig};
use planact_trainer::{
    CompositeSink, CsvResultWriter, LoggingSink, MetricsJsonSink, TrainingController,
};

mod grid;

/// How the planning and acting divider lists combine.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum DividerMethod {
    /// Pair element-wise; the lists must have equal length
    #[default]
    Zip,
    /// Every planning divider with every acting divider
    Product,
}

impl From<DividerMethod> for LossDividerMethod {
    fn from(method: DividerMethod) -> Self {
        match method {
            DividerMethod::Zip => LossDividerMethod::Zip,
            DividerMethod::Product => LossDividerMethod::Product,
        }
    }
}

#[derive(Parser)]
#[command(name = "planact")]
#[command(author, version, about = "Adaptive plan-act language model training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train reference models over an experiment grid
    Train(TrainArgs),

    /// Write a sample run configuration
    Init {
        /// Output path
        #[arg(short, long, default_value = "planact.yaml")]
        output: String,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Training split: little-endian u32 token ids
    #[arg(long)]
    train_tokens: PathBuf,

    /// Evaluation split: little-endian u32 token ids
    #[arg(long)]
    eval_tokens: PathBuf,

    /// Run configuration file (YAML); flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hidden widths of the reference model
    #[arg(long, num_args = 1.., default_values_t = [64])]
    width: Vec<usize>,

    /// Stop after this many optimizer steps
    #[arg(long)]
    max_steps: Option<usize>,

    /// Stop after this many passes over the training split (fractions allowed)
    #[arg(long)]
    max_epochs: Option<f64>,

    /// Stop after this many training tokens
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Stop after this many training seconds (evaluation excluded)
    #[arg(long)]
    max_time_seconds: Option<f64>,

    /// Train with the plan-act curriculum
    #[arg(long)]
    plan_act: bool,

    /// Planning loss dividers
    #[arg(long, num_args = 1.., default_values_t = [2.0])]
    planning_divider: Vec<f64>,

    /// Acting loss dividers
    #[arg(long, num_args = 1.., default_values_t = [2.0])]
    acting_divider: Vec<f64>,

    /// How divider lists combine into settings
    #[arg(long, value_enum, default_value_t = DividerMethod::Zip)]
    loss_divider_method: DividerMethod,

    /// Mean fraction of each window hidden from the planner
    #[arg(long)]
    planner_masking_rate: Option<f64>,

    /// Mean fraction of each window the actor fills in
    #[arg(long)]
    actor_masking_rate: Option<f64>,

    /// Draw masking rates from a Beta distribution every iteration
    #[arg(long)]
    randomize_masking_rate: bool,

    /// Planner predictions blended into each acting input
    #[arg(long)]
    top_k: Option<usize>,

    /// Seed of the first run of every setting
    #[arg(long)]
    seed: Option<u64>,

    /// Runs per setting, with seeds seed, seed+1, ...
    #[arg(long, default_value = "1")]
    num_runs: usize,

    /// Natural vocabulary size of the token files
    #[arg(long)]
    vocab_size: Option<u32>,

    /// Log run summaries and full evaluations as CSV
    #[arg(short = 'c', long)]
    log_csv: bool,

    /// Summary CSV file
    #[arg(long, default_value = "results.csv")]
    logfile: PathBuf,

    /// Directory for full evaluation tables
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Append to an existing logfile instead of overwriting it
    #[arg(long)]
    append: bool,

    /// JSONL file receiving every evaluation event
    #[arg(long)]
    metrics_jsonl: Option<PathBuf>,

    /// Scale the GPU token capacity
    #[arg(long)]
    gpu_capacity_scalar: Option<f64>,

    /// Tokens per batch, bypassing the capacity estimate
    #[arg(long)]
    token_budget: Option<usize>,

    /// Print the experiment grid and exit
    #[arg(long)]
    review_settings: bool,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => run_training(args),
        Commands::Init { output } => generate_sample_config(&output),
    }
}

/// Load the YAML config if given and apply flag overrides.
fn build_config(args: &TrainArgs) -> anyhow::Result<RunConfig> {
    let mut config = if let Some(ref path) = args.config {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)?
    } else {
        RunConfig::default()
    };

    let stop = &mut config.stop;
    if args.max_steps.is_some() {
        stop.max_steps = args.max_steps;
    }
    if args.max_epochs.is_some() {
        stop.max_epochs = args.max_epochs;
    }
    if args.max_tokens.is_some() {
        stop.max_tokens = args.max_tokens;
    }
    if args.max_time_seconds.is_some() {
        stop.max_time_seconds = args.max_time_seconds;
    }
    if stop.max_steps.is_none()
        && stop.max_epochs.is_none()
        && stop.max_tokens.is_none()
        && stop.max_time_seconds.is_none()
    {
        stop.max_epochs = Some(1.0);
    }

    let plan_act = &mut config.plan_act;
    plan_act.enabled |= args.plan_act;
    plan_act.randomize_masking_rate |= args.randomize_masking_rate;
    if let Some(rate) = args.planner_masking_rate {
        plan_act.planner_masking_rate = rate;
    }
    if let Some(rate) = args.actor_masking_rate {
        plan_act.actor_masking_rate = rate;
    }
    if let Some(top_k) = args.top_k {
        plan_act.top_k = top_k;
    }

    if let Some(scalar) = args.gpu_capacity_scalar {
        config.memory.capacity_scalar = scalar;
    }
    if args.token_budget.is_some() {
        config.memory.token_budget = args.token_budget;
    }
    if let Some(vocab_size) = args.vocab_size {
        config.vocab_size = vocab_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn run_training(args: TrainArgs) -> anyhow::Result<()> {
    let base = build_config(&args)?;
    let settings = grid::build_settings(
        &args.width,
        base.plan_act.enabled,
        &args.planning_divider,
        &args.acting_divider,
        args.loss_divider_method.into(),
    )?;

    if args.review_settings {
        print!("{}", grid::describe(&settings, &base.plan_act));
        println!("{} settings x {} runs", settings.len(), args.num_runs);
        return Ok(());
    }
    if args.num_runs == 0 {
        anyhow::bail!("--num-runs must be at least 1");
    }

    let corpus = Arc::new(Corpus::from_token_files(&args.train_tokens, &args.eval_tokens)?);
    let mut writer = args
        .log_csv
        .then(|| CsvResultWriter::new(&args.results_dir, &args.logfile).with_append(args.append));

    let total_runs = settings.len() * args.num_runs;
    let progress = ProgressBar::new(total_runs as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} runs {msg}")?
            .progress_chars("#>-"),
    );

    let mut first_metrics_file = !args.append;
    for (setting_num, setting) in settings.iter().enumerate() {
        for run_num in 0..args.num_runs {
            let mut config = base.clone();
            config.seed = base.seed + run_num as u64;
            config.plan_act.planning_divider = setting.planning_divider;
            config.plan_act.acting_divider = setting.acting_divider;
            let run_name = grid::run_name(setting, config.seed, &config.plan_act);

            let model = ReferenceLm::new(
                ReferenceLmConfig::new(config.special_tokens().total_vocab_size())
                    .with_width(setting.width)
                    .with_seed(config.seed),
            )?;
            tracing::info!(
                run = %run_name,
                setting = setting_num + 1,
                settings = settings.len(),
                run_num = run_num + 1,
                num_runs = args.num_runs,
                num_params = %format_param_count(model.config().num_parameters()),
                "Starting run"
            );

            let mut sinks = CompositeSink::new();
            sinks.add(Box::new(LoggingSink::new()));
            if let Some(ref path) = args.metrics_jsonl {
                let sink = if first_metrics_file {
                    MetricsJsonSink::new(path)?
                } else {
                    MetricsJsonSink::append(path)?
                };
                first_metrics_file = false;
                sinks.add(Box::new(sink.with_config(serde_json::to_value(&config)?)));
            }

            let plan_act = config.plan_act.enabled;
            let mut controller =
                TrainingController::new(Arc::new(config), model, Arc::clone(&corpus))?
                    .with_run_name(run_name.as_str())
                    .with_sink(Box::new(sinks));
            controller.run()?;

            let mut full_evaluation_file = None;
            if plan_act {
                let table = controller.full_evaluation()?;
                if let Some(writer) = writer.as_mut() {
                    writer.write_full_evaluation(&run_name, &table)?;
                    full_evaluation_file =
                        Some(writer.full_evaluation_path(&run_name).display().to_string());
                }
            }
            if let (Some(writer), Some(mut summary)) = (writer.as_mut(), controller.summary()) {
                summary.full_evaluation_file = full_evaluation_file;
                writer.write_run_summary(&summary)?;
            }

            if let Some(record) = controller.history().last_evaluation() {
                progress.set_message(format!(
                    "{run_name}: val_loss={:.4}",
                    record.val.causal.loss
                ));
            }
            progress.inc(1);
        }
    }
    progress.finish_with_message("All runs complete");

    if let Some(writer) = writer {
        println!("Run summaries written to: {}", writer.logfile().display());
    }
    Ok(())
}

fn generate_sample_config(output: &str) -> anyhow::Result<()> {
    let mut config = RunConfig::default();
    config.stop.max_epochs = Some(1.0);
    config.plan_act.enabled = true;

    let yaml = serde_yaml::to_string(&config)?;
    write_config(Path::new(output), &yaml)?;

    println!("Sample configuration written to: {}", output);
    println!("\nYou can edit this file and run training with:");
    println!(
        "  planact train --config {} --train-tokens train.bin --eval-tokens eval.bin",
        output
    );

    Ok(())
}

fn write_config(path: &Path, yaml: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Format parameter count with suffix (K, M, B).
fn format_param_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        format!("{}", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TrainArgs {
        let mut argv = vec!["planact", "train", "--train-tokens", "t.bin", "--eval-tokens", "e.bin"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Commands::Train(args) => args,
            Commands::Init { .. } => panic!("expected train"),
        }
    }

    #[test]
    fn test_default_stop_is_one_epoch() {
        let config = build_config(&parse(&[])).unwrap();
        assert_eq!(config.stop.max_epochs, Some(1.0));
        assert_eq!(config.stop.max_steps, None);
        assert!(!config.plan_act.enabled);
    }

    #[test]
    fn test_flags_override_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(
            &path,
            "seed: 3\nstop:\n  max_tokens: 1000\nplan_act:\n  top_k: 2\n",
        )
        .unwrap();

        let config = build_config(&parse(&[
            "--config",
            path.to_str().unwrap(),
            "--plan-act",
            "--top-k",
            "4",
            "--max-steps",
            "50",
            "--token-budget",
            "4096",
        ]))
        .unwrap();
        assert_eq!(config.seed, 3);
        assert_eq!(config.stop.max_tokens, Some(1000));
        assert_eq!(config.stop.max_steps, Some(50));
        assert_eq!(config.stop.max_epochs, None);
        assert!(config.plan_act.enabled);
        assert_eq!(config.plan_act.top_k, 4);
        assert_eq!(config.memory.token_budget, Some(4096));
    }

    #[test]
    fn test_divider_lists() {
        let args = parse(&[
            "--plan-act",
            "--planning-divider",
            "1",
            "2",
            "--acting-divider",
            "3",
            "--loss-divider-method",
            "product",
        ]);
        assert_eq!(args.planning_divider, vec![1.0, 2.0]);
        assert_eq!(args.acting_divider, vec![3.0]);
        let settings = grid::build_settings(
            &args.width,
            true,
            &args.planning_divider,
            &args.acting_divider,
            args.loss_divider_method.into(),
        )
        .unwrap();
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn test_sample_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("planact.yaml");
        generate_sample_config(path.to_str().unwrap()).unwrap();
        let config: RunConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(config.plan_act.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_format_param_count() {
        assert_eq!(format_param_count(999), "999");
        assert_eq!(format_param_count(46_009_736), "46.01M");
    }
}
