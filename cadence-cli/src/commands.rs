//! CLI subcommand handlers.

use std::path::{Path, PathBuf};

use cadence_core::checkpoint::load_manifest;
use cadence_core::config::{CadenceConfig, load_config};
use cadence_core::step::master_params;
use cadence_core::{
    CheckpointCallback, HalfPrecision, JsonlSink, LoggerCallback, LrSchedule, LrUpdate, LrUpdater,
    MAIN_KEY, MemorySink, Model, NullSink, OneCycle, OptimizerCallback, PrecisionCallback,
    RangeFinder, RunSummary, Runner, ScalarSink, Scheduler, SchedulerCallback,
};
use tracing::info;

use crate::demo::{
    Forward, LOGITS_KEY, SoftmaxCrossEntropy, SoftmaxRegression, TARGETS_KEY, build_optimizer,
    synthetic_loaders,
};
use crate::{Commands, ConfigAction, LrPolicy, ScheduleKind};

/// Where configuration comes from for every subcommand.
pub struct Context {
    pub workspace: PathBuf,
    pub config_path: Option<PathBuf>,
    /// `--set` overrides, applied before subcommand flags.
    pub overrides: Vec<(String, toml::Value)>,
}

impl Context {
    fn load(&self, flags: Vec<(String, toml::Value)>) -> anyhow::Result<CadenceConfig> {
        let mut overrides = self.overrides.clone();
        overrides.extend(flags);
        load_config(
            Some(&self.workspace),
            self.config_path.as_deref(),
            &overrides,
        )
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
    }
}

/// Parse `key=value`; the value is read as a TOML literal, falling back to
/// a plain string.
pub fn parse_override(raw: &str) -> anyhow::Result<(String, toml::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Override '{}' is not of the form key=value", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Override '{}' has an empty key", raw);
    }
    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

fn path_value(path: &Path) -> toml::Value {
    toml::Value::String(path.display().to_string())
}

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::Train {
            fp16,
            epochs,
            logdir,
            resume,
            schedule,
            debug,
        } => {
            let mut flags = Vec::new();
            if let Some(epochs) = epochs {
                flags.push(("run.epochs".to_string(), toml::Value::Integer(epochs as i64)));
            }
            if let Some(logdir) = &logdir {
                flags.push(("run.logdir".to_string(), path_value(logdir)));
            }
            if let Some(resume) = &resume {
                flags.push(("checkpoint.resume".to_string(), path_value(resume)));
            }
            let config = ctx.load(flags)?;
            let opts = TrainOptions {
                fp16,
                schedule,
                debug,
            };
            handle_train(&config, &ctx.workspace, opts).map(|_| ())
        }
        Commands::Eval { checkpoint } => {
            let resume = ("checkpoint.resume".to_string(), path_value(&checkpoint));
            let config = ctx.load(vec![resume])?;
            handle_eval(&config)
        }
        Commands::FindLr {
            steps,
            init_lr,
            final_lr,
        } => {
            let mut flags = Vec::new();
            if let Some(steps) = steps {
                flags.push((
                    "range_finder.n_steps".to_string(),
                    toml::Value::Integer(steps as i64),
                ));
            }
            if let Some(lr) = init_lr {
                flags.push(("range_finder.init_lr".to_string(), toml::Value::Float(lr)));
            }
            if let Some(lr) = final_lr {
                flags.push(("range_finder.final_lr".to_string(), toml::Value::Float(lr)));
            }
            let config = ctx.load(flags)?;
            handle_find_lr(&config)
        }
        Commands::Schedule { kind } => {
            let config = ctx.load(Vec::new())?;
            handle_schedule(kind, &config);
            Ok(())
        }
        Commands::Checkpoints { logdir } => handle_checkpoints(&logdir),
        Commands::Config { action } => handle_config(action, ctx),
    }
}

#[derive(Debug, Clone, Copy)]
struct TrainOptions {
    fp16: bool,
    schedule: LrPolicy,
    debug: bool,
}

fn scalar_sink(config: &CadenceConfig, logdir: &Path) -> Box<dyn ScalarSink> {
    if config.logger.write_scalars {
        Box::new(JsonlSink::new(logdir.to_path_buf()))
    } else {
        Box::new(NullSink)
    }
}

fn handle_train(
    config: &CadenceConfig,
    workspace: &Path,
    opts: TrainOptions,
) -> anyhow::Result<RunSummary> {
    let logdir = config
        .run
        .logdir
        .clone()
        .unwrap_or_else(|| workspace.join("runs").join("demo"));
    std::fs::create_dir_all(&logdir)?;

    let loaders = synthetic_loaders(config.run.samples, config.run.batch_size, config.run.seed);
    let network = SoftmaxRegression::new(config.run.seed);
    let (model, optimizer) = if opts.fp16 {
        let model = HalfPrecision::new(network);
        let optimizer = build_optimizer(&config.run, master_params(&model));
        let model: Box<dyn Model> = Box::new(model);
        (model, optimizer)
    } else {
        let optimizer = build_optimizer(&config.run, network.parameters());
        let model: Box<dyn Model> = Box::new(network);
        (model, optimizer)
    };

    // The optimizer step runs before the schedule, so every batch is stepped
    // with the rate set for it. The schedule runs before the loggers, so the
    // logged rate is the one now in the optimizer.
    let mut runner = Runner::new(model, Box::new(Forward))
        .with_criterion(Box::new(SoftmaxCrossEntropy))
        .with_optimizer(MAIN_KEY, optimizer)
        .with_callback(OptimizerCallback::from_config(&config.optimizer_step));
    runner = match opts.schedule {
        LrPolicy::OneCycle => {
            runner.with_callback(LrUpdater::new(OneCycle::from_config(&config.one_cycle)))
        }
        LrPolicy::Step => runner
            .with_scheduler(MAIN_KEY, Scheduler::step_lr(config.run.lr, 3, 0.5))
            .with_callback(SchedulerCallback::new()),
        LrPolicy::Constant => runner,
    };
    let mut runner = runner
        .with_callback(
            PrecisionCallback::new(TARGETS_KEY, LOGITS_KEY, &config.logger.precision_topk)
                .with_sink(scalar_sink(config, &logdir)),
        )
        .with_callback(LoggerCallback::from_config(
            scalar_sink(config, &logdir),
            &config.logger,
        ))
        .with_callback(CheckpointCallback::new(Some(logdir.clone()), &config.checkpoint));

    info!(
        logdir = %logdir.display(),
        fp16 = opts.fp16,
        callbacks = ?runner.callback_names(),
        "Starting demo run"
    );
    let summary = if opts.debug {
        runner.debug(&loaders)?
    } else {
        runner.train(&loaders, config.run.epochs)?
    };

    println!(
        "Completed {} epoch(s) in {} mode (epoch counter at {}).",
        summary.epochs_completed, summary.mode, summary.final_epoch
    );
    if let Some(reason) = &summary.stopped {
        println!("Stopped early: {}", reason);
    }
    if let Some(best) = &runner.state().best_metrics {
        println!("Best validation metrics:");
        for (name, value) in best {
            println!("  {:<20} {:.4}", name, value);
        }
    }
    println!();
    handle_checkpoints(&logdir)?;
    Ok(summary)
}

fn handle_eval(config: &CadenceConfig) -> anyhow::Result<()> {
    // The validation pass checkpoints in infer mode too; keep those files
    // apart from the training run's retained set.
    let logdir = config
        .checkpoint
        .resume
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join("eval"))
        .unwrap_or_else(|| PathBuf::from("eval"));
    std::fs::create_dir_all(&logdir)?;

    let loaders = synthetic_loaders(config.run.samples, config.run.batch_size, config.run.seed);
    let mut runner = Runner::new(
        Box::new(SoftmaxRegression::new(config.run.seed)),
        Box::new(Forward),
    )
    .with_criterion(Box::new(SoftmaxCrossEntropy))
    .with_callback(PrecisionCallback::new(
        TARGETS_KEY,
        LOGITS_KEY,
        &config.logger.precision_topk,
    ))
    .with_callback(LoggerCallback::from_config(Box::new(NullSink), &config.logger))
    .with_callback(CheckpointCallback::new(Some(logdir), &config.checkpoint));

    runner.infer(&loaders)?;

    let state = runner.state();
    println!("Checkpoint epoch {}:", state.epoch);
    for (loader, metrics) in &state.epoch_metrics {
        println!("  [{}]", loader);
        for (name, value) in metrics {
            if let Some(v) = value.as_float() {
                println!("    {:<20} {:.4}", name, v);
            }
        }
    }
    Ok(())
}

fn handle_find_lr(config: &CadenceConfig) -> anyhow::Result<()> {
    let loaders = synthetic_loaders(config.run.samples, config.run.batch_size, config.run.seed);
    let train_len = loaders.len_of("train").unwrap_or(1).max(1);
    let steps = config.range_finder.n_steps.unwrap_or(train_len);
    // Enough epochs for the sweep to run out; the finder stops the run.
    let epochs = steps / train_len + 2;

    let network = SoftmaxRegression::new(config.run.seed);
    let optimizer = build_optimizer(&config.run, network.parameters());
    let key = config.range_finder.optimizer_key.clone();
    let sink = MemorySink::new();
    let mut runner = Runner::new(Box::new(network), Box::new(Forward))
        .with_criterion(Box::new(SoftmaxCrossEntropy))
        .with_optimizer(&key, optimizer)
        .with_callback(OptimizerCallback::from_config(&config.optimizer_step))
        .with_callback(LrUpdater::new(RangeFinder::from_config(&config.range_finder)))
        .with_callback(LoggerCallback::from_config(Box::new(sink.clone()), &config.logger));

    let summary = runner.train(&loaders, epochs)?;
    if let Some(reason) = &summary.stopped {
        info!(%reason, "Range test finished");
    }

    let lrs = sink.values("train", &format!("lr_{key}"));
    let losses = sink.values("train", "loss");
    if lrs.is_empty() {
        println!("No batches were recorded.");
        return Ok(());
    }

    println!("{:>8} {:>14} {:>10}", "step", "lr", "loss");
    let mut best: Option<(f64, f64)> = None;
    for ((step, lr), (_, loss)) in lrs.iter().zip(&losses) {
        println!("{:>8} {:>14.6e} {:>10.4}", step, lr, loss);
        if best.is_none_or(|(_, l)| *loss < l) {
            best = Some((*lr, *loss));
        }
    }
    if let Some((lr, loss)) = best {
        println!();
        println!("Lowest loss {:.4} at lr {:.3e}", loss, lr);
        println!("Suggested learning rate: {:.3e}", lr / 10.0);
    }
    Ok(())
}

fn handle_schedule(kind: ScheduleKind, config: &CadenceConfig) {
    match kind {
        ScheduleKind::OneCycle { loader_len } => {
            let mut schedule = OneCycle::from_config(&config.one_cycle);
            schedule.prepare(loader_len);
            println!(
                "one-cycle: {} iterations, peak at {}",
                schedule.total_iter(),
                schedule.cut_point()
            );
            println!("{:>8} {:>14} {:>10}", "iter", "lr", "momentum");
            for i in 0..schedule.total_iter() {
                let lr = schedule.calc_lr();
                let momentum = schedule.calc_momentum();
                if let (LrUpdate::Set(lr), LrUpdate::Set(m)) = (lr, momentum) {
                    println!("{:>8} {:>14.6e} {:>10.4}", i, lr, m);
                }
            }
        }
        ScheduleKind::RangeFinder { steps } => {
            let mut finder = RangeFinder::new(
                config.range_finder.init_lr,
                config.range_finder.final_lr,
                Some(steps),
            );
            finder.prepare(steps);
            println!("range finder: multiplier {:.6}", finder.multiplier());
            println!("{:>8} {:>14}", "iter", "lr");
            let mut i = 0;
            while let LrUpdate::Set(lr) = finder.calc_lr() {
                println!("{:>8} {:>14.6e}", i, lr);
                i += 1;
            }
        }
    }
}

fn handle_checkpoints(logdir: &Path) -> anyhow::Result<()> {
    let manifest = load_manifest(logdir)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest: {}", e))?;
    if manifest.is_empty() {
        println!("No retained checkpoints in {}", logdir.display());
        return Ok(());
    }
    println!("Retained checkpoints in {} (best first):", logdir.display());
    for entry in &manifest {
        println!(
            "  epoch {:>4}  metric {:>10.4}  {:>9} bytes  {}  {}",
            entry.epoch,
            entry.metric,
            entry.size_bytes,
            &entry.sha256[..entry.sha256.len().min(12)],
            entry.path.display()
        );
    }
    Ok(())
}

fn handle_config(action: ConfigAction, ctx: &Context) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = ctx.workspace.join(".cadence");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&CadenceConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = ctx.load(Vec::new())?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
