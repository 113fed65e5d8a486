//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, TrainArgs};
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD, VarBuilder, VarMap};
use fitloop_core::config::{
    ConfigOverrides, DataOverrides, ModelOverrides, OptimizerKind, TrainingOverrides,
    workspace_config_path,
};
use fitloop_core::data::{Dataset, MnistSplit, load_mnist, split_data};
use fitloop_core::training::{
    CheckpointRecord, FitOptions, LogObserver, TaskKind, Verbosity, load_checkpoint,
};
use fitloop_core::{CheckpointSelector, EpochDriver, FitloopConfig, Mlp, Trainer, load_config};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args, workspace),
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Inspect { path } => handle_inspect(&path),
    }
}

fn parse_optimizer(name: &str) -> anyhow::Result<OptimizerKind> {
    match name.to_ascii_lowercase().replace('-', "_").as_str() {
        "sgd" => Ok(OptimizerKind::Sgd),
        "adam_w" | "adamw" => Ok(OptimizerKind::AdamW),
        other => anyhow::bail!("Unknown optimizer '{other}' (expected sgd or adam_w)"),
    }
}

/// Map command-line flags onto the highest-priority config layer.
fn overrides_from_args(args: &TrainArgs) -> anyhow::Result<ConfigOverrides> {
    let optimizer = args.optimizer.as_deref().map(parse_optimizer).transpose()?;
    Ok(ConfigOverrides {
        training: TrainingOverrides {
            model_fn: args.model_fn.clone(),
            n_epochs: args.n_epochs,
            batch_size: args.batch_size,
            verbose: args.verbosity.map(Verbosity::from),
            learning_rate: args.learning_rate,
            optimizer,
        },
        data: DataOverrides {
            data_dir: args.data_dir.clone(),
            train_ratio: args.train_ratio,
            seed: args.seed,
        },
        model: ModelOverrides {
            n_layers: args.n_layers,
            use_dropout: args.use_dropout.then_some(true),
            dropout_p: args.dropout_p,
        },
    })
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn handle_train(args: TrainArgs, workspace: &Path) -> anyhow::Result<()> {
    let overrides = overrides_from_args(&args)?;
    let config = load_config(Some(workspace), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.validate()?;
    if config.training.task != TaskKind::Classification {
        anyhow::bail!("MNIST labels are class indices; set training.task = \"classification\"");
    }

    let device = Device::Cpu;
    let data_dir = resolve(workspace, &config.data.data_dir);
    let dataset = load_mnist(&data_dir, MnistSplit::Train, config.data.flatten, &device)?;

    let mut rng = match config.data.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (train, valid) = split_data(&dataset, config.data.train_ratio, &mut rng)?;
    tracing::info!(
        train = ?train.inputs.dims(),
        valid = ?valid.inputs.dims(),
        "Split MNIST training set"
    );

    let lr = config.training.learning_rate;
    match config.training.optimizer {
        OptimizerKind::Sgd => run::<SGD>(&config, lr, &train, &valid, &mut rng, workspace),
        OptimizerKind::AdamW => run::<AdamW>(
            &config,
            ParamsAdamW {
                lr,
                ..Default::default()
            },
            &train,
            &valid,
            &mut rng,
            workspace,
        ),
    }
}

fn run<O: Optimizer>(
    config: &FitloopConfig,
    optimizer_config: O::Config,
    train: &Dataset,
    valid: &Dataset,
    rng: &mut StdRng,
    workspace: &Path,
) -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Mlp::new(&config.model, vb)?;
    println!("{} linear layers", model.num_layers());

    let optimizer = O::new(varmap.all_vars(), optimizer_config)?;
    let training = &config.training;
    let mut driver = EpochDriver::new(model, varmap, optimizer, training.task, training.averaging);
    driver.add_observer(Box::new(LogObserver::new(training.verbose)));

    let destination = resolve(workspace, &training.model_fn);
    let mut trainer = Trainer::new(
        driver,
        CheckpointSelector::new(training.tie_policy),
        &destination,
        training.save_schedule,
        training.verbose,
    );
    let options = FitOptions {
        n_epochs: training.n_epochs,
        batch_size: training.batch_size,
        shuffle: config.data.shuffle,
    };
    let history = trainer.fit(train, valid, options, rng, config)?;

    println!("Epochs:        {}", history.epochs_completed);
    match (history.best_epoch, history.best_loss) {
        (Some(epoch), Some(loss)) => println!("Best epoch:    {epoch} (loss {loss:.4e})"),
        _ => println!("Best epoch:    none (validation loss was never finite)"),
    }
    println!("Elapsed:       {:.1}s", history.total_training_time_secs);
    if destination.exists() {
        println!("Checkpoint:    {}", destination.display());
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&FitloopConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_inspect(path: &Path) -> anyhow::Result<()> {
    let record: CheckpointRecord<serde_json::Value> = load_checkpoint(path)?;
    println!("Checkpoint:    {}", path.display());
    println!("Format:        v{}", record.format_version);
    println!("Saved at:      {}", record.saved_at.to_rfc3339());
    match record.best_loss {
        Some(loss) => println!("Best loss:     {loss:.6e}"),
        None => println!("Best loss:     n/a"),
    }
    if let Some(epoch) = record.best_epoch {
        println!("Best epoch:    {epoch}");
    }
    println!(
        "Parameters:    {} tensors, {} values",
        record.model.len(),
        record.model.num_values()
    );
    for name in record.model.names() {
        if let Some(tensor) = record.model.get(name) {
            println!("  {name:<16} {:?}", tensor.shape);
        }
    }
    println!("Digest:        {}", record.digest);
    println!("Metadata:");
    println!("{}", serde_json::to_string_pretty(&record.metadata)?);
    Ok(())
}
