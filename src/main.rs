#![recursion_limit = "256"]

use std::path::PathBuf;
use std::process::ExitCode;

use burn::config::Config;
use clap::Parser;
use digit_transfer::data::MnistSource;
use digit_transfer::model::WeightSource;
use digit_transfer::pipeline::{self, ExperimentConfig};
use digit_transfer::{logging, report, Result, TransferError};

#[cfg(feature = "wgpu")]
type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
type Backend = burn::backend::Autodiff<burn::backend::NdArray>;

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("enable one backend feature: `ndarray` or `wgpu`");

/// Fine-tunes a VGG16 feature extractor on MNIST and plots the learning curves.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory receiving the config, history, plots and log file.
    #[arg(short, long, default_value = "/tmp/digit-transfer")]
    artifact_dir: PathBuf,
    /// Experiment configuration (JSON). Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Pretrained VGG16 weights: a torchvision PyTorch checkpoint.
    #[arg(short, long)]
    weights: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    train_subset: Option<usize>,
    #[arg(long)]
    test_subset: Option<usize>,
    #[arg(long)]
    trainable_layers: Option<usize>,
}

impl Args {
    fn experiment(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path).map_err(|err| {
                TransferError::InvalidConfig(format!(
                    "cannot read '{}': {err}",
                    path.display()
                ))
            })?,
            None => ExperimentConfig::new(),
        };

        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(train_subset) = self.train_subset {
            config.train_subset = train_subset;
        }
        if let Some(test_subset) = self.test_subset {
            config.test_subset = test_subset;
        }
        if let Some(trainable_layers) = self.trainable_layers {
            config.trainable_layers = trainable_layers;
        }

        Ok(config)
    }

    fn weights(&self) -> WeightSource {
        match &self.weights {
            Some(path) => WeightSource::PyTorch(path.clone()),
            None => WeightSource::Random,
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let artifact_dir = args.artifact_dir.as_path();
    let config = args.experiment()?;
    config.validate()?;
    config.save(artifact_dir.join("config.json"))?;

    let weights = args.weights();
    if !weights.is_pretrained() {
        log::warn!("No pretrained weights given, the extractor keeps its random initialization");
    }

    let device = Default::default();
    let summary = pipeline::run::<Backend>(&config, &MnistSource, &weights, &device)?;

    summary.history.save(artifact_dir.join("history.json"))?;
    report::plot_history(&summary.history, artifact_dir)?;

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = std::fs::create_dir_all(&args.artifact_dir) {
        eprintln!(
            "Cannot create the artifact directory '{}': {err}",
            args.artifact_dir.display()
        );
        return ExitCode::FAILURE;
    }
    logging::install_logger(Some(&args.artifact_dir.join("experiment.log")));

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
