//! Mini-batch training of the transfer model and its evaluation.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::PreparedData;
use crate::error::{Result, TransferError};
use crate::model::{TransferModel, TransferNetwork};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Trailing fraction of the training examples held out for validation.
    #[config(default = 0.2)]
    pub validation_split: f64,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(TransferError::InvalidConfig(
                "num_epochs must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TransferError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TransferError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(TransferError::InvalidConfig(format!(
                "validation_split must be in (0, 1), got {}",
                self.validation_split
            )));
        }

        Ok(())
    }
}

/// Loss and accuracy of a model on one set of examples.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    /// Fraction of correct predictions, in `[0, 1]`.
    pub accuracy: f64,
}

/// Per-epoch metrics of a training run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub valid_loss: Vec<f64>,
    pub valid_accuracy: Vec<f64>,
}

impl TrainingHistory {
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    pub fn push(&mut self, train: Evaluation, valid: Evaluation) {
        self.train_loss.push(train.loss);
        self.train_accuracy.push(train.accuracy);
        self.valid_loss.push(valid.loss);
        self.valid_accuracy.push(valid.accuracy);
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;

        Ok(serde_json::from_str(&json)?)
    }
}

/// Mean categorical cross-entropy between logits and one-hot targets.
///
/// # Shapes
///
/// - logits: `[batch_size, classes]`
/// - targets: `[batch_size, classes]`
/// - output: `[1]`
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);

    (log_probs * targets).sum_dim(1).mean().neg()
}

/// Number of rows whose highest score is at the target class.
pub fn correct_predictions<B: Backend>(scores: Tensor<B, 2>, targets: Tensor<B, 2>) -> usize {
    let predictions = scores.argmax(1);
    let labels = targets.argmax(1);

    predictions
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// Train the model with Adam, validating after every epoch.
///
/// Only parameters still requiring gradients are updated, so frozen layers
/// come out unchanged. A non-finite batch loss stops the run.
pub fn fit<B: AutodiffBackend>(
    model: TransferModel<B>,
    train: &PreparedData<B>,
    valid: &PreparedData<B::InnerBackend>,
    config: &TrainingConfig,
) -> Result<(TransferModel<B>, TrainingHistory)> {
    config.validate()?;
    if train.is_empty() || valid.is_empty() {
        return Err(TransferError::Training(format!(
            "need training and validation examples, got {} and {}",
            train.len(),
            valid.len()
        )));
    }
    model.check_input(train.images.dims())?;
    model.check_input(valid.images.dims())?;

    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let (mut network, layers) = model.into_parts();
    let mut optim = config.optimizer.init::<B, TransferNetwork<B>>();
    let mut indices: Vec<usize> = (0..train.len()).collect();
    let mut history = TrainingHistory::default();

    log::info!(
        "Training on {} examples, validating on {}, {} epochs of batches of {}",
        train.len(),
        valid.len(),
        config.num_epochs,
        config.batch_size
    );

    for epoch in 1..=config.num_epochs {
        indices.shuffle(&mut rng);

        let mut loss_sum = 0.0;
        let mut correct = 0;

        for (iteration, batch_indices) in indices.chunks(config.batch_size).enumerate() {
            let batch = train.select(batch_indices);
            let logits = network.forward_logits(batch.images);
            let loss = categorical_cross_entropy(logits.clone(), batch.targets.clone());

            let batch_loss = loss.clone().into_scalar().elem::<f64>();
            if !batch_loss.is_finite() {
                return Err(TransferError::Training(format!(
                    "loss became {batch_loss} at epoch {epoch}, iteration {iteration}"
                )));
            }

            loss_sum += batch_loss * batch_indices.len() as f64;
            correct += correct_predictions(logits, batch.targets);

            // Gradients linked to each parameter of the model.
            let grads = GradientsParams::from_grads(loss.backward(), &network);
            network = optim.step(config.learning_rate, network, grads);

            log::debug!("[Epoch {epoch} - Iteration {iteration}] loss {batch_loss:.4}");
        }

        let train_eval = Evaluation {
            loss: loss_sum / train.len() as f64,
            accuracy: correct as f64 / train.len() as f64,
        };
        let valid_eval = evaluate_network(&network.valid(), valid, config.batch_size)?;

        log::info!(
            "[Epoch {epoch}/{}] loss {:.4} - accuracy {:.4} - val_loss {:.4} - val_accuracy {:.4}",
            config.num_epochs,
            train_eval.loss,
            train_eval.accuracy,
            valid_eval.loss,
            valid_eval.accuracy
        );

        history.push(train_eval, valid_eval);
    }

    Ok((TransferModel::from_parts(network, layers), history))
}

/// Loss and accuracy over `data`, in batches, without gradient tracking.
pub fn evaluate<B: Backend>(
    model: &TransferModel<B>,
    data: &PreparedData<B>,
    batch_size: usize,
) -> Result<Evaluation> {
    model.check_input(data.images.dims())?;

    evaluate_network(model.network(), data, batch_size)
}

fn evaluate_network<B: Backend>(
    network: &TransferNetwork<B>,
    data: &PreparedData<B>,
    batch_size: usize,
) -> Result<Evaluation> {
    if data.is_empty() {
        return Err(TransferError::InvalidImages(
            "cannot evaluate on an empty set".to_string(),
        ));
    }
    if batch_size == 0 {
        return Err(TransferError::InvalidConfig(
            "batch_size must be positive".to_string(),
        ));
    }

    let len = data.len();
    let mut loss_sum = 0.0;
    let mut correct = 0;

    for start in (0..len).step_by(batch_size) {
        let end = usize::min(start + batch_size, len);
        let batch = data.range(start..end);

        let logits = network.forward_logits(batch.images);
        let loss = categorical_cross_entropy(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem::<f64>();

        loss_sum += loss * (end - start) as f64;
        correct += correct_predictions(logits, batch.targets);
    }

    let evaluation = Evaluation {
        loss: loss_sum / len as f64,
        accuracy: correct as f64 / len as f64,
    };
    if !evaluation.loss.is_finite() {
        return Err(TransferError::Tensor(format!(
            "evaluation loss is {}",
            evaluation.loss
        )));
    }

    Ok(evaluation)
}
