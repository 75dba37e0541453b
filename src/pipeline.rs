//! The full experiment: extractor, new head, freezing, data, training and
//! evaluation, run in that order.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::data::{DigitSource, PreparedData, PreprocessConfig};
use crate::error::{Result, TransferError};
use crate::freeze::{freeze_all_but_last, LayerSpec};
use crate::model::{TransferModelConfig, WeightSource};
use crate::report;
use crate::training::{evaluate, fit, Evaluation, TrainingConfig, TrainingHistory};

#[derive(Config)]
pub struct ExperimentConfig {
    #[config(default = "TransferModelConfig::new()")]
    pub model: TransferModelConfig,
    #[config(default = "PreprocessConfig::new()")]
    pub preprocess: PreprocessConfig,
    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,
    /// Number of trailing pretrained layers left trainable. 4 is the last
    /// convolutional block.
    #[config(default = 4)]
    pub trainable_layers: usize,
    /// Training images used, to keep a CPU run short.
    #[config(default = 4096)]
    pub train_subset: usize,
    #[config(default = 1000)]
    pub test_subset: usize,
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.extractor.validate()?;
        self.training.validate()?;

        if self.model.classes != self.preprocess.classes {
            return Err(TransferError::InvalidConfig(format!(
                "the head predicts {} classes but labels are encoded with {}",
                self.model.classes, self.preprocess.classes
            )));
        }
        if self.train_subset == 0 || self.test_subset == 0 {
            return Err(TransferError::InvalidConfig(
                "train_subset and test_subset must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Outcome of a run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub history: TrainingHistory,
    /// Loss and accuracy on the test subset.
    pub evaluation: Evaluation,
    pub layers: Vec<LayerSpec>,
    pub total_params: usize,
    pub trainable_params: usize,
}

pub fn run<B: AutodiffBackend>(
    config: &ExperimentConfig,
    source: &dyn DigitSource,
    weights: &WeightSource,
    device: &B::Device,
) -> Result<RunSummary> {
    config.validate()?;
    B::seed(config.training.seed);

    let extractor = config.model.extractor.init::<B>(device)?;
    let extractor = weights.load_into(extractor, device)?;
    let output = extractor.output_shape();
    log::info!(
        "VGG16 extractor: input {:?}, features {}x{}x{}, {} params",
        extractor.input_shape(),
        output.channels,
        output.height,
        output.width,
        extractor.num_params()
    );

    let model = config.model.assemble(extractor, device)?;
    let layers = freeze_all_but_last(model.layers().to_vec(), config.trainable_layers);
    let model = model.with_layers(layers)?;
    report::log_layers(model.layers(), model.num_params(), model.trainable_params());

    let splits = source.load()?;
    let train_split = splits.train.take(config.train_subset);
    let test_split = splits.test.take(config.test_subset);
    let expected = model.input_shape();

    let train = PreparedData::<B>::prepare(&train_split, &config.preprocess, expected, device)?;
    let test = PreparedData::<B::InnerBackend>::prepare(
        &test_split,
        &config.preprocess,
        expected,
        device,
    )?;
    let (train, valid) = train.split_validation(config.training.validation_split)?;

    let (model, history) = fit(model, &train, &valid.inner(), &config.training)?;
    report::log_history(&history);

    let evaluation = evaluate(&model.valid(), &test, config.training.batch_size)?;
    log::info!(
        "Test loss {:.4}, test accuracy {:.4} on {} images",
        evaluation.loss,
        evaluation.accuracy,
        test.len()
    );

    Ok(RunSummary {
        history,
        evaluation,
        layers: model.layers().to_vec(),
        total_params: model.num_params(),
        trainable_params: model.trainable_params(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_digits, DigitSplits, InMemorySource, MNIST_SIZE};
    use crate::freeze::count_frozen;
    use crate::model::ExtractorConfig;
    use crate::TestAutodiffBackend;

    fn source(train: usize, test: usize) -> InMemorySource {
        InMemorySource::new(DigitSplits {
            train: synthetic_digits(train, MNIST_SIZE),
            test: synthetic_digits(test, MNIST_SIZE),
        })
    }

    fn small_config() -> ExperimentConfig {
        ExperimentConfig::new()
            .with_model(
                TransferModelConfig::new()
                    .with_extractor(ExtractorConfig::new().with_base_channels(2))
                    .with_hidden(16),
            )
            .with_training(TrainingConfig::new().with_num_epochs(1).with_batch_size(32))
    }

    #[test]
    fn one_epoch_on_synthetic_digits() {
        let summary = run::<TestAutodiffBackend>(
            &small_config(),
            &source(100, 100),
            &WeightSource::Random,
            &Default::default(),
        )
        .unwrap();

        let history = &summary.history;
        for metric in [
            &history.train_loss,
            &history.train_accuracy,
            &history.valid_loss,
            &history.valid_accuracy,
        ] {
            assert_eq!(metric.len(), 1);
            assert!(metric[0].is_finite());
            assert!(metric[0] >= 0.0);
        }
        assert!((0.0..=1.0).contains(&summary.evaluation.accuracy));
        assert_eq!(summary.layers.len(), 18);
        assert_eq!(count_frozen(&summary.layers), 14);
        assert!(summary.trainable_params < summary.total_params);
    }

    #[test]
    fn inconsistent_padding_fails_before_training() {
        let config = small_config().with_preprocess(PreprocessConfig::new().with_padding(1));

        let err = run::<TestAutodiffBackend>(
            &config,
            &source(20, 10),
            &WeightSource::Random,
            &Default::default(),
        )
        .unwrap_err();

        assert!(matches!(err, TransferError::ShapeMismatch { .. }));
    }

    #[test]
    fn class_counts_must_agree() {
        let config = small_config().with_preprocess(PreprocessConfig::new().with_classes(5));

        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = small_config().with_trainable_layers(7);

        config.save(&path).unwrap();
        let loaded = ExperimentConfig::load(&path).unwrap();

        assert_eq!(loaded.trainable_layers, 7);
        assert_eq!(loaded.train_subset, 4096);
        assert_eq!(loaded.model.extractor.base_channels, 2);
        assert_eq!(loaded.training.num_epochs, 1);
        assert_eq!(loaded.preprocess.padding, 2);
    }
}
