use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use super::head::{ClassifierHead, HeadConfig};
use super::vgg::{ExtractorConfig, InputShape, Vgg16};
use crate::error::{Result, TransferError};
use crate::freeze::LayerSpec;

/// Configuration to assemble a [transfer model](TransferModel).
#[derive(Config, Debug)]
pub struct TransferModelConfig {
    #[config(default = "ExtractorConfig::new()")]
    pub extractor: ExtractorConfig,
    /// Width of the hidden dense layer of the new head.
    #[config(default = 256)]
    pub hidden: usize,
    #[config(default = 10)]
    pub classes: usize,
}

impl TransferModelConfig {
    /// Build a randomly initialized extractor and put a new head on it.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TransferModel<B>> {
        let extractor = self.extractor.init(device)?;
        self.assemble(extractor, device)
    }

    /// Put a new head, sized from the extractor output, on an existing extractor.
    pub fn assemble<B: Backend>(
        &self,
        extractor: Vgg16<B>,
        device: &B::Device,
    ) -> Result<TransferModel<B>> {
        if self.classes == 0 || self.hidden == 0 {
            return Err(TransferError::InvalidConfig(format!(
                "head needs positive widths, got hidden = {} and classes = {}",
                self.hidden, self.classes
            )));
        }

        let head = HeadConfig::new(extractor.output_shape().flat_len())
            .with_hidden(self.hidden)
            .with_classes(self.classes)
            .init(device);

        TransferModel::new(extractor, head)
    }
}

/// The burn module optimized during training: extractor followed by the new head.
#[derive(Module, Debug)]
pub struct TransferNetwork<B: Backend> {
    pub extractor: Vgg16<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> TransferNetwork<B> {
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward_logits(self.extractor.forward(images))
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.extractor.forward(images))
    }
}

/// A pretrained extractor with a replaced head, plus the trainability of
/// each pretrained layer.
#[derive(Clone, Debug)]
pub struct TransferModel<B: Backend> {
    network: TransferNetwork<B>,
    layers: Vec<LayerSpec>,
}

impl<B: Backend> TransferModel<B> {
    /// Compose an extractor and a head.
    ///
    /// The extractor must be built without its original top and the head
    /// input width must equal the flattened extractor output.
    pub fn new(extractor: Vgg16<B>, head: ClassifierHead<B>) -> Result<Self> {
        if extractor.has_top() {
            return Err(TransferError::InvalidConfig(
                "the extractor still carries its classification top, build it with include_top = false"
                    .to_string(),
            ));
        }

        let actual = extractor.output_shape().flat_len();
        let expected = head.input_features();
        if expected != actual {
            return Err(TransferError::IncompatibleHead { expected, actual });
        }

        let layers = extractor.layers();

        Ok(Self {
            network: TransferNetwork { extractor, head },
            layers,
        })
    }

    /// Class probabilities.
    ///
    /// # Shapes
    ///
    /// - images: `[batch_size, 3, height, width]`
    /// - output: `[batch_size, classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.forward(images)
    }

    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.forward_logits(images)
    }

    pub fn input_shape(&self) -> InputShape {
        self.network.extractor.input_shape()
    }

    pub fn classes(&self) -> usize {
        self.network.head.classes()
    }

    /// Pretrained layers with their current trainability.
    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn network(&self) -> &TransferNetwork<B> {
        &self.network
    }

    /// Apply a layer list produced by a freezing policy.
    ///
    /// The list must name the extractor layers in order. Layers marked
    /// non-trainable stop requiring gradients. Freezing is one way: a layer
    /// already frozen cannot be made trainable again.
    pub fn with_layers(self, layers: Vec<LayerSpec>) -> Result<Self> {
        if layers.len() != self.layers.len() {
            return Err(TransferError::LayerMismatch(format!(
                "expected {} layers, got {}",
                self.layers.len(),
                layers.len()
            )));
        }

        for (current, requested) in self.layers.iter().zip(layers.iter()) {
            if current.name != requested.name || current.kind != requested.kind {
                return Err(TransferError::LayerMismatch(format!(
                    "expected layer '{}', got '{}'",
                    current.name, requested.name
                )));
            }
            if !current.trainable && requested.trainable {
                return Err(TransferError::LayerMismatch(format!(
                    "layer '{}' is frozen and cannot be unfrozen",
                    current.name
                )));
            }
        }

        let flags: Vec<bool> = layers.iter().map(|layer| layer.trainable).collect();
        let TransferNetwork { extractor, head } = self.network;

        Ok(Self {
            network: TransferNetwork {
                extractor: extractor.freeze(&flags),
                head,
            },
            layers,
        })
    }

    pub fn num_params(&self) -> usize {
        self.network.num_params()
    }

    /// Parameters the optimizer will update: the head and every trainable
    /// pretrained layer.
    pub fn trainable_params(&self) -> usize {
        let pretrained: usize = self
            .layers
            .iter()
            .zip(self.network.extractor.layer_params())
            .filter(|(layer, _)| layer.trainable)
            .map(|(_, params)| params)
            .sum();

        pretrained + self.network.head.num_params()
    }

    /// Fails with a shape mismatch unless `dims` is `[_, channels, height, width]`
    /// of this model's input.
    pub fn check_input(&self, dims: [usize; 4]) -> Result<()> {
        let shape = self.input_shape();
        let expected = vec![shape.channels, shape.height, shape.width];
        let actual = dims[1..].to_vec();

        if expected != actual {
            return Err(TransferError::ShapeMismatch {
                context: "model input",
                expected,
                actual,
            });
        }

        Ok(())
    }

    pub fn into_parts(self) -> (TransferNetwork<B>, Vec<LayerSpec>) {
        (self.network, self.layers)
    }

    pub(crate) fn from_parts(network: TransferNetwork<B>, layers: Vec<LayerSpec>) -> Self {
        Self { network, layers }
    }
}

impl<B: AutodiffBackend> TransferModel<B> {
    /// The same model without gradient tracking, for evaluation.
    pub fn valid(&self) -> TransferModel<B::InnerBackend> {
        TransferModel {
            network: self.network.valid(),
            layers: self.layers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::{count_frozen, freeze_all_but_last};
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::Distribution;
    use rstest::rstest;

    fn config() -> TransferModelConfig {
        TransferModelConfig::new()
            .with_extractor(ExtractorConfig::new().with_base_channels(2))
            .with_hidden(16)
    }

    #[rstest]
    #[case(32, 32)]
    #[case(64, 48)]
    fn input_shape_has_three_channels(#[case] height: usize, #[case] width: usize) {
        let model = config()
            .with_extractor(
                ExtractorConfig::new()
                    .with_base_channels(2)
                    .with_height(height)
                    .with_width(width),
            )
            .init::<TestBackend>(&Default::default())
            .unwrap();

        assert_eq!(model.input_shape(), InputShape::new(height, width, 3));
    }

    #[test]
    fn outputs_are_probabilities() {
        let device = Default::default();
        let model = config().init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::random(
            [4, 3, 32, 32],
            Distribution::Uniform(0.0, 255.0),
            &device,
        );

        let probs = model.forward(images);
        assert_eq!(probs.dims(), [4, 10]);

        let values = probs.into_data().to_vec::<f32>().unwrap();
        for row in values.chunks(10) {
            assert!(row.iter().all(|p| *p >= 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn rejects_head_of_wrong_width() {
        let device = Default::default();
        let extractor = ExtractorConfig::new()
            .with_base_channels(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let head = HeadConfig::new(17).init::<TestBackend>(&device);

        let err = TransferModel::new(extractor, head).unwrap_err();

        assert!(matches!(
            err,
            TransferError::IncompatibleHead {
                expected: 17,
                actual: 16
            }
        ));
    }

    #[test]
    fn rejects_zero_classes() {
        let result = config()
            .with_classes(0)
            .init::<TestBackend>(&Default::default());

        assert!(matches!(result, Err(TransferError::InvalidConfig(_))));
    }

    #[test]
    fn freezing_reduces_trainable_params() {
        let model = config().init::<TestBackend>(&Default::default()).unwrap();
        let total = model.num_params();
        assert_eq!(model.trainable_params(), total);

        let layers = freeze_all_but_last(model.layers().to_vec(), 4);
        let model = model.with_layers(layers).unwrap();

        assert_eq!(count_frozen(model.layers()), 14);
        let block5: usize = model
            .network()
            .extractor
            .blocks
            .last()
            .map(|block| block.num_params())
            .unwrap_or_default();
        assert_eq!(
            model.trainable_params(),
            block5 + model.network().head.num_params()
        );
        assert_eq!(model.num_params(), total);
    }

    #[test]
    fn rejects_foreign_layer_list() {
        let model = config().init::<TestBackend>(&Default::default()).unwrap();
        let mut layers = model.layers().to_vec();
        layers.swap(0, 1);

        let result = model.with_layers(layers);

        assert!(matches!(result, Err(TransferError::LayerMismatch(_))));
    }

    #[test]
    fn frozen_layers_cannot_be_unfrozen() {
        let model = config().init::<TestBackend>(&Default::default()).unwrap();
        let trainable = model.layers().to_vec();
        let frozen = freeze_all_but_last(trainable.clone(), 0);
        let model = model.with_layers(frozen).unwrap();

        let result = model.with_layers(trainable);

        assert!(matches!(result, Err(TransferError::LayerMismatch(_))));
    }

    #[test]
    fn frozen_convolutions_stop_tracking_gradients() {
        let model = config()
            .init::<TestAutodiffBackend>(&Default::default())
            .unwrap();
        let layers = freeze_all_but_last(model.layers().to_vec(), 4);
        let model = model.with_layers(layers).unwrap();

        let flags: Vec<bool> = model
            .network()
            .extractor
            .convs()
            .map(|conv| conv.weight.val().is_require_grad())
            .collect();

        assert_eq!(flags.len(), 13);
        assert!(flags[..10].iter().all(|tracked| !tracked));
        assert!(flags[10..].iter().all(|tracked| *tracked));
    }

    #[test]
    fn check_input_reports_mismatch() {
        let model = config().init::<TestBackend>(&Default::default()).unwrap();

        assert!(model.check_input([8, 3, 32, 32]).is_ok());
        let err = model.check_input([8, 3, 28, 28]).unwrap_err();
        assert!(err.is_data_shape());
    }
}
