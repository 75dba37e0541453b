//! VGG16 feature extractor.
//!
//! Five blocks of 3x3 convolutions with ReLU, each followed by a 2x2 max pool.
//! Built without its dense top the network turns an `[N, 3, H, W]` image batch
//! into an `[N, 8w, H/32, W/32]` feature map, where `w` is the width of the first
//! block (64 for the pretrained network).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::freeze::{LayerKind, LayerSpec};

/// Number of convolutions in each block.
pub(crate) const CONVS_PER_BLOCK: [usize; 5] = [2, 2, 3, 3, 3];
/// Width of each block relative to the first one.
const WIDTH_MULTIPLIERS: [usize; 5] = [1, 2, 4, 8, 8];
/// Smallest spatial size surviving the five halvings.
pub const MIN_INPUT_SIZE: usize = 32;
/// Spatial size the original dense top was trained on.
pub const TOP_INPUT_SIZE: usize = 224;
const TOP_HIDDEN: usize = 4096;

/// Spatial size and channel count of the images a model accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// `[height, width, channels]`.
    pub fn dims(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

/// Shape of the feature map produced by the extractor, excluding the batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureShape {
    /// Width of the vector obtained by flattening the feature map.
    pub fn flat_len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Configuration to create a [VGG16 extractor](Vgg16) using the [init function](ExtractorConfig::init).
#[derive(Config, Debug)]
pub struct ExtractorConfig {
    /// Input height.
    #[config(default = 32)]
    pub height: usize,
    /// Input width.
    #[config(default = 32)]
    pub width: usize,
    /// Input channels. VGG16 only accepts 3.
    #[config(default = 3)]
    pub channels: usize,
    /// Keep the original dense classification top.
    #[config(default = false)]
    pub include_top: bool,
    /// Output classes of the original top. Ignored without the top.
    #[config(default = 1000)]
    pub classes: usize,
    /// Width of the first block. The pretrained network uses 64.
    #[config(default = 64)]
    pub base_channels: usize,
}

impl ExtractorConfig {
    /// Checks that the requested shape can be built, without allocating anything.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TransferError::InvalidInputShape {
            height: self.height,
            width: self.width,
            channels: self.channels,
            reason: reason.to_string(),
        };

        if self.channels != 3 {
            return Err(invalid("VGG16 expects exactly 3 input channels"));
        }
        if self.height < MIN_INPUT_SIZE || self.width < MIN_INPUT_SIZE {
            return Err(invalid(
                "input must be at least 32x32 to survive five 2x2 poolings",
            ));
        }
        if self.include_top && (self.height != TOP_INPUT_SIZE || self.width != TOP_INPUT_SIZE) {
            return Err(invalid(
                "the original classification top requires 224x224 input",
            ));
        }
        if self.base_channels == 0 {
            return Err(TransferError::InvalidConfig(
                "base_channels must be positive".to_string(),
            ));
        }
        if self.include_top && self.classes == 0 {
            return Err(TransferError::InvalidConfig(
                "the classification top needs at least one class".to_string(),
            ));
        }

        Ok(())
    }

    /// Initialize a new [VGG16 extractor](Vgg16) with random weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Vgg16<B>> {
        self.validate()?;

        let mut blocks = Vec::with_capacity(CONVS_PER_BLOCK.len());
        let mut channels_in = self.channels;

        for (num_convs, multiplier) in CONVS_PER_BLOCK.into_iter().zip(WIDTH_MULTIPLIERS) {
            let channels_out = self.base_channels * multiplier;
            let mut convs = Vec::with_capacity(num_convs);

            for _ in 0..num_convs {
                convs.push(
                    Conv2dConfig::new([channels_in, channels_out], [3, 3])
                        .with_padding(PaddingConfig2d::Same)
                        .init(device),
                );
                channels_in = channels_out;
            }

            blocks.push(VggBlock {
                convs,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            });
        }

        let top = self.include_top.then(|| {
            let features = channels_in * (TOP_INPUT_SIZE / 32) * (TOP_INPUT_SIZE / 32);

            VggTop {
                fc1: LinearConfig::new(features, TOP_HIDDEN).init(device),
                fc2: LinearConfig::new(TOP_HIDDEN, TOP_HIDDEN).init(device),
                predictions: LinearConfig::new(TOP_HIDDEN, self.classes).init(device),
            }
        });

        Ok(Vgg16 {
            blocks,
            top,
            height: self.height,
            width: self.width,
            base_channels: self.base_channels,
        })
    }
}

/// A VGG block: convolutions with ReLU followed by a max pool.
#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pub pool: MaxPool2d,
}

impl<B: Backend> VggBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self
            .convs
            .iter()
            .fold(input, |x, conv| relu(conv.forward(x)));

        self.pool.forward(x)
    }
}

/// The original dense classification top.
#[derive(Module, Debug)]
pub struct VggTop<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub predictions: Linear<B>,
}

impl<B: Backend> VggTop<B> {
    /// # Shapes
    ///
    /// - features: `[batch_size, 512, 7, 7]`
    /// - output: `[batch_size, classes]`
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = features.flatten::<2>(1, 3);
        let x = relu(self.fc1.forward(x));
        let x = relu(self.fc2.forward(x));

        softmax(self.predictions.forward(x), 1)
    }
}

/// VGG16 convolutional stack, optionally with its original dense top.
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    pub blocks: Vec<VggBlock<B>>,
    pub top: Option<VggTop<B>>,
    height: usize,
    width: usize,
    base_channels: usize,
}

impl<B: Backend> Vgg16<B> {
    /// Extract the feature map.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, 3, height, width]`
    /// - output: `[batch_size, 8 * base_channels, height / 32, width / 32]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }

    /// Class probabilities from the original top, if the network was built with it.
    pub fn classify(&self, input: Tensor<B, 4>) -> Option<Tensor<B, 2>> {
        let top = self.top.as_ref()?;

        Some(top.forward(self.forward(input)))
    }

    pub fn has_top(&self) -> bool {
        self.top.is_some()
    }

    pub fn input_shape(&self) -> InputShape {
        InputShape::new(self.height, self.width, 3)
    }

    pub fn output_shape(&self) -> FeatureShape {
        let last = WIDTH_MULTIPLIERS[WIDTH_MULTIPLIERS.len() - 1];
        let reduction = 1 << self.blocks.len();

        FeatureShape {
            channels: self.base_channels * last,
            height: self.height / reduction,
            width: self.width / reduction,
        }
    }

    /// All convolutions, in forward order.
    pub fn convs(&self) -> impl Iterator<Item = &Conv2d<B>> {
        self.blocks.iter().flat_map(|block| block.convs.iter())
    }

    /// Pretrained layers in forward order, all marked trainable.
    pub fn layers(&self) -> Vec<LayerSpec> {
        let mut layers = Vec::new();

        for (b, block) in self.blocks.iter().enumerate() {
            for i in 0..block.convs.len() {
                layers.push(LayerSpec::new(
                    format!("block{}_conv{}", b + 1, i + 1),
                    LayerKind::Conv,
                ));
            }
            layers.push(LayerSpec::new(format!("block{}_pool", b + 1), LayerKind::Pool));
        }

        if self.top.is_some() {
            layers.push(LayerSpec::new("flatten", LayerKind::Flatten));
            layers.push(LayerSpec::new("fc1", LayerKind::Dense));
            layers.push(LayerSpec::new("fc2", LayerKind::Dense));
            layers.push(LayerSpec::new("predictions", LayerKind::Dense));
        }

        layers
    }

    /// Parameter count of every layer, aligned with [layers](Self::layers).
    pub fn layer_params(&self) -> Vec<usize> {
        let mut params = Vec::new();

        for block in self.blocks.iter() {
            params.extend(block.convs.iter().map(|conv| conv.num_params()));
            params.push(0);
        }

        if let Some(top) = &self.top {
            params.push(0);
            params.push(top.fc1.num_params());
            params.push(top.fc2.num_params());
            params.push(top.predictions.num_params());
        }

        params
    }

    /// Stop gradient tracking for every layer whose flag is false.
    ///
    /// `trainable` is aligned with [layers](Self::layers); missing flags leave
    /// the layer untouched.
    pub(crate) fn freeze(self, trainable: &[bool]) -> Self {
        let Self {
            blocks,
            top,
            height,
            width,
            base_channels,
        } = self;
        let mut flags = trainable.iter().copied();
        let mut frozen_blocks = Vec::with_capacity(blocks.len());

        for block in blocks {
            let mut convs = Vec::with_capacity(block.convs.len());
            for conv in block.convs {
                convs.push(apply::<_, B>(conv, flags.next()));
            }
            // Pooling has no parameters.
            flags.next();

            frozen_blocks.push(VggBlock {
                convs,
                pool: block.pool,
            });
        }

        let top = top.map(|top| {
            flags.next();
            let fc1 = apply::<_, B>(top.fc1, flags.next());
            let fc2 = apply::<_, B>(top.fc2, flags.next());
            let predictions = apply::<_, B>(top.predictions, flags.next());

            VggTop {
                fc1,
                fc2,
                predictions,
            }
        });

        Self {
            blocks: frozen_blocks,
            top,
            height,
            width,
            base_channels,
        }
    }
}

fn apply<M: Module<B>, B: Backend>(module: M, trainable: Option<bool>) -> M {
    match trainable {
        Some(false) => module.no_grad(),
        _ => module,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;
    use rstest::rstest;

    fn small() -> ExtractorConfig {
        ExtractorConfig::new().with_base_channels(2)
    }

    #[rstest]
    #[case(32, 32)]
    #[case(48, 64)]
    #[case(96, 40)]
    fn input_shape_matches_config(#[case] height: usize, #[case] width: usize) {
        let device = Default::default();
        let vgg = small()
            .with_height(height)
            .with_width(width)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(vgg.input_shape(), InputShape::new(height, width, 3));
    }

    #[test]
    fn forward_produces_declared_feature_shape() {
        let device = Default::default();
        let vgg = small().with_height(64).init::<TestBackend>(&device).unwrap();
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 64, 32],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let output = vgg.forward(input);
        let shape = vgg.output_shape();

        assert_eq!(
            output.dims(),
            [2, shape.channels, shape.height, shape.width]
        );
        assert_eq!(shape, FeatureShape { channels: 16, height: 2, width: 1 });
    }

    #[rstest]
    #[case(32, 32, 1)]
    #[case(16, 32, 3)]
    #[case(32, 31, 3)]
    fn rejects_unbuildable_shapes(
        #[case] height: usize,
        #[case] width: usize,
        #[case] channels: usize,
    ) {
        let result = small()
            .with_height(height)
            .with_width(width)
            .with_channels(channels)
            .init::<TestBackend>(&Default::default());

        let err = result.unwrap_err();
        assert!(matches!(err, TransferError::InvalidInputShape { .. }));
        assert!(err.is_construction());
    }

    #[test]
    fn top_requires_original_input_size() {
        let result = small()
            .with_include_top(true)
            .init::<TestBackend>(&Default::default());

        assert!(matches!(
            result,
            Err(TransferError::InvalidInputShape { .. })
        ));
    }

    #[test]
    fn zero_base_channels_is_invalid() {
        let result = ExtractorConfig::new()
            .with_base_channels(0)
            .init::<TestBackend>(&Default::default());

        assert!(matches!(result, Err(TransferError::InvalidConfig(_))));
    }

    #[test]
    fn layers_follow_block_naming() {
        let vgg = small().init::<TestBackend>(&Default::default()).unwrap();
        let layers = vgg.layers();
        let names: Vec<&str> = layers.iter().map(|layer| layer.name.as_str()).collect();

        assert_eq!(layers.len(), 18);
        assert_eq!(&names[..3], &["block1_conv1", "block1_conv2", "block1_pool"]);
        assert_eq!(
            &names[14..],
            &["block5_conv1", "block5_conv2", "block5_conv3", "block5_pool"]
        );
        assert!(layers.iter().all(|layer| layer.trainable));
        assert_eq!(vgg.layer_params().len(), layers.len());
    }

    #[test]
    fn layer_params_sum_to_total() {
        let vgg = small().init::<TestBackend>(&Default::default()).unwrap();

        assert_eq!(vgg.layer_params().iter().sum::<usize>(), vgg.num_params());
        // block1_conv1: 3 * 2 * 3 * 3 weights + 2 biases.
        assert_eq!(vgg.layer_params()[0], 56);
    }

    #[test]
    fn classify_without_top_is_none() {
        let device = Default::default();
        let vgg = small().init::<TestBackend>(&device).unwrap();
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);

        assert!(!vgg.has_top());
        assert!(vgg.classify(input).is_none());
    }
}
