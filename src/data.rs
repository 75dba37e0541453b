//! Digit datasets and their preprocessing into model input.

use std::ops::Range;

use burn::data::dataset::vision::{MnistDataset, MnistItem};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, TransferError};
use crate::model::InputShape;

/// Side of a native MNIST image.
pub const MNIST_SIZE: usize = 28;

/// A batch of single-channel images with `u8` intensities, stored row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImages {
    count: usize,
    height: usize,
    width: usize,
    pixels: Vec<u8>,
}

impl RawImages {
    pub fn new(count: usize, height: usize, width: usize, pixels: Vec<u8>) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(TransferError::InvalidImages(format!(
                "image size must be positive, got {height}x{width}"
            )));
        }
        if pixels.len() != count * height * width {
            return Err(TransferError::InvalidImages(format!(
                "expected {count} images of {height}x{width} ({} pixels), got {} pixels",
                count * height * width,
                pixels.len()
            )));
        }

        Ok(Self {
            count,
            height,
            width,
            pixels,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Pixels of one image.
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let size = self.height * self.width;
        self.pixels.get(index * size..(index + 1) * size)
    }

    /// The first `count` images (all of them if there are fewer).
    pub fn take(&self, count: usize) -> Self {
        let count = count.min(self.count);

        Self {
            count,
            height: self.height,
            width: self.width,
            pixels: self.pixels[..count * self.height * self.width].to_vec(),
        }
    }
}

/// Images with one class label each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabeledImages {
    pub images: RawImages,
    pub labels: Vec<u8>,
}

impl LabeledImages {
    pub fn new(images: RawImages, labels: Vec<u8>) -> Result<Self> {
        if images.count() != labels.len() {
            return Err(TransferError::InvalidImages(format!(
                "{} images but {} labels",
                images.count(),
                labels.len()
            )));
        }

        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// A fixed prefix of the split.
    pub fn take(&self, count: usize) -> Self {
        let images = self.images.take(count);
        let labels = self.labels[..images.count()].to_vec();

        Self { images, labels }
    }
}

/// Train and test splits as handed out by a dataset provider.
#[derive(Clone, Debug)]
pub struct DigitSplits {
    pub train: LabeledImages,
    pub test: LabeledImages,
}

/// Provides the labeled digit images.
pub trait DigitSource {
    fn load(&self) -> Result<DigitSplits>;
}

/// The MNIST dataset, downloaded and cached by burn's dataset crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct MnistSource;

impl DigitSource for MnistSource {
    fn load(&self) -> Result<DigitSplits> {
        log::info!("Loading MNIST");

        let train = labeled_from_dataset(&MnistDataset::train())?;
        let test = labeled_from_dataset(&MnistDataset::test())?;

        log::info!(
            "MNIST loaded: {} train and {} test images",
            train.len(),
            test.len()
        );

        Ok(DigitSplits { train, test })
    }
}

fn labeled_from_dataset<D: Dataset<MnistItem>>(dataset: &D) -> Result<LabeledImages> {
    let mut pixels = Vec::with_capacity(dataset.len() * MNIST_SIZE * MNIST_SIZE);
    let mut labels = Vec::with_capacity(dataset.len());

    for item in dataset.iter() {
        // Intensities are stored as floats in 0..=255.
        pixels.extend(item.image.iter().flatten().map(|pixel| *pixel as u8));
        labels.push(item.label);
    }

    let images = RawImages::new(labels.len(), MNIST_SIZE, MNIST_SIZE, pixels)?;
    LabeledImages::new(images, labels)
}

/// Splits already held in memory.
#[derive(Clone, Debug)]
pub struct InMemorySource {
    splits: DigitSplits,
}

impl InMemorySource {
    pub fn new(splits: DigitSplits) -> Self {
        Self { splits }
    }
}

impl DigitSource for InMemorySource {
    fn load(&self) -> Result<DigitSplits> {
        Ok(self.splits.clone())
    }
}

/// Configuration of the image and label preprocessing.
#[derive(Config, Debug)]
pub struct PreprocessConfig {
    /// Zero margin added on every side. 2 turns 28x28 digits into 32x32.
    #[config(default = 2)]
    pub padding: usize,
    /// Number of identical channels produced from the single input channel.
    #[config(default = 3)]
    pub channels: usize,
    /// Length of the one-hot label vectors.
    #[config(default = 10)]
    pub classes: usize,
}

impl PreprocessConfig {
    /// Shape of the preprocessed images for raw images of the given size.
    pub fn output_shape(&self, height: usize, width: usize) -> InputShape {
        InputShape::new(
            height + 2 * self.padding,
            width + 2 * self.padding,
            self.channels,
        )
    }
}

/// Widen to float, zero-pad and replicate the channel.
///
/// # Shapes
///
/// - output: `[count, channels, height + 2 * padding, width + 2 * padding]`
pub fn prepare_images<B: Backend>(
    raw: &RawImages,
    config: &PreprocessConfig,
    device: &B::Device,
) -> Tensor<B, 4> {
    let data = TensorData::new(
        raw.pixels().to_vec(),
        [raw.count(), raw.height(), raw.width()],
    );
    let padding = config.padding;

    Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device)
        .pad((padding, padding, padding, padding), 0.0)
        .unsqueeze_dim::<4>(1)
        .repeat_dim(1, config.channels)
}

/// One-hot encode class labels.
///
/// # Shapes
///
/// - output: `[labels.len(), classes]`
pub fn one_hot<B: Backend>(
    labels: &[u8],
    classes: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let mut values = vec![0f32; labels.len() * classes];

    for (index, &label) in labels.iter().enumerate() {
        if label as usize >= classes {
            return Err(TransferError::LabelOutOfRange {
                index,
                label,
                classes,
            });
        }
        values[index * classes + label as usize] = 1.0;
    }

    let data = TensorData::new(values, [labels.len(), classes]);
    Ok(Tensor::from_data(data.convert::<B::FloatElem>(), device))
}

/// Images and one-hot targets ready for the model.
#[derive(Clone, Debug)]
pub struct PreparedData<B: Backend> {
    /// `[count, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[count, classes]`
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> PreparedData<B> {
    pub fn new(images: Tensor<B, 4>, targets: Tensor<B, 2>) -> Result<Self> {
        let [images_count, ..] = images.dims();
        let [targets_count, _] = targets.dims();

        if images_count != targets_count {
            return Err(TransferError::ShapeMismatch {
                context: "targets",
                expected: vec![images_count],
                actual: vec![targets_count],
            });
        }

        Ok(Self { images, targets })
    }

    /// Preprocess a labeled split for a model accepting `expected` input.
    ///
    /// Fails before touching any tensor when the padded size or the channel
    /// count differs from `expected`.
    pub fn prepare(
        split: &LabeledImages,
        config: &PreprocessConfig,
        expected: InputShape,
        device: &B::Device,
    ) -> Result<Self> {
        if split.is_empty() {
            return Err(TransferError::InvalidImages("empty split".to_string()));
        }

        let produced = config.output_shape(split.images.height(), split.images.width());
        if produced != expected {
            return Err(TransferError::ShapeMismatch {
                context: "preprocessed images (height, width, channels)",
                expected: expected.dims().to_vec(),
                actual: produced.dims().to_vec(),
            });
        }

        let images = prepare_images(&split.images, config, device);
        let targets = one_hot(&split.labels, config.classes, device)?;

        Self::new(images, targets)
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn classes(&self) -> usize {
        self.targets.dims()[1]
    }

    /// Examples at the given indices, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let device = self.images.device();
        let indices: Vec<i64> = indices.iter().map(|index| *index as i64).collect();
        let count = indices.len();
        let indices = Tensor::<B, 1, Int>::from_data(
            TensorData::new(indices, [count]).convert::<B::IntElem>(),
            &device,
        );

        Self {
            images: self.images.clone().select(0, indices.clone()),
            targets: self.targets.clone().select(0, indices),
        }
    }

    /// A contiguous run of examples.
    pub fn range(&self, range: Range<usize>) -> Self {
        Self {
            images: self.images.clone().slice([range.clone()]),
            targets: self.targets.clone().slice([range]),
        }
    }

    /// Split off the last `fraction` of the examples for validation.
    ///
    /// Examples are not shuffled first, so the validation part is the tail
    /// of the data.
    pub fn split_validation(&self, fraction: f64) -> Result<(Self, Self)> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(TransferError::InvalidConfig(format!(
                "validation fraction must be in (0, 1), got {fraction}"
            )));
        }

        let len = self.len();
        let split_at = (len as f64 * (1.0 - fraction)).floor() as usize;
        if split_at == 0 || split_at == len {
            return Err(TransferError::InvalidConfig(format!(
                "validation fraction {fraction} leaves an empty split of {len} examples"
            )));
        }

        Ok((self.range(0..split_at), self.range(split_at..len)))
    }
}

impl<B: AutodiffBackend> PreparedData<B> {
    /// The same data on the inner backend, for evaluation.
    pub fn inner(self) -> PreparedData<B::InnerBackend> {
        PreparedData {
            images: self.images.inner(),
            targets: self.targets.inner(),
        }
    }
}

/// Deterministic digit-shaped data for tests.
#[cfg(test)]
pub(crate) fn synthetic_digits(count: usize, size: usize) -> LabeledImages {
    let mut pixels = Vec::with_capacity(count * size * size);

    for index in 0..count {
        for y in 0..size {
            for x in 0..size {
                pixels.push(((index * 31 + y * 7 + x * 3) % 256) as u8);
            }
        }
    }

    let labels = (0..count).map(|index| (index % 10) as u8).collect();
    LabeledImages::new(RawImages::new(count, size, size, pixels).unwrap(), labels).unwrap()
}
