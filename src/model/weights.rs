//! Pretrained weights for the VGG16 extractor.
//!
//! Weight files follow the torchvision layout (`features.N.weight`,
//! `classifier.N.weight`, ...). Keys are remapped onto the module tree of
//! [Vgg16](super::Vgg16) before the record is loaded.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use super::vgg::{Vgg16, Vgg16Record, CONVS_PER_BLOCK};
use crate::error::{Result, TransferError};

/// Index of the dense layers inside torchvision's `classifier` sequence.
const CLASSIFIER_LAYERS: [(usize, &str); 3] = [(0, "fc1"), (3, "fc2"), (6, "predictions")];

/// Where the extractor weights come from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WeightSource {
    /// Keep the random initialization.
    #[default]
    Random,
    /// A PyTorch checkpoint (`.pt` / `.pth`).
    PyTorch(PathBuf),
}

impl WeightSource {
    pub fn is_pretrained(&self) -> bool {
        !matches!(self, Self::Random)
    }

    /// Load the weights into `model`.
    ///
    /// A missing file or a record that does not fit the model is an error;
    /// nothing falls back to random weights.
    pub fn load_into<B: Backend>(&self, model: Vgg16<B>, device: &B::Device) -> Result<Vgg16<B>> {
        let remaps = torchvision_key_remaps(model.has_top());

        let record: Vgg16Record<B> = match self {
            Self::Random => return Ok(model),
            Self::PyTorch(path) => {
                ensure_exists(path)?;
                let args = remaps
                    .iter()
                    .fold(LoadArgs::new(path.clone()), |args, (pattern, replacement)| {
                        args.with_key_remap(pattern, replacement)
                    });

                PyTorchFileRecorder::<FullPrecisionSettings>::default()
                    .load(args, device)
                    .map_err(|err| load_error(path, err))?
            }
        };

        log::info!("Loaded pretrained weights from {self}");

        Ok(model.load_record(record))
    }
}

impl std::fmt::Display for WeightSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random initialization"),
            Self::PyTorch(path) => write!(f, "PyTorch file '{}'", path.display()),
        }
    }
}

/// Regex remaps from torchvision VGG16 keys to the [Vgg16] module tree.
///
/// torchvision interleaves ReLU and pooling layers in `features`, so each
/// convolution uses two slots and each pool one.
pub fn torchvision_key_remaps(include_top: bool) -> Vec<(String, String)> {
    let mut remaps = Vec::new();
    let mut index = 0;

    for (block, num_convs) in CONVS_PER_BLOCK.into_iter().enumerate() {
        for conv in 0..num_convs {
            remaps.push((
                format!("^features\\.{index}\\.(.+)$"),
                format!("blocks.{block}.convs.{conv}.$1"),
            ));
            index += 2;
        }
        index += 1;
    }

    if include_top {
        for (index, name) in CLASSIFIER_LAYERS {
            remaps.push((
                format!("^classifier\\.{index}\\.(.+)$"),
                format!("top.{name}.$1"),
            ));
        }
    }

    remaps
}

fn ensure_exists(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(TransferError::WeightsUnavailable {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

fn load_error(path: &Path, err: impl std::fmt::Display) -> TransferError {
    TransferError::Weights {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
