//! Re-purpose a VGG16 network pretrained on natural images to classify
//! handwritten digits.
//!
//! The experiment runs as a linear sequence of stages, each taking its model,
//! configuration and device explicitly:
//!
//! 1. build the [extractor](model::ExtractorConfig) and load its
//!    [pretrained weights](model::WeightSource),
//! 2. put a new [classification head](model::ClassifierHead) on it,
//! 3. [freeze](freeze::freeze_all_but_last) all but the last layers,
//! 4. [preprocess](data::PreparedData::prepare) the digits to the extractor input,
//! 5. [train](training::fit) and [evaluate](training::evaluate),
//! 6. [report](report::plot_history) the learning curves.
//!
//! [pipeline::run] chains them.

pub mod data;
pub mod error;
pub mod freeze;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod training;

pub use error::{Result, TransferError};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
