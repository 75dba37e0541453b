use std::path::PathBuf;

/// Errors raised while building, feeding, or training the transfer model.
///
/// Variants fall into three groups: construction errors (the requested
/// configuration cannot be built), data-shape errors (the data does not fit the
/// built model) and runtime errors (training, tensors, files, plots). All of
/// them are fatal for a run.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("invalid input shape {height}x{width}x{channels}: {reason}")]
    InvalidInputShape {
        height: usize,
        width: usize,
        channels: usize,
        reason: String,
    },

    #[error("classification head expects {expected} input features but the extractor yields {actual}")]
    IncompatibleHead { expected: usize, actual: usize },

    #[error("layer list does not match the extractor: {0}")]
    LayerMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pretrained weights not found at '{}'", path.display())]
    WeightsUnavailable { path: PathBuf },

    #[error("failed to load pretrained weights from '{}': {reason}", path.display())]
    Weights { path: PathBuf, reason: String },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("label {label} at index {index} is outside [0, {classes})")]
    LabelOutOfRange {
        index: usize,
        label: u8,
        classes: usize,
    },

    #[error("invalid image batch: {0}")]
    InvalidImages(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("plot error: {0}")]
    Plot(String),
}

impl TransferError {
    /// True for errors detected before any computation starts.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::InvalidInputShape { .. }
                | Self::IncompatibleHead { .. }
                | Self::LayerMismatch(_)
                | Self::InvalidConfig(_)
                | Self::WeightsUnavailable { .. }
                | Self::Weights { .. }
        )
    }

    /// True for errors caused by data that does not fit the model.
    pub fn is_data_shape(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. } | Self::LabelOutOfRange { .. } | Self::InvalidImages(_)
        )
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
