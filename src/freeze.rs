//! Layer descriptors and the freezing policy.
//!
//! Trainability is tracked by an explicit, ordered list of [LayerSpec] rather
//! than by flipping flags on the module tree by position. The policy is a pure
//! function over that list; [TransferModel::with_layers](crate::model::TransferModel::with_layers)
//! then applies the list to the burn module.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a pretrained layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Conv,
    Pool,
    Flatten,
    Dense,
}

impl LayerKind {
    /// Whether the layer owns parameters the optimizer could update.
    pub fn has_params(&self) -> bool {
        matches!(self, Self::Conv | Self::Dense)
    }
}

/// Describes one pretrained layer and whether it is trainable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    pub trainable: bool,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            trainable: true,
        }
    }

    pub fn frozen(mut self) -> Self {
        self.trainable = false;
        self
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.trainable { "trainable" } else { "frozen" };
        write!(f, "{:<14} {:<8} {state}", self.name, format!("{:?}", self.kind))
    }
}

/// Marks every layer except the last `keep` as non-trainable.
///
/// `keep` is a manual hyperparameter. With the default of 4 on VGG16 this
/// leaves the last convolutional block (three convolutions and its pool)
/// trainable. The last `keep` layers keep whatever flag they already had.
pub fn freeze_all_but_last(mut layers: Vec<LayerSpec>, keep: usize) -> Vec<LayerSpec> {
    let frozen = layers.len().saturating_sub(keep);

    for layer in layers.iter_mut().take(frozen) {
        layer.trainable = false;
    }

    layers
}

/// Number of layers reporting non-trainable.
pub fn count_frozen(layers: &[LayerSpec]) -> usize {
    layers.iter().filter(|layer| !layer.trainable).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn layers(count: usize) -> Vec<LayerSpec> {
        (0..count)
            .map(|i| LayerSpec::new(format!("layer{i}"), LayerKind::Conv))
            .collect()
    }

    #[rstest]
    #[case(18, 4)]
    #[case(18, 0)]
    #[case(18, 18)]
    #[case(3, 4)]
    #[case(0, 4)]
    fn freezes_exactly_all_but_last(#[case] total: usize, #[case] keep: usize) {
        let result = freeze_all_but_last(layers(total), keep);

        assert_eq!(result.len(), total);
        assert_eq!(count_frozen(&result), total.saturating_sub(keep));
        assert_eq!(
            result.iter().filter(|layer| layer.trainable).count(),
            total.min(keep)
        );
    }

    #[test]
    fn frozen_layers_are_the_leading_ones() {
        let result = freeze_all_but_last(layers(6), 2);
        let flags: Vec<bool> = result.iter().map(|layer| layer.trainable).collect();

        assert_eq!(flags, vec![false, false, false, false, true, true]);
    }

    #[test]
    fn kept_layers_are_not_unfrozen() {
        let mut input = layers(3);
        input[2] = input[2].clone().frozen();

        let result = freeze_all_but_last(input, 2);

        assert!(!result[0].trainable);
        assert!(result[1].trainable);
        assert!(!result[2].trainable);
    }

    #[test]
    fn display() {
        let layer = LayerSpec::new("block1_conv1", LayerKind::Conv).frozen();

        assert_eq!(layer.to_string(), "block1_conv1   Conv     frozen");
    }
}
