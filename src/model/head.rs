use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Configuration to create a [classification head](ClassifierHead).
#[derive(Config, Debug)]
pub struct HeadConfig {
    /// Width of the flattened feature map fed to the head.
    pub input_features: usize,
    #[config(default = 256)]
    pub hidden: usize,
    #[config(default = 10)]
    pub classes: usize,
}

impl HeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            hidden: LinearConfig::new(self.input_features, self.hidden).init(device),
            output: LinearConfig::new(self.hidden, self.classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// Flatten, one hidden dense layer with ReLU, then a dense layer with one
/// output per class.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub hidden: Linear<B>,
    pub output: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// Unnormalized class scores.
    ///
    /// # Shapes
    ///
    /// - features: `[batch_size, channels, height, width]`
    /// - output: `[batch_size, classes]`
    pub fn forward_logits(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = features.flatten::<2>(1, 3);
        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);

        self.output.forward(x)
    }

    /// Class probabilities; every row is non-negative and sums to one.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(features), 1)
    }

    pub fn input_features(&self) -> usize {
        self.hidden.weight.dims()[0]
    }

    pub fn classes(&self) -> usize {
        self.output.weight.dims()[1]
    }
}
