//! Network topologies assembled from the framework's pre-built layers.

mod head;
mod lenet;
mod resnet;
pub mod topology;
mod vgg;

pub use head::*;
pub use lenet::*;
pub use resnet::*;
pub use topology::{Activation, LayerKind, LayerSpec, Topology};
pub use vgg::*;

use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::activation::softmax,
    train::ClassificationOutput,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Image classifier producing one logit per class.
pub trait Classifier<B: Backend>: Module<B> {
    /// `[batch, channels, height, width]` -> `[batch, num_classes]`
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Class probabilities, the softmax output of the exported network.
    fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.logits(images), 1)
    }

    fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.logits(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// Implements the learner's train and validation steps for a [`Classifier`].
macro_rules! classification_steps {
    ($model:ident) => {
        impl<B: burn::tensor::backend::AutodiffBackend>
            burn::train::TrainStep<
                crate::data::ImageBatch<B>,
                burn::train::ClassificationOutput<B>,
            > for $model<B>
        {
            fn step(
                &self,
                batch: crate::data::ImageBatch<B>,
            ) -> burn::train::TrainOutput<burn::train::ClassificationOutput<B>> {
                let item = self.forward_classification(batch.images, batch.targets);

                burn::train::TrainOutput::new(self, item.loss.backward(), item)
            }
        }

        impl<B: burn::tensor::backend::Backend>
            burn::train::ValidStep<
                crate::data::ImageBatch<B>,
                burn::train::ClassificationOutput<B>,
            > for $model<B>
        {
            fn step(
                &self,
                batch: crate::data::ImageBatch<B>,
            ) -> burn::train::ClassificationOutput<B> {
                self.forward_classification(batch.images, batch.targets)
            }
        }
    };
}

pub(crate) use classification_steps;

/// Reduction of the spatial dimensions before the dense head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalPooling {
    Max,
    Avg,
}

impl GlobalPooling {
    /// `[batch, channels, height, width]` -> `[batch, channels]`
    pub fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels, height * width]);

        let pooled = match self {
            GlobalPooling::Max => x.max_dim(2),
            GlobalPooling::Avg => x.mean_dim(2),
        };

        pooled.reshape([batch, channels])
    }
}

/// Network selected by a recipe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Architecture {
    LeNet(LeNetConfig),
    Vgg16(VggConfig),
    ResNet(ResNetConfig),
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::LeNet(_) => "lenet",
            Architecture::Vgg16(_) => "vgg16",
            Architecture::ResNet(config) => config.name(),
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Architecture::LeNet(config) => config.num_classes,
            Architecture::Vgg16(config) => config.num_classes,
            Architecture::ResNet(config) => config.num_classes,
        }
    }

    /// Describe the network for inputs of `input_shape` (`[C, H, W]`).
    pub fn topology(&self, input_shape: [usize; 3]) -> Result<Topology> {
        match self {
            Architecture::LeNet(config) => config.topology(input_shape),
            Architecture::Vgg16(config) => config.topology(input_shape),
            Architecture::ResNet(config) => config.topology(input_shape),
        }
    }
}
