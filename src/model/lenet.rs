use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig},
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::sigmoid,
};

use super::topology::{Activation, LayerKind, TopologyBuilder};
use super::{classification_steps, Classifier, Topology};

/// LeNet-5: three tanh convolutions with average pooling, then two dense layers.
#[derive(Config, Debug)]
pub struct LeNetConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 1)]
    pub in_channels: usize,
    /// Spatial size of the network input.
    #[config(default = "[32, 32]")]
    pub input_size: [usize; 2],
}

#[derive(Module, Debug)]
pub struct LeNet<B: Backend> {
    conv1: Conv2d<B>,
    pool1: AvgPool2d,
    conv2: Conv2d<B>,
    pool2: AvgPool2d,
    conv3: Conv2d<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl LeNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LeNet<B> {
        let pool = AvgPool2dConfig::new([2, 2]).with_strides([2, 2]);
        // conv3 output size: three valid 5x5 convolutions and two 2x2 pools.
        let [height, width] = self
            .input_size
            .map(|size| ((size.saturating_sub(4) / 2).saturating_sub(4) / 2).saturating_sub(4));

        LeNet {
            conv1: Conv2dConfig::new([self.in_channels, 6], [5, 5]).init(device),
            pool1: pool.init(),
            conv2: Conv2dConfig::new([6, 16], [5, 5]).init(device),
            pool2: pool.init(),
            conv3: Conv2dConfig::new([16, 120], [5, 5]).init(device),
            fc1: LinearConfig::new(120 * height * width, 84).init(device),
            fc2: LinearConfig::new(84, self.num_classes).init(device),
        }
    }

    pub fn topology(&self, input_shape: [usize; 3]) -> crate::Result<Topology> {
        let mut builder = TopologyBuilder::new("lenet", input_shape);
        builder
            .conv2d("conv1", 6, 5, 1, 0, true, Some(Activation::Tanh))?
            .pool2d("pool1", LayerKind::AvgPool2d, 2, 2, 0)?
            .activation("sigmoid1", Activation::Sigmoid)
            .conv2d("conv2", 16, 5, 1, 0, true, Some(Activation::Tanh))?
            .pool2d("pool2", LayerKind::AvgPool2d, 2, 2, 0)?
            .activation("sigmoid2", Activation::Sigmoid)
            .conv2d("conv3", 120, 5, 1, 0, true, Some(Activation::Tanh))?
            .flatten("flatten")
            .dense("fc1", 84, Some(Activation::Tanh))?
            .dense("fc2", self.num_classes, Some(Activation::Softmax))?;

        Ok(builder.build(self.num_classes))
    }
}

impl<B: Backend> Classifier<B> for LeNet<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images).tanh();
        let x = sigmoid(self.pool1.forward(x));
        let x = self.conv2.forward(x).tanh();
        let x = sigmoid(self.pool2.forward(x));
        let x = self.conv3.forward(x).tanh();

        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);

        let x = self.fc1.forward(x).tanh();
        self.fc2.forward(x)
    }
}

classification_steps!(LeNet);
