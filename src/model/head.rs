use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, LinearRecord},
    prelude::*,
    tensor::activation::relu,
};

use super::topology::{Activation, TopologyBuilder};

/// Fully connected classification head placed on top of a pooled backbone.
#[derive(Config, Debug)]
pub struct DenseHeadConfig {
    /// Number of input features.
    pub d_input: usize,
    pub num_classes: usize,
    /// Widths of the hidden ReLU layers.
    #[config(default = "Vec::new()")]
    pub hidden: Vec<usize>,
    /// Dropout applied after every hidden layer.
    #[config(default = 0.0)]
    pub dropout: f64,
}

#[derive(Module, Debug)]
pub struct DenseHead<B: Backend> {
    hidden: Vec<Linear<B>>,
    dropout: Dropout,
    output: Linear<B>,
}

impl DenseHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DenseHead<B> {
        let mut d_input = self.d_input;
        let mut hidden = Vec::with_capacity(self.hidden.len());

        for &units in self.hidden.iter() {
            hidden.push(LinearConfig::new(d_input, units).init(device));
            d_input = units;
        }

        DenseHead {
            hidden,
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(d_input, self.num_classes).init(device),
        }
    }

    pub(crate) fn describe(
        &self,
        builder: &mut TopologyBuilder,
        prefix: &str,
    ) -> crate::Result<()> {
        for (i, &units) in self.hidden.iter().enumerate() {
            builder.dense(&format!("{prefix}.hidden.{i}"), units, Some(Activation::Relu))?;
            if self.dropout > 0.0 {
                builder.dropout(&format!("{prefix}.dropout.{i}"), self.dropout);
            }
        }
        builder.dense(
            &format!("{prefix}.output"),
            self.num_classes,
            Some(Activation::Softmax),
        )?;

        Ok(())
    }
}

impl<B: Backend> DenseHead<B> {
    /// Replace the weights of the output layer, e.g. with a pretrained classifier.
    pub fn load_output(mut self, record: LinearRecord<B>) -> Self {
        self.output = self.output.load_record(record);
        self
    }

    pub fn output(&self) -> &Linear<B> {
        &self.output
    }

    pub fn num_hidden(&self) -> usize {
        self.hidden.len()
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = features;

        for linear in self.hidden.iter() {
            x = relu(linear.forward(x));
            x = self.dropout.forward(x);
        }

        self.output.forward(x)
    }
}
