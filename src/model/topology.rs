//! Layer-by-layer description of a network, written next to its weights for the web
//! front-end.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::GlobalPooling;
use crate::error::{Error, Result};

/// Declared sequence of layers with their hyperparameters and output shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    /// `[channels, height, width]` of the network input.
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
    /// Every stored value, running statistics included.
    pub total_params: usize,
    pub trainable_params: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Path of the layer inside the module tree, e.g. `layer1.0.conv2`.
    pub name: String,
    pub kind: LayerKind,
    /// Output shape without the batch dimension.
    pub output_shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<Activation>,
    pub params: usize,
    /// Part of `params` updated by forward passes rather than by the optimizer.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub non_trainable_params: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d,
    AvgPool2d,
    MaxPool2d,
    BatchNorm,
    Activation,
    Upsample2d,
    GlobalMaxPool,
    GlobalAvgPool,
    Flatten,
    Dense,
    Dropout,
    Add,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    Softmax,
}

impl Topology {
    pub fn layer(&self, name: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn output_shape(&self) -> &[usize] {
        self.layers
            .last()
            .map(|layer| layer.output_shape.as_slice())
            .unwrap_or(self.input_shape.as_slice())
    }
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Builds a [`Topology`] by inferring shapes layer after layer.
pub(crate) struct TopologyBuilder {
    name: String,
    input_shape: [usize; 3],
    shape: Vec<usize>,
    layers: Vec<LayerSpec>,
}

/// Spatial output size of a convolution or pooling window.
fn window_output(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if padded < kernel || stride == 0 {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl TopologyBuilder {
    pub fn new(name: &str, input_shape: [usize; 3]) -> Self {
        Self {
            name: name.to_string(),
            input_shape,
            shape: input_shape.to_vec(),
            layers: Vec::new(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Restore the running shape, e.g. to describe the second branch of a residual block.
    pub fn set_shape(&mut self, shape: Vec<usize>) {
        self.shape = shape;
    }

    fn spatial(&self, layer: &str) -> Result<[usize; 3]> {
        match self.shape.as_slice() {
            [c, h, w] => Ok([*c, *h, *w]),
            other => Err(Error::Architecture(format!(
                "{layer} expects a [C, H, W] input, got {other:?}"
            ))),
        }
    }

    fn push(
        &mut self,
        name: &str,
        kind: LayerKind,
        activation: Option<Activation>,
        params: usize,
        attributes: Vec<(&str, Value)>,
    ) {
        self.layers.push(LayerSpec {
            name: name.to_string(),
            kind,
            output_shape: self.shape.clone(),
            activation,
            params,
            non_trainable_params: 0,
            attributes: attributes
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        name: &str,
        filters: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        activation: Option<Activation>,
    ) -> Result<&mut Self> {
        let [channels, height, width] = self.spatial(name)?;
        let collapse = || {
            Error::Architecture(format!(
                "{name}: a {kernel}x{kernel} window does not fit a {height}x{width} input"
            ))
        };
        let out_h = window_output(height, kernel, stride, padding).ok_or_else(collapse)?;
        let out_w = window_output(width, kernel, stride, padding).ok_or_else(collapse)?;

        let params = kernel * kernel * channels * filters + if bias { filters } else { 0 };
        self.shape = vec![filters, out_h, out_w];
        self.push(
            name,
            LayerKind::Conv2d,
            activation,
            params,
            vec![
                ("filters", filters.into()),
                ("kernel_size", kernel.into()),
                ("stride", stride.into()),
                ("padding", padding.into()),
                ("bias", bias.into()),
            ],
        );
        Ok(self)
    }

    pub fn pool2d(
        &mut self,
        name: &str,
        kind: LayerKind,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<&mut Self> {
        let [channels, height, width] = self.spatial(name)?;
        let collapse = || {
            Error::Architecture(format!(
                "{name}: a {kernel}x{kernel} pool does not fit a {height}x{width} input"
            ))
        };
        let out_h = window_output(height, kernel, stride, padding).ok_or_else(collapse)?;
        let out_w = window_output(width, kernel, stride, padding).ok_or_else(collapse)?;

        self.shape = vec![channels, out_h, out_w];
        self.push(
            name,
            kind,
            None,
            0,
            vec![
                ("pool_size", kernel.into()),
                ("stride", stride.into()),
                ("padding", padding.into()),
            ],
        );
        Ok(self)
    }

    pub fn activation(&mut self, name: &str, activation: Activation) -> &mut Self {
        self.push(name, LayerKind::Activation, Some(activation), 0, vec![]);
        self
    }

    pub fn batch_norm(&mut self, name: &str) -> Result<&mut Self> {
        let [channels, _, _] = self.spatial(name)?;
        // gamma and beta, then the running mean and variance.
        self.push(name, LayerKind::BatchNorm, None, 4 * channels, vec![]);
        if let Some(layer) = self.layers.last_mut() {
            layer.non_trainable_params = 2 * channels;
        }
        Ok(self)
    }

    pub fn upsample(&mut self, name: &str, factor: usize) -> Result<&mut Self> {
        let [channels, height, width] = self.spatial(name)?;
        self.shape = vec![channels, height * factor, width * factor];
        self.push(
            name,
            LayerKind::Upsample2d,
            None,
            0,
            vec![("factor", factor.into()), ("interpolation", "nearest".into())],
        );
        Ok(self)
    }

    pub fn global_pool(&mut self, name: &str, pooling: GlobalPooling) -> Result<&mut Self> {
        let [channels, _, _] = self.spatial(name)?;
        self.shape = vec![channels];
        let kind = match pooling {
            GlobalPooling::Max => LayerKind::GlobalMaxPool,
            GlobalPooling::Avg => LayerKind::GlobalAvgPool,
        };
        self.push(name, kind, None, 0, vec![]);
        Ok(self)
    }

    pub fn flatten(&mut self, name: &str) -> &mut Self {
        self.shape = vec![self.shape.iter().product()];
        self.push(name, LayerKind::Flatten, None, 0, vec![]);
        self
    }

    pub fn dense(
        &mut self,
        name: &str,
        units: usize,
        activation: Option<Activation>,
    ) -> Result<&mut Self> {
        let inputs = match self.shape.as_slice() {
            [features] => *features,
            other => {
                return Err(Error::Architecture(format!(
                    "{name} expects a flat input, got {other:?}"
                )))
            }
        };

        self.shape = vec![units];
        self.push(
            name,
            LayerKind::Dense,
            activation,
            inputs * units + units,
            vec![("units", units.into())],
        );
        Ok(self)
    }

    pub fn dropout(&mut self, name: &str, rate: f64) -> &mut Self {
        self.push(name, LayerKind::Dropout, None, 0, vec![("rate", rate.into())]);
        self
    }

    pub fn add(&mut self, name: &str, activation: Option<Activation>) -> &mut Self {
        self.push(name, LayerKind::Add, activation, 0, vec![]);
        self
    }

    pub fn build(self, num_classes: usize) -> Topology {
        let total_params = self.layers.iter().map(|layer| layer.params).sum();
        let non_trainable: usize = self
            .layers
            .iter()
            .map(|layer| layer.non_trainable_params)
            .sum();

        Topology {
            name: self.name,
            input_shape: self.input_shape,
            num_classes,
            layers: self.layers,
            total_params,
            trainable_params: total_params - non_trainable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convolution_shapes_follow_window_arithmetic() {
        let mut builder = TopologyBuilder::new("net", [3, 32, 32]);
        builder
            .conv2d("conv", 8, 3, 2, 1, true, Some(Activation::Relu))
            .unwrap();

        let topology = builder.build(10);
        let conv = topology.layer("conv").unwrap();

        assert_eq!(conv.output_shape, vec![8, 16, 16]);
        assert_eq!(conv.params, 3 * 3 * 3 * 8 + 8);
    }

    #[test]
    fn collapsing_windows_are_rejected() {
        let mut builder = TopologyBuilder::new("net", [1, 4, 4]);

        let result = builder.conv2d("conv", 8, 5, 1, 0, true, None);

        assert!(matches!(result, Err(Error::Architecture(_))));
    }

    #[test]
    fn dense_layers_need_a_flat_input() {
        let mut builder = TopologyBuilder::new("net", [1, 4, 4]);
        assert!(builder.dense("fc", 10, None).is_err());

        builder.flatten("flatten");
        builder.dense("fc", 10, Some(Activation::Softmax)).unwrap();
        let topology = builder.build(10);

        assert_eq!(topology.total_params, 16 * 10 + 10);
        assert_eq!(topology.output_shape(), &[10]);
    }

    #[test]
    fn batch_norm_counts_running_statistics_as_non_trainable() {
        let mut builder = TopologyBuilder::new("net", [3, 4, 4]);
        builder
            .conv2d("conv", 8, 3, 1, 1, false, None)
            .unwrap()
            .batch_norm("bn")
            .unwrap();

        let topology = builder.build(8);
        let bn = topology.layer("bn").unwrap();

        assert_eq!(bn.params, 4 * 8);
        assert_eq!(bn.non_trainable_params, 2 * 8);
        assert_eq!(topology.total_params, 3 * 3 * 3 * 8 + 4 * 8);
        assert_eq!(topology.trainable_params, 3 * 3 * 3 * 8 + 2 * 8);
    }

    #[test]
    fn topology_serializes_with_snake_case_kinds() {
        let mut builder = TopologyBuilder::new("net", [1, 2, 2]);
        builder
            .global_pool("pool", GlobalPooling::Max)
            .unwrap()
            .dense("fc", 2, Some(Activation::Softmax))
            .unwrap();
        let json = serde_json::to_value(builder.build(2)).unwrap();

        assert_eq!(json["layers"][0]["kind"], "global_max_pool");
        assert_eq!(json["layers"][1]["activation"], "softmax");
        assert_eq!(json["layers"][1]["attributes"]["units"], 2);
    }
}
