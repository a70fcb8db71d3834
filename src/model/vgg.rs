use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::relu,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::topology::{Activation, LayerKind, TopologyBuilder};
use super::{classification_steps, Classifier, DenseHead, DenseHeadConfig, GlobalPooling, Topology};

/// Output channels of the 13 VGG16 convolutions.
pub const VGG16_CHANNELS: [usize; 13] = [
    64, 64, 128, 128, 256, 256, 256, 512, 512, 512, 512, 512, 512,
];

/// Convolutions followed by a 2x2 max pooling.
const POOL_AFTER: [usize; 5] = [1, 3, 6, 9, 12];

/// VGG16 convolutional backbone with a pooled dense head.
#[derive(Config, Debug)]
pub struct VggConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    /// Nearest-neighbour x2 upsampling of the input before the backbone.
    #[config(default = false)]
    pub upsample: bool,
    #[config(default = "GlobalPooling::Max")]
    pub pooling: GlobalPooling,
    /// Hidden dense layers of the head.
    #[config(default = "Vec::new()")]
    pub hidden: Vec<usize>,
    #[config(default = 0.0)]
    pub dropout: f64,
}

/// The 13 convolutions of VGG16, 3x3 with same padding, ReLU activations.
#[derive(Module, Debug)]
pub struct VggFeatures<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    features: VggFeatures<B>,
    pooling: Ignored<GlobalPooling>,
    upsample: Ignored<bool>,
    head: DenseHead<B>,
}

impl VggConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16<B> {
        Vgg16 {
            features: VggFeatures::new(self.in_channels, device),
            pooling: Ignored(self.pooling),
            upsample: Ignored(self.upsample),
            head: self.head().init(device),
        }
    }

    fn head(&self) -> DenseHeadConfig {
        DenseHeadConfig::new(VGG16_CHANNELS[12], self.num_classes)
            .with_hidden(self.hidden.clone())
            .with_dropout(self.dropout)
    }

    pub fn topology(&self, input_shape: [usize; 3]) -> crate::Result<Topology> {
        let mut builder = TopologyBuilder::new("vgg16", input_shape);

        if self.upsample {
            builder.upsample("upsample", 2)?;
        }

        for (i, &filters) in VGG16_CHANNELS.iter().enumerate() {
            builder.conv2d(
                &format!("features.convs.{i}"),
                filters,
                3,
                1,
                1,
                true,
                Some(Activation::Relu),
            )?;
            if POOL_AFTER.contains(&i) {
                builder.pool2d(&format!("features.pool.{i}"), LayerKind::MaxPool2d, 2, 2, 0)?;
            }
        }

        builder.global_pool("pooling", self.pooling)?;
        self.head().describe(&mut builder, "head")?;

        Ok(builder.build(self.num_classes))
    }
}

impl<B: Backend> VggFeatures<B> {
    pub fn new(in_channels: usize, device: &B::Device) -> Self {
        let mut channels = in_channels;
        let convs = VGG16_CHANNELS
            .iter()
            .map(|&filters| {
                let conv = Conv2dConfig::new([channels, filters], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device);
                channels = filters;
                conv
            })
            .collect();

        Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;

        for (i, conv) in self.convs.iter().enumerate() {
            x = relu(conv.forward(x));
            if POOL_AFTER.contains(&i) {
                x = self.pool.forward(x);
            }
        }

        x
    }
}

impl<B: Backend> Vgg16<B> {
    /// Keep the convolutional backbone fixed, only the head is trained.
    pub fn freeze_backbone(mut self) -> Self {
        self.features = self.features.no_grad();
        self
    }

    pub fn features(&self) -> &VggFeatures<B> {
        &self.features
    }

    pub fn with_features(mut self, features: VggFeatures<B>) -> Self {
        self.features = features;
        self
    }
}

impl<B: Backend> Classifier<B> for Vgg16<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = if self.upsample.0 {
            let [_, _, height, width] = images.dims();
            interpolate(
                images,
                [height * 2, width * 2],
                InterpolateOptions::new(InterpolateMode::Nearest),
            )
        } else {
            images
        };

        let x = self.features.forward(x);
        let x = self.pooling.0.apply(x);

        self.head.forward(x)
    }
}

classification_steps!(Vgg16);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageBatch;
    use crate::pretrained::{self, state_dict};
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::Distribution,
        train::TrainStep,
    };

    type B = NdArray<f32>;

    /// Positions of the convolutions in torchvision's `features` sequence.
    const TORCHVISION_FEATURES: [usize; 13] = [0, 2, 5, 7, 10, 12, 14, 17, 19, 21, 24, 26, 28];

    #[test]
    fn vgg16_topology_matches_the_module() {
        let device = Default::default();
        let config = VggConfig::new();
        let model = config.init::<B>(&device);

        let topology = config.topology([3, 32, 32]).unwrap();

        assert_eq!(topology.total_params, 14_714_688 + 512 * 10 + 10);
        assert_eq!(topology.total_params, model.num_params());
        assert_eq!(
            topology.layer("features.pool.12").unwrap().output_shape,
            vec![512, 1, 1]
        );
    }

    #[test]
    fn cifar_head_describes_hidden_layers_and_dropout() {
        let config = VggConfig::new()
            .with_upsample(true)
            .with_pooling(GlobalPooling::Avg)
            .with_hidden(vec![512, 256])
            .with_dropout(0.2);

        let topology = config.topology([3, 32, 32]).unwrap();

        assert_eq!(topology.layers[0].output_shape, vec![3, 64, 64]);
        assert_eq!(
            topology.layer("features.pool.12").unwrap().output_shape,
            vec![512, 2, 2]
        );
        assert!(topology.layer("head.dropout.1").is_some());
        assert_eq!(topology.output_shape(), &[10]);
    }

    #[test]
    fn vgg16_needs_at_least_32_pixels() {
        assert!(VggConfig::new().topology([3, 16, 16]).is_err());
    }

    #[test]
    fn vgg16_forward_with_upsampling() {
        let device = Default::default();
        let model = VggConfig::new()
            .with_upsample(true)
            .with_pooling(GlobalPooling::Avg)
            .with_hidden(vec![8])
            .init::<B>(&device);

        let logits = model.logits(Tensor::zeros([1, 3, 32, 32], &device));

        assert_eq!(logits.dims(), [1, 10]);
    }

    #[test]
    fn torchvision_features_are_imported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vgg16.pth");
        let device = Default::default();
        let source = VggConfig::new().init::<B>(&device);

        let mut tensors = Vec::new();
        for (conv, index) in source.features.convs.iter().zip(TORCHVISION_FEATURES) {
            let bias = conv.bias.as_ref().unwrap().val();
            let weight = conv.weight.val();
            tensors.push((format!("features.{index}.weight"), weight.into_data()));
            tensors.push((format!("features.{index}.bias"), bias.into_data()));
        }
        // The ImageNet classifier is not part of the backbone.
        tensors.push((
            "classifier.6.bias".to_string(),
            Tensor::<B, 1>::ones([1000], &device).into_data(),
        ));
        state_dict::write(&path, tensors);

        let model = VggConfig::new().init::<B>(&device);
        let head_before = model.head.output().weight.val().into_data();
        let loaded = pretrained::load_vgg16(model, &path, &device).unwrap();

        let convs = source.features.convs.iter().zip(loaded.features.convs.iter());
        for (expected, actual) in convs {
            actual
                .weight
                .val()
                .into_data()
                .assert_eq(&expected.weight.val().into_data(), true);
            actual
                .bias
                .as_ref()
                .unwrap()
                .val()
                .into_data()
                .assert_eq(&expected.bias.as_ref().unwrap().val().into_data(), true);
        }
        loaded
            .head
            .output()
            .weight
            .val()
            .into_data()
            .assert_eq(&head_before, true);
    }

    #[test]
    fn frozen_features_receive_no_gradients() {
        let device = Default::default();
        let model = VggConfig::new()
            .with_hidden(vec![8])
            .init::<Autodiff<B>>(&device)
            .freeze_backbone();
        let batch = ImageBatch {
            images: Tensor::random([1, 3, 32, 32], Distribution::Default, &device),
            targets: Tensor::from_ints([4], &device),
        };

        let grads = TrainStep::step(&model, batch).grads;

        for conv in model.features.convs.iter() {
            assert!(grads.get::<B, 4>(conv.weight.id.clone()).is_none());
        }
        let output = model.head.output();
        assert!(grads.get::<B, 2>(output.weight.id.clone()).is_some());
    }
}
