use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use super::topology::{Activation, LayerKind, TopologyBuilder};
use super::{classification_steps, Classifier, DenseHead, DenseHeadConfig, GlobalPooling, Topology};
use crate::error::Error;

const EXPANSION: usize = 4;
const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
const STEM_CHANNELS: usize = 64;

/// Bottleneck residual network (ResNet v1.5, stride on the 3x3 convolution).
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Number of bottleneck blocks in each of the four stages.
    #[config(default = "[3, 4, 6, 3]")]
    pub blocks: [usize; 4],
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = "GlobalPooling::Max")]
    pub pooling: GlobalPooling,
}

impl ResNetConfig {
    pub fn resnet50(num_classes: usize) -> Self {
        Self::new().with_num_classes(num_classes)
    }

    pub fn resnet101(num_classes: usize) -> Self {
        Self::new()
            .with_blocks([3, 4, 23, 3])
            .with_num_classes(num_classes)
    }

    pub fn resnet152(num_classes: usize) -> Self {
        Self::new()
            .with_blocks([3, 8, 36, 3])
            .with_num_classes(num_classes)
    }

    pub fn name(&self) -> &'static str {
        match self.blocks {
            [3, 4, 6, 3] => "resnet50",
            [3, 4, 23, 3] => "resnet101",
            [3, 8, 36, 3] => "resnet152",
            _ => "resnet",
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        ResNet {
            backbone: ResNetBackbone::new(self, device),
            pooling: Ignored(self.pooling),
            head: self.head().init(device),
        }
    }

    fn head(&self) -> DenseHeadConfig {
        DenseHeadConfig::new(STAGE_WIDTHS[3] * EXPANSION, self.num_classes)
    }

    pub fn topology(&self, input_shape: [usize; 3]) -> crate::Result<Topology> {
        if self.blocks.contains(&0) {
            return Err(Error::Architecture(format!(
                "Every ResNet stage needs at least one block, got {:?}",
                self.blocks
            )));
        }

        let mut builder = TopologyBuilder::new(self.name(), input_shape);
        builder
            .conv2d("backbone.conv1", STEM_CHANNELS, 7, 2, 3, false, None)?
            .batch_norm("backbone.bn1")?
            .activation("backbone.relu", Activation::Relu)
            .pool2d("backbone.maxpool", LayerKind::MaxPool2d, 3, 2, 1)?;

        for (stage, (&width, &count)) in STAGE_WIDTHS.iter().zip(self.blocks.iter()).enumerate() {
            for block in 0..count {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                let prefix = format!("backbone.layer{}.{block}", stage + 1);
                describe_bottleneck(&mut builder, &prefix, width, stride)?;
            }
        }

        builder.global_pool("pooling", self.pooling)?;
        self.head().describe(&mut builder, "head")?;

        Ok(builder.build(self.num_classes))
    }
}

fn describe_bottleneck(
    builder: &mut TopologyBuilder,
    prefix: &str,
    width: usize,
    stride: usize,
) -> crate::Result<()> {
    let input = builder.shape().to_vec();
    let in_channels = input[0];

    builder
        .conv2d(&format!("{prefix}.conv1"), width, 1, 1, 0, false, None)?
        .batch_norm(&format!("{prefix}.bn1"))?
        .conv2d(&format!("{prefix}.conv2"), width, 3, stride, 1, false, None)?
        .batch_norm(&format!("{prefix}.bn2"))?
        .conv2d(&format!("{prefix}.conv3"), width * EXPANSION, 1, 1, 0, false, None)?
        .batch_norm(&format!("{prefix}.bn3"))?;

    if stride != 1 || in_channels != width * EXPANSION {
        let output = builder.shape().to_vec();
        builder.set_shape(input);
        builder
            .conv2d(
                &format!("{prefix}.downsample.conv"),
                width * EXPANSION,
                1,
                stride,
                0,
                false,
                None,
            )?
            .batch_norm(&format!("{prefix}.downsample.bn"))?;
        builder.set_shape(output);
    }

    builder.add(&format!("{prefix}.add"), Some(Activation::Relu));
    Ok(())
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: Conv2dConfig::new([in_channels, width], [1, 1])
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: Conv2dConfig::new([width, width], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: Conv2dConfig::new([width, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.bn.forward(downsample.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        let x = relu(self.bn2.forward(self.conv2.forward(x)));
        let x = self.bn3.forward(self.conv3.forward(x));

        relu(x + identity)
    }
}

/// Stem and the four residual stages; field names follow the torchvision layout.
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
}

impl<B: Backend> ResNetBackbone<B> {
    fn new(config: &ResNetConfig, device: &B::Device) -> Self {
        let mut in_channels = STEM_CHANNELS;
        let mut stages = STAGE_WIDTHS
            .iter()
            .zip(config.blocks.iter())
            .enumerate()
            .map(|(stage, (&width, &count))| {
                (0..count)
                    .map(|block| {
                        let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                        let bottleneck = Bottleneck::new(in_channels, width, stride, device);
                        in_channels = width * EXPANSION;
                        bottleneck
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter();

        Self {
            conv1: Conv2dConfig::new([config.in_channels, STEM_CHANNELS], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(STEM_CHANNELS).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: stages.next().unwrap_or_default(),
            layer2: stages.next().unwrap_or_default(),
            layer3: stages.next().unwrap_or_default(),
            layer4: stages.next().unwrap_or_default(),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);

        for block in self
            .layer1
            .iter()
            .chain(self.layer2.iter())
            .chain(self.layer3.iter())
            .chain(self.layer4.iter())
        {
            x = block.forward(x);
        }

        x
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    backbone: ResNetBackbone<B>,
    pooling: Ignored<GlobalPooling>,
    head: DenseHead<B>,
}

impl<B: Backend> ResNet<B> {
    /// Keep the residual backbone fixed, only the head is trained.
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }

    pub fn backbone(&self) -> &ResNetBackbone<B> {
        &self.backbone
    }

    pub fn with_backbone(mut self, backbone: ResNetBackbone<B>) -> Self {
        self.backbone = backbone;
        self
    }

    pub fn with_head(mut self, head: DenseHead<B>) -> Self {
        self.head = head;
        self
    }

    pub fn head(&self) -> &DenseHead<B> {
        &self.head
    }
}

impl<B: Backend> Classifier<B> for ResNet<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images);
        let x = self.pooling.0.apply(x);

        self.head.forward(x)
    }
}

classification_steps!(ResNet);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageBatch;
    use crate::pretrained::{self, state_dict};
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::{Distribution, TensorData},
        train::TrainStep,
    };

    type B = NdArray<f32>;

    type StateDict = Vec<(String, TensorData)>;

    fn conv_entries(entries: &mut StateDict, prefix: &str, conv: &Conv2d<B>) {
        entries.push((format!("{prefix}.weight"), conv.weight.val().into_data()));
    }

    fn batch_norm_entries(entries: &mut StateDict, prefix: &str, bn: &BatchNorm<B, 2>) {
        entries.push((format!("{prefix}.weight"), bn.gamma.val().into_data()));
        entries.push((format!("{prefix}.bias"), bn.beta.val().into_data()));
        let mean = bn.running_mean.value();
        let var = bn.running_var.value();
        entries.push((format!("{prefix}.running_mean"), mean.into_data()));
        entries.push((format!("{prefix}.running_var"), var.into_data()));
    }

    /// The backbone under torchvision's key names.
    fn torchvision_backbone(backbone: &ResNetBackbone<B>) -> StateDict {
        let mut entries = Vec::new();
        conv_entries(&mut entries, "conv1", &backbone.conv1);
        batch_norm_entries(&mut entries, "bn1", &backbone.bn1);

        let stages = [
            &backbone.layer1,
            &backbone.layer2,
            &backbone.layer3,
            &backbone.layer4,
        ];
        for (stage, blocks) in stages.iter().enumerate() {
            for (i, block) in blocks.iter().enumerate() {
                let prefix = format!("layer{}.{i}", stage + 1);
                conv_entries(&mut entries, &format!("{prefix}.conv1"), &block.conv1);
                batch_norm_entries(&mut entries, &format!("{prefix}.bn1"), &block.bn1);
                conv_entries(&mut entries, &format!("{prefix}.conv2"), &block.conv2);
                batch_norm_entries(&mut entries, &format!("{prefix}.bn2"), &block.bn2);
                conv_entries(&mut entries, &format!("{prefix}.conv3"), &block.conv3);
                batch_norm_entries(&mut entries, &format!("{prefix}.bn3"), &block.bn3);
                if let Some(downsample) = &block.downsample {
                    let conv = format!("{prefix}.downsample.0");
                    let bn = format!("{prefix}.downsample.1");
                    conv_entries(&mut entries, &conv, &downsample.conv);
                    batch_norm_entries(&mut entries, &bn, &downsample.bn);
                }
            }
        }

        entries
    }

    fn tiny() -> ResNetConfig {
        ResNetConfig::new().with_blocks([1, 1, 1, 1])
    }

    #[test]
    fn resnet_classifies_32_pixel_inputs() {
        let device = Default::default();
        let model = tiny().init::<B>(&device);

        let logits = model.logits(Tensor::zeros([2, 3, 32, 32], &device));

        assert_eq!(logits.dims(), [2, 10]);
    }

    #[test]
    fn resnet_topology_matches_the_module() {
        let device = Default::default();
        let config = tiny();
        let model = config.init::<B>(&device);

        let topology = config.topology([3, 32, 32]).unwrap();

        assert_eq!(topology.total_params, model.num_params());
        assert_eq!(
            topology.layer("backbone.bn1").unwrap().params,
            model.backbone().bn1.num_params()
        );
        assert_eq!(
            topology.layer("backbone.layer4.0.add").unwrap().output_shape,
            vec![2048, 1, 1]
        );
        assert!(topology.layer("backbone.layer1.0.downsample.conv").is_some());
    }

    #[test]
    fn resnet50_has_the_reference_backbone_size() {
        let topology = ResNetConfig::resnet50(1000).topology([3, 224, 224]).unwrap();

        // torchvision's 25,557,032 trainable values plus 53,120 running statistics.
        assert_eq!(topology.trainable_params, 25_557_032);
        assert_eq!(topology.total_params, 25_557_032 + 53_120);
        assert_eq!(topology.name, "resnet50");
    }

    #[test]
    fn empty_stages_are_rejected() {
        let config = ResNetConfig::new().with_blocks([1, 0, 1, 1]);

        assert!(config.topology([3, 32, 32]).is_err());
    }

    #[test]
    fn torchvision_state_dicts_are_imported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resnet.pth");
        let device = Default::default();
        let source = tiny().init::<B>(&device);

        // Running statistics of a trained network are not the initial zeros and ones.
        let mut written = torchvision_backbone(&source.backbone)
            .into_iter()
            .map(|(key, data)| {
                if key.ends_with("running_mean") || key.ends_with("running_var") {
                    let shape = data.shape.clone();
                    let stats =
                        Tensor::<B, 1>::random(shape, Distribution::Uniform(0.5, 1.5), &device);
                    (key, stats.into_data())
                } else {
                    (key, data)
                }
            })
            .collect::<Vec<_>>();
        let fc = source.head().output();
        written.push(("fc.weight".to_string(), fc.weight.val().transpose().into_data()));
        written.push((
            "fc.bias".to_string(),
            fc.bias.as_ref().unwrap().val().into_data(),
        ));
        state_dict::write(&path, written.clone());

        let loaded =
            pretrained::load_resnet(tiny().init::<B>(&device), &path, true, &device).unwrap();

        let imported = torchvision_backbone(&loaded.backbone);
        assert_eq!(imported.len() + 2, written.len());
        for ((key, actual), (written_key, expected)) in imported.iter().zip(written.iter()) {
            assert_eq!(key, written_key);
            actual.assert_eq(expected, true);
        }
        let head = loaded.head().output();
        head.weight
            .val()
            .into_data()
            .assert_eq(&fc.weight.val().into_data(), true);
        head.bias
            .as_ref()
            .unwrap()
            .val()
            .into_data()
            .assert_eq(&fc.bias.as_ref().unwrap().val().into_data(), true);
    }

    #[test]
    fn frozen_backbone_receives_no_gradients() {
        let device = Default::default();
        let model = tiny().init::<Autodiff<B>>(&device).freeze_backbone();
        let batch = ImageBatch {
            images: Tensor::random([2, 3, 32, 32], Distribution::Default, &device),
            targets: Tensor::from_ints([1, 7], &device),
        };

        let grads = TrainStep::step(&model, batch).grads;

        let backbone = &model.backbone;
        assert!(grads.get::<B, 4>(backbone.conv1.weight.id.clone()).is_none());
        assert!(grads.get::<B, 1>(backbone.bn1.gamma.id.clone()).is_none());
        assert!(grads
            .get::<B, 4>(backbone.layer4[0].conv3.weight.id.clone())
            .is_none());
        let output = model.head().output();
        assert!(grads.get::<B, 2>(output.weight.id.clone()).is_some());
        assert!(grads
            .get::<B, 1>(output.bias.as_ref().unwrap().id.clone())
            .is_some());
    }
}
