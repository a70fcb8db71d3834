use burn::{data::dataloader::batcher::Batcher, prelude::*};
use serde::{Deserialize, Serialize};

use crate::dataset::ImageItem;
use crate::error::Error;

// ImageNet statistics in BGR order, on the 0..=255 scale.
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
// ImageNet statistics in RGB order, on the 0..=1 scale.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Pixel normalization applied after padding and channel replication.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Normalization {
    /// `x / 255`, values in `[0, 1]`.
    Scale,
    /// Channels reordered to BGR and zero-centred with the ImageNet mean, no scaling.
    Caffe,
    /// `(x / 255 - mean) / std` with the ImageNet RGB statistics.
    ImageNet,
}

/// Fixed preprocessing applied to every item of a run.
#[derive(Config, Debug)]
pub struct PreprocessConfig {
    /// Zero padding added on each spatial border.
    #[config(default = 0)]
    pub padding: usize,
    /// Replicate single-channel images to this many channels.
    pub channels: Option<usize>,
    /// Bilinear resize to `[height, width]`, sampling at pixel centres like `tf.image.resize`.
    pub resize: Option<[usize; 2]>,
    #[config(default = "Normalization::Scale")]
    pub normalization: Normalization,
}

impl PreprocessConfig {
    /// Shape of the tensor fed to the network for items of `input` shape.
    pub fn output_shape(&self, input: [usize; 3]) -> crate::Result<[usize; 3]> {
        let [channels, height, width] = input;

        let channels = match self.channels {
            Some(target) if target != channels && channels != 1 => {
                return Err(Error::Preprocess(format!(
                    "Cannot replicate {channels} channels to {target}"
                )))
            }
            Some(target) => target,
            None => channels,
        };

        if channels != 3 && self.normalization != Normalization::Scale {
            return Err(Error::Preprocess(format!(
                "{:?} normalization needs 3 channels, got {channels}",
                self.normalization
            )));
        }

        let [height, width] = match self.resize {
            Some([0, _]) | Some([_, 0]) => {
                return Err(Error::Preprocess("Cannot resize to an empty image".into()))
            }
            Some(size) => size,
            None => [height + 2 * self.padding, width + 2 * self.padding],
        };

        Ok([channels, height, width])
    }

    /// Preprocess a batch of raw pixels, `[batch, channels, height, width]` on the 0..=255
    /// scale, into network inputs.
    ///
    /// The configuration must have been validated with [`output_shape`](Self::output_shape)
    /// for the batch's item shape.
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let images = pad(images, self.padding);
        let images = match self.channels {
            Some(target) if images.dims()[1] == 1 && target > 1 => images.repeat_dim(1, target),
            _ => images,
        };
        let images = match self.resize {
            Some(size) => resize_bilinear(images, size),
            None => images,
        };

        normalize(images, self.normalization)
    }
}

fn pad<B: Backend>(images: Tensor<B, 4>, padding: usize) -> Tensor<B, 4> {
    if padding == 0 {
        return images;
    }

    let [batch, channels, height, width] = images.dims();
    Tensor::zeros(
        [batch, channels, height + 2 * padding, width + 2 * padding],
        &images.device(),
    )
    .slice_assign(
        [
            0..batch,
            0..channels,
            padding..padding + height,
            padding..padding + width,
        ],
        images,
    )
}

/// `[output, input]` matrix of bilinear weights with half-pixel centres, the sampling of
/// `tf.image.resize`.
fn bilinear_weights<B: Backend>(input: usize, output: usize, device: &B::Device) -> Tensor<B, 2> {
    let scale = input as f32 / output as f32;
    let last = (input - 1) as f32;
    let mut weights = vec![0.0f32; output * input];

    for (i, row) in weights.chunks_mut(input).enumerate() {
        let source = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, last);
        let lower = source.floor() as usize;
        let upper = (lower + 1).min(input - 1);
        let fraction = source - lower as f32;

        row[lower] += 1.0 - fraction;
        row[upper] += fraction;
    }

    Tensor::from_data(
        TensorData::new(weights, [output, input]).convert::<B::FloatElem>(),
        device,
    )
}

/// Separable bilinear resize as two matrix products, one per spatial axis.
fn resize_bilinear<B: Backend>(images: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, height, width] = images.dims();
    let [out_height, out_width] = size;
    if [height, width] == size {
        return images;
    }

    let device = images.device();
    let rows = bilinear_weights::<B>(height, out_height, &device);
    let columns = bilinear_weights::<B>(width, out_width, &device);
    let planes = batch * channels;

    let x = images
        .reshape([planes * height, width])
        .matmul(columns.transpose());
    let x = x
        .reshape([planes, height, out_width])
        .swap_dims(1, 2)
        .reshape([planes * out_width, height])
        .matmul(rows.transpose());

    x.reshape([planes, out_width, out_height])
        .swap_dims(1, 2)
        .reshape([batch, channels, out_height, out_width])
}

fn channel_constants<B: Backend>(values: [f32; 3], device: &B::Device) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(values, device).reshape([1, 3, 1, 1])
}

fn normalize<B: Backend>(images: Tensor<B, 4>, normalization: Normalization) -> Tensor<B, 4> {
    let device = images.device();

    match normalization {
        Normalization::Scale => images / 255,
        // RGB -> BGR, then centred without scaling.
        Normalization::Caffe => images.flip([1]) - channel_constants(CAFFE_MEAN_BGR, &device),
        Normalization::ImageNet => {
            (images / 255 - channel_constants(IMAGENET_MEAN, &device))
                / channel_constants(IMAGENET_STD, &device)
        }
    }
}

/// Turns [`ImageItem`]s into normalized image tensors and class targets.
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    preprocess: PreprocessConfig,
    input_shape: [usize; 3],
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// Class indices, `[batch]`.
    pub targets: Tensor<B, 1, Int>,
}

impl ImageBatcher {
    /// Batcher for items of `input_shape`, validating the preprocessing once up front.
    pub fn new(preprocess: PreprocessConfig, input_shape: [usize; 3]) -> crate::Result<Self> {
        preprocess.output_shape(input_shape)?;

        Ok(Self {
            preprocess,
            input_shape,
        })
    }

    pub fn output_shape(&self) -> [usize; 3] {
        // Validated in `new`.
        self.preprocess
            .output_shape(self.input_shape)
            .unwrap_or(self.input_shape)
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let [channels, height, width] = self.input_shape;
        let batch_size = items.len();

        let pixels = items
            .iter()
            .flat_map(|item| {
                assert_eq!(
                    item.shape, self.input_shape,
                    "Item shape does not match the dataset shape"
                );
                item.image.iter().map(|&pixel| pixel as f32)
            })
            .collect::<Vec<_>>();
        let data = TensorData::new(pixels, [batch_size, channels, height, width]);
        let images = Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), device);
        let images = self.preprocess.apply(images);

        let labels = items.iter().map(|item| item.label as i64).collect::<Vec<_>>();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [batch_size]).convert::<B::IntElem>(),
            device,
        );

        ImageBatch { images, targets }
    }
}
