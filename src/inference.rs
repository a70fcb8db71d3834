use std::path::Path;

use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::data::{ImageBatch, ImageBatcher};
use crate::dataset::ImageItem;
use crate::error::{Error, Result};
use crate::export::{self, ArtifactHeader, LoadedModel};

/// Class scores of one image.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class: usize,
    /// Softmax output, one entry per class.
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities.get(self.class).copied().unwrap_or_default()
    }
}

/// An exported network ready to classify raw dataset items.
pub struct Predictor<B: Backend> {
    header: ArtifactHeader,
    model: LoadedModel<B>,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn load(artifact: &Path, device: &B::Device) -> Result<Self> {
        let (header, model) = export::load(artifact, device)?;
        log::info!(
            "Loaded {} with {} parameters from {}",
            header.topology.name,
            model.num_params(),
            artifact.display()
        );

        Ok(Self {
            header,
            model,
            device: device.clone(),
        })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn predict(&self, item: &ImageItem) -> Result<Prediction> {
        let batcher = ImageBatcher::new(self.header.preprocess.clone(), item.shape)?;

        let expected = self.header.topology.input_shape;
        if batcher.output_shape() != expected {
            return Err(Error::Preprocess(format!(
                "Image of shape {:?} becomes {:?}, the network expects {:?}",
                item.shape,
                batcher.output_shape(),
                expected
            )));
        }

        let batch: ImageBatch<B> = batcher.batch(vec![item.clone()], &self.device);
        let probabilities = self
            .model
            .probabilities(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| Error::Format(format!("Unreadable model output: {err:?}")))?;

        Ok(Prediction {
            class: argmax(&probabilities),
            probabilities,
        })
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &value)| {
            if value > max {
                (i, value)
            } else {
                (best, max)
            }
        })
        .0
}
