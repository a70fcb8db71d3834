//! Pretrained starting weights for transfer learning.
//!
//! Weights are read from PyTorch `torchvision` state dicts, e.g. saved with
//!
//! ```python
//! torch.save(torchvision.models.vgg16(weights="IMAGENET1K_V1").state_dict(), "vgg16.pth")
//! ```
//!
//! and mapped onto this crate's module names with key remapping rules.

use std::path::Path;

use burn::{
    nn::LinearRecord,
    prelude::*,
    record::{FullPrecisionSettings, Recorder},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::error::{Error, Result};
use crate::model::{ResNet, ResNetBackboneRecord, Vgg16, VggFeaturesRecord};

/// `torchvision` keys of the VGG16 convolutions, in order.
const VGG16_KEY_REMAPS: &[(&str, &str)] = &[
    ("^features\\.0\\.(.+)", "convs.0.$1"),
    ("^features\\.2\\.(.+)", "convs.1.$1"),
    ("^features\\.5\\.(.+)", "convs.2.$1"),
    ("^features\\.7\\.(.+)", "convs.3.$1"),
    ("^features\\.10\\.(.+)", "convs.4.$1"),
    ("^features\\.12\\.(.+)", "convs.5.$1"),
    ("^features\\.14\\.(.+)", "convs.6.$1"),
    ("^features\\.17\\.(.+)", "convs.7.$1"),
    ("^features\\.19\\.(.+)", "convs.8.$1"),
    ("^features\\.21\\.(.+)", "convs.9.$1"),
    ("^features\\.24\\.(.+)", "convs.10.$1"),
    ("^features\\.26\\.(.+)", "convs.11.$1"),
    ("^features\\.28\\.(.+)", "convs.12.$1"),
];

/// Projection shortcuts are a `Sequential(conv, bn)` in torchvision.
const RESNET_KEY_REMAPS: &[(&str, &str)] = &[
    ("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2"),
    ("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2"),
];

const RESNET_FC_KEY_REMAPS: &[(&str, &str)] = &[("^fc\\.(.+)", "$1")];

pub fn vgg16_key_remaps() -> &'static [(&'static str, &'static str)] {
    VGG16_KEY_REMAPS
}

pub fn resnet_key_remaps() -> &'static [(&'static str, &'static str)] {
    RESNET_KEY_REMAPS
}

fn load_args(path: &Path, remaps: &[(&str, &str)]) -> Result<LoadArgs> {
    if !path.is_file() {
        return Err(Error::Pretrained(format!(
            "No pretrained weights at {}",
            path.display()
        )));
    }

    Ok(remaps
        .iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        }))
}

fn recorder() -> PyTorchFileRecorder<FullPrecisionSettings> {
    PyTorchFileRecorder::<FullPrecisionSettings>::default()
}

/// Replace the VGG16 convolutions with pretrained ones. The head keeps its initialization.
pub fn load_vgg16<B: Backend>(model: Vgg16<B>, path: &Path, device: &B::Device) -> Result<Vgg16<B>> {
    let record: VggFeaturesRecord<B> = recorder().load(load_args(path, VGG16_KEY_REMAPS)?, device)?;
    log::info!("Loaded pretrained VGG16 features from {}", path.display());

    let features = model.features().clone().load_record(record);
    Ok(model.with_features(features))
}

/// Replace the residual backbone with pretrained weights.
///
/// With `include_head` the `fc` classifier is imported too, which requires the head to be
/// the single output layer of the torchvision classifier.
pub fn load_resnet<B: Backend>(
    model: ResNet<B>,
    path: &Path,
    include_head: bool,
    device: &B::Device,
) -> Result<ResNet<B>> {
    let record: ResNetBackboneRecord<B> =
        recorder().load(load_args(path, RESNET_KEY_REMAPS)?, device)?;
    let backbone = model.backbone().clone().load_record(record);
    let mut model = model.with_backbone(backbone);
    log::info!("Loaded pretrained ResNet backbone from {}", path.display());

    if include_head {
        if model.head().num_hidden() > 0 {
            return Err(Error::Pretrained(
                "A pretrained classifier can only replace a single output layer".to_string(),
            ));
        }

        let record: LinearRecord<B> =
            recorder().load(load_args(path, RESNET_FC_KEY_REMAPS)?, device)?;
        let head = model.head().clone().load_output(record);
        model = model.with_head(head);
        log::info!("Loaded pretrained ResNet classifier from {}", path.display());
    }

    Ok(model)
}
