//! Named end-to-end runs: load, preprocess, build and train, then export.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainStep, ValidStep},
};

use crate::data::{ImageBatch, ImageBatcher, Normalization, PreprocessConfig};
use crate::dataset::{DatasetKind, Splits, ValidationSplit};
use crate::error::Error;
use crate::export::{self, ArtifactHeader, ExportFormat};
use crate::model::{Architecture, Classifier, GlobalPooling, LeNetConfig, ResNetConfig, VggConfig};
use crate::pretrained;
use crate::schedule::InverseTimeDecayConfig;
use crate::training::{self, Evaluation, TrainingConfig};

const IMAGENET_CLASSES: usize = 1000;
const IMAGENET_SHAPE: [usize; 3] = [3, 224, 224];

/// The preset runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Recipe {
    /// LeNet-5 on MNIST padded to 32x32.
    #[value(name = "lenet-mnist")]
    LeNetMnist,
    /// VGG16 on MNIST replicated to three channels and resized to 32x32.
    #[value(name = "vgg16-mnist")]
    Vgg16Mnist,
    /// VGG16 on upsampled CIFAR-10 with a dropout head and learning rate decay.
    #[value(name = "vgg16-cifar10")]
    Vgg16Cifar10,
    /// ResNet-50 on MNIST replicated to three channels and resized to 32x32.
    #[value(name = "resnet50-mnist")]
    ResNet50Mnist,
    /// Pretrained ImageNet ResNet-152 exported without training.
    #[value(name = "resnet152-imagenet")]
    ResNet152ImageNet,
}

#[derive(Config)]
pub struct RecipeConfig {
    /// Base name of the exported files.
    pub name: String,
    /// `None` for networks exported as-is.
    pub dataset: Option<DatasetKind>,
    /// Shape of the raw items, `[channels, height, width]`.
    pub image_shape: [usize; 3],
    #[config(default = "ValidationSplit::Test")]
    pub validation: ValidationSplit,
    pub preprocess: PreprocessConfig,
    pub architecture: Architecture,
    pub training: TrainingConfig,
    #[config(default = "vec![ExportFormat::Web]")]
    pub exports: Vec<ExportFormat>,
    /// PyTorch state dict with the starting weights.
    pub pretrained: Option<PathBuf>,
    /// Truncate every split to this many items.
    pub limit: Option<usize>,
}

impl Recipe {
    pub fn config(&self) -> RecipeConfig {
        match self {
            Recipe::LeNetMnist => RecipeConfig::new(
                "mnist_lenet".to_string(),
                DatasetKind::Mnist.input_shape(),
                PreprocessConfig::new().with_padding(2),
                Architecture::LeNet(LeNetConfig::new()),
                TrainingConfig::new(AdamConfig::new())
                    .with_num_epochs(40)
                    .with_batch_size(64),
            )
            .with_dataset(Some(DatasetKind::Mnist))
            .with_validation(ValidationSplit::Holdout(2000))
            .with_exports(vec![ExportFormat::Split]),
            Recipe::Vgg16Mnist => RecipeConfig::new(
                "mnist_vgg16".to_string(),
                DatasetKind::Mnist.input_shape(),
                PreprocessConfig::new()
                    .with_channels(Some(3))
                    .with_resize(Some([32, 32])),
                Architecture::Vgg16(VggConfig::new()),
                TrainingConfig::new(AdamConfig::new()),
            )
            .with_dataset(Some(DatasetKind::Mnist)),
            Recipe::Vgg16Cifar10 => RecipeConfig::new(
                "cifar10_vgg16".to_string(),
                DatasetKind::Cifar10.input_shape(),
                PreprocessConfig::new().with_normalization(Normalization::Caffe),
                Architecture::Vgg16(
                    VggConfig::new()
                        .with_upsample(true)
                        .with_pooling(GlobalPooling::Avg)
                        .with_hidden(vec![512, 256])
                        .with_dropout(0.2),
                ),
                // 0.001 / (1 + 1 * 30) for every step.
                TrainingConfig::new(AdamConfig::new())
                    .with_decay(Some(
                        InverseTimeDecayConfig::new(1.0e-3)
                            .with_offset(30)
                            .with_frozen(true),
                    ))
                    .with_restore_best(true),
            )
            .with_dataset(Some(DatasetKind::Cifar10))
            .with_exports(vec![ExportFormat::Web, ExportFormat::Combined]),
            Recipe::ResNet50Mnist => RecipeConfig::new(
                "mnist_resnet50".to_string(),
                DatasetKind::Mnist.input_shape(),
                PreprocessConfig::new()
                    .with_channels(Some(3))
                    .with_resize(Some([32, 32])),
                Architecture::ResNet(ResNetConfig::resnet50(DatasetKind::Mnist.num_classes())),
                TrainingConfig::new(AdamConfig::new()),
            )
            .with_dataset(Some(DatasetKind::Mnist)),
            Recipe::ResNet152ImageNet => RecipeConfig::new(
                "imagenet_resnet152".to_string(),
                IMAGENET_SHAPE,
                PreprocessConfig::new().with_normalization(Normalization::ImageNet),
                Architecture::ResNet(
                    ResNetConfig::resnet152(IMAGENET_CLASSES).with_pooling(GlobalPooling::Avg),
                ),
                TrainingConfig::new(AdamConfig::new()).with_num_epochs(0),
            ),
        }
    }
}

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub paths: Vec<PathBuf>,
    /// Score on the test split, absent when nothing was trained.
    pub test: Option<Evaluation>,
    pub num_params: usize,
}

/// Execute `config`, writing checkpoints and artifacts under `artifact_dir`.
pub fn run<B: AutodiffBackend>(
    config: &RecipeConfig,
    artifact_dir: &Path,
    device: B::Device,
) -> crate::Result<RunSummary> {
    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join("recipe.json"))?;

    let input_shape = config.preprocess.output_shape(config.image_shape)?;
    let header = ArtifactHeader {
        topology: config.architecture.topology(input_shape)?,
        architecture: config.architecture.clone(),
        preprocess: config.preprocess.clone(),
    };
    log::info!(
        "Running {} ({}) on inputs of shape {:?}, {} parameters",
        config.name,
        config.architecture.name(),
        input_shape,
        header.topology.total_params
    );

    match &config.architecture {
        Architecture::LeNet(architecture) => {
            if config.pretrained.is_some() {
                return Err(Error::Pretrained(
                    "LeNet is trained from scratch, no pretrained weights apply".to_string(),
                ));
            }
            if config.training.freeze_backbone {
                log::warn!("LeNet has no backbone to freeze, training every layer");
            }

            let model = architecture.init::<B>(&device);
            fit_and_export(config, model, header, artifact_dir, device)
        }
        Architecture::Vgg16(architecture) => {
            let mut model = architecture.init::<B>(&device);
            if let Some(path) = &config.pretrained {
                model = pretrained::load_vgg16(model, path, &device)?;
            }
            if config.training.freeze_backbone {
                model = model.freeze_backbone();
            }

            fit_and_export(config, model, header, artifact_dir, device)
        }
        Architecture::ResNet(architecture) => {
            let mut model = architecture.init::<B>(&device);
            if let Some(path) = &config.pretrained {
                let include_head = architecture.num_classes == IMAGENET_CLASSES;
                model = pretrained::load_resnet(model, path, include_head, &device)?;
            }
            if config.training.freeze_backbone {
                model = model.freeze_backbone();
            }

            fit_and_export(config, model, header, artifact_dir, device)
        }
    }
}

fn fit_and_export<B, M>(
    config: &RecipeConfig,
    model: M,
    header: ArtifactHeader,
    artifact_dir: &Path,
    device: B::Device,
) -> crate::Result<RunSummary>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>
        + Classifier<B>
        + TrainStep<ImageBatch<B>, ClassificationOutput<B>>
        + Display
        + 'static,
    M::InnerModule: Classifier<B::InnerBackend>
        + ValidStep<ImageBatch<B::InnerBackend>, ClassificationOutput<B::InnerBackend>>,
{
    let (model, test) = match config.dataset {
        Some(kind) if config.training.num_epochs > 0 => {
            let splits = Splits::load(kind, &config.validation, config.limit)?;
            log::info!("Dataset splits: {}", splits.describe());

            let batcher = ImageBatcher::new(config.preprocess.clone(), config.image_shape)?;
            let model = training::train(
                model,
                batcher.clone(),
                splits.train,
                splits.valid,
                &config.training,
                artifact_dir,
                device.clone(),
            )?;

            let evaluation = training::evaluate::<B::InnerBackend, _, _>(
                &model,
                &batcher,
                &splits.test,
                config.training.batch_size,
                &device,
            )?;
            log::info!("Test {evaluation}");

            (model, Some(evaluation))
        }
        _ => {
            log::info!("No training requested, exporting the initial weights");
            (model.valid(), None)
        }
    };

    let num_params = model.num_params();
    let mut paths = Vec::new();
    for format in config.exports.iter() {
        paths.extend(export::export(
            model.clone(),
            &header,
            artifact_dir,
            &config.name,
            *format,
        )?);
    }

    Ok(RunSummary {
        paths,
        test,
        num_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_describes_a_valid_network() {
        for recipe in [
            Recipe::LeNetMnist,
            Recipe::Vgg16Mnist,
            Recipe::Vgg16Cifar10,
            Recipe::ResNet50Mnist,
            Recipe::ResNet152ImageNet,
        ] {
            let config = recipe.config();
            let input_shape = config.preprocess.output_shape(config.image_shape).unwrap();

            let topology = config.architecture.topology(input_shape).unwrap();

            assert_eq!(topology.num_classes, config.architecture.num_classes());
            assert_eq!(topology.output_shape(), &[topology.num_classes]);
        }
    }

    #[test]
    fn lenet_preset_holds_out_the_last_two_thousand_digits() {
        let config = Recipe::LeNetMnist.config();

        assert_eq!(config.validation, ValidationSplit::Holdout(2000));
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.training.num_epochs, 40);
        assert_eq!(config.exports, vec![ExportFormat::Split]);
        assert_eq!(
            config.preprocess.output_shape(config.image_shape).unwrap(),
            [1, 32, 32]
        );
    }

    #[test]
    fn cifar_preset_decays_and_keeps_the_best_checkpoint() {
        let config = Recipe::Vgg16Cifar10.config();

        assert!(config.training.restore_best);
        assert_eq!(config.training.batch_size, 128);
        let decay = config.training.decay.clone().unwrap();
        assert_eq!(decay.offset, 30);
        assert!(decay.frozen);
        assert_eq!(
            config.exports,
            vec![ExportFormat::Web, ExportFormat::Combined]
        );
    }

    #[test]
    fn imagenet_preset_only_converts() {
        let config = Recipe::ResNet152ImageNet.config();

        assert_eq!(config.dataset, None);
        assert_eq!(config.training.num_epochs, 0);
        assert_eq!(config.architecture.name(), "resnet152");
        assert_eq!(config.architecture.num_classes(), 1000);
    }

    #[test]
    fn recipe_config_survives_a_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        let config = Recipe::Vgg16Cifar10.config().with_limit(Some(64));

        config.save(&path).unwrap();
        let loaded = RecipeConfig::load(&path).unwrap();

        assert_eq!(loaded.limit, Some(64));
        assert_eq!(loaded.name, "cifar10_vgg16");
        assert_eq!(loaded.architecture.name(), "vgg16");
    }
}
