//! Artifacts written after training: a topology description plus the learned weights.
//!
//! Three layouts are supported:
//!
//! - [`ExportFormat::Split`]: `<name>.json` and `<name>_weights.bin`.
//! - [`ExportFormat::Combined`]: a single `<name>.vxm` file.
//! - [`ExportFormat::Web`]: a `<name>_web/` directory with a `model.json` manifest and a
//!   half precision weight shard, ready to be served to the browser runtime.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    prelude::*,
    record::{
        BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings,
        PrecisionSettings, Recorder,
    },
};
use serde::{Deserialize, Serialize};

use crate::data::PreprocessConfig;
use crate::error::{Error, Result};
use crate::model::{Architecture, Classifier, LeNet, ResNet, Topology, Vgg16};

const COMBINED_MAGIC: &[u8; 8] = b"VXMODEL\0";
const COMBINED_VERSION: u32 = 1;
const COMBINED_EXTENSION: &str = "vxm";
const WEB_FORMAT: &str = "vision-export/web";
const WEB_VERSION: u32 = 1;
const WEB_MANIFEST: &str = "model.json";
const WEB_SHARD: &str = "group1-shard1of1.bin";

/// Layout of the exported files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Split,
    Combined,
    Web,
}

/// Description stored alongside the weights, enough to rebuild the network and feed it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub architecture: Architecture,
    pub topology: Topology,
    /// Preprocessing the network was trained with.
    pub preprocess: PreprocessConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightFile {
    pub path: String,
    pub bytes: usize,
}

/// `model.json` of a web export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebManifest {
    pub format: String,
    pub format_version: u32,
    pub precision: String,
    pub architecture: Architecture,
    pub topology: Topology,
    pub preprocess: PreprocessConfig,
    pub weights: Vec<WeightFile>,
}

/// Write `model` in `format` under `directory`. Returns the paths written.
pub fn export<B: Backend, M: Module<B>>(
    model: M,
    header: &ArtifactHeader,
    directory: &Path,
    name: &str,
    format: ExportFormat,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(directory)?;

    let paths = match format {
        ExportFormat::Split => {
            let header_path = directory.join(format!("{name}.json"));
            fs::write(&header_path, serde_json::to_vec_pretty(header)?)?;

            let weights_path = split_weights_path(&header_path);
            model.save_file(
                weights_path.clone(),
                &BinFileRecorder::<FullPrecisionSettings>::new(),
            )?;

            vec![header_path, weights_path]
        }
        ExportFormat::Combined => {
            let path = directory.join(format!("{name}.{COMBINED_EXTENSION}"));
            let weights = BinBytesRecorder::<FullPrecisionSettings>::default()
                .record(model.into_record(), ())?;
            fs::write(&path, encode_combined(header, &weights)?)?;

            vec![path]
        }
        ExportFormat::Web => {
            let web_dir = directory.join(format!("{name}_web"));
            fs::create_dir_all(&web_dir)?;

            let weights = BinBytesRecorder::<HalfPrecisionSettings>::default()
                .record(model.into_record(), ())?;
            let shard_path = web_dir.join(WEB_SHARD);
            fs::write(&shard_path, &weights)?;

            let manifest = WebManifest {
                format: WEB_FORMAT.to_string(),
                format_version: WEB_VERSION,
                precision: "f16".to_string(),
                architecture: header.architecture.clone(),
                topology: header.topology.clone(),
                preprocess: header.preprocess.clone(),
                weights: vec![WeightFile {
                    path: WEB_SHARD.to_string(),
                    bytes: weights.len(),
                }],
            };
            let manifest_path = web_dir.join(WEB_MANIFEST);
            fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

            vec![manifest_path, shard_path]
        }
    };

    for path in paths.iter() {
        log::info!("Wrote {}", path.display());
    }

    Ok(paths)
}

fn split_weights_path(header_path: &Path) -> PathBuf {
    let stem = header_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    header_path.with_file_name(format!("{stem}_weights.bin"))
}

/// Serialize the single-file layout: magic, version, header length, JSON header, weights.
pub fn encode_combined(header: &ArtifactHeader, weights: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| Error::Format("Artifact header is too large".to_string()))?;

    let mut bytes = Vec::with_capacity(16 + header.len() + weights.len());
    bytes.extend_from_slice(COMBINED_MAGIC);
    bytes.extend_from_slice(&COMBINED_VERSION.to_le_bytes());
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(weights);

    Ok(bytes)
}

/// Split a single-file artifact into its header and weight bytes.
pub fn decode_combined(bytes: &[u8]) -> Result<(ArtifactHeader, &[u8])> {
    let read_u32 = |offset: usize| -> Result<u32> {
        bytes
            .get(offset..offset + 4)
            .and_then(|slice| slice.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| Error::Format("Truncated artifact".to_string()))
    };

    if bytes.len() < COMBINED_MAGIC.len() || &bytes[..COMBINED_MAGIC.len()] != COMBINED_MAGIC {
        return Err(Error::Format("Not a combined model artifact".to_string()));
    }

    let version = read_u32(8)?;
    if version != COMBINED_VERSION {
        return Err(Error::Format(format!(
            "Unsupported artifact version {version}"
        )));
    }

    let header_len = read_u32(12)? as usize;
    let header = bytes
        .get(16..16 + header_len)
        .ok_or_else(|| Error::Format("Truncated artifact header".to_string()))?;
    let header = serde_json::from_slice(header)?;

    Ok((header, &bytes[16 + header_len..]))
}

/// A network read back from an artifact.
#[derive(Debug)]
pub enum LoadedModel<B: Backend> {
    LeNet(LeNet<B>),
    Vgg16(Vgg16<B>),
    ResNet(ResNet<B>),
}

impl<B: Backend> LoadedModel<B> {
    fn init(architecture: &Architecture, device: &B::Device) -> Self {
        match architecture {
            Architecture::LeNet(config) => LoadedModel::LeNet(config.init(device)),
            Architecture::Vgg16(config) => LoadedModel::Vgg16(config.init(device)),
            Architecture::ResNet(config) => LoadedModel::ResNet(config.init(device)),
        }
    }

    fn load_bytes<S: PrecisionSettings>(self, bytes: Vec<u8>, device: &B::Device) -> Result<Self> {
        fn load<B: Backend, M: Module<B>, S: PrecisionSettings>(
            model: M,
            bytes: Vec<u8>,
            device: &B::Device,
        ) -> Result<M> {
            let record = BinBytesRecorder::<S>::default().load(bytes, device)?;
            Ok(model.load_record(record))
        }

        Ok(match self {
            LoadedModel::LeNet(model) => LoadedModel::LeNet(load::<B, _, S>(model, bytes, device)?),
            LoadedModel::Vgg16(model) => LoadedModel::Vgg16(load::<B, _, S>(model, bytes, device)?),
            LoadedModel::ResNet(model) => {
                LoadedModel::ResNet(load::<B, _, S>(model, bytes, device)?)
            }
        })
    }

    fn load_file(self, path: PathBuf, device: &B::Device) -> Result<Self> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

        Ok(match self {
            LoadedModel::LeNet(model) => {
                LoadedModel::LeNet(model.load_file(path, &recorder, device)?)
            }
            LoadedModel::Vgg16(model) => {
                LoadedModel::Vgg16(model.load_file(path, &recorder, device)?)
            }
            LoadedModel::ResNet(model) => {
                LoadedModel::ResNet(model.load_file(path, &recorder, device)?)
            }
        })
    }

    pub fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            LoadedModel::LeNet(model) => model.logits(images),
            LoadedModel::Vgg16(model) => model.logits(images),
            LoadedModel::ResNet(model) => model.logits(images),
        }
    }

    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            LoadedModel::LeNet(model) => model.probabilities(images),
            LoadedModel::Vgg16(model) => model.probabilities(images),
            LoadedModel::ResNet(model) => model.probabilities(images),
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            LoadedModel::LeNet(model) => model.num_params(),
            LoadedModel::Vgg16(model) => model.num_params(),
            LoadedModel::ResNet(model) => model.num_params(),
        }
    }
}

/// Read an artifact written by [`export`]: a web directory, a `.vxm` file or a split
/// `.json` header whose weights sit next to it.
pub fn load<B: Backend>(path: &Path, device: &B::Device) -> Result<(ArtifactHeader, LoadedModel<B>)> {
    if path.is_dir() {
        let manifest: WebManifest = serde_json::from_slice(&fs::read(path.join(WEB_MANIFEST))?)?;
        if manifest.format != WEB_FORMAT {
            return Err(Error::Format(format!(
                "Unknown web manifest format {}",
                manifest.format
            )));
        }
        if manifest.format_version != WEB_VERSION {
            return Err(Error::Format(format!(
                "Unsupported web manifest version {}",
                manifest.format_version
            )));
        }

        let mut weights = Vec::new();
        for file in manifest.weights.iter() {
            weights.extend(fs::read(path.join(&file.path))?);
        }

        let model = LoadedModel::init(&manifest.architecture, device)
            .load_bytes::<HalfPrecisionSettings>(weights, device)?;
        let header = ArtifactHeader {
            architecture: manifest.architecture,
            topology: manifest.topology,
            preprocess: manifest.preprocess,
        };
        return Ok((header, model));
    }

    match path.extension().and_then(|extension| extension.to_str()) {
        Some(COMBINED_EXTENSION) => {
            let bytes = fs::read(path)?;
            let (header, weights) = decode_combined(&bytes)?;
            let model = LoadedModel::init(&header.architecture, device)
                .load_bytes::<FullPrecisionSettings>(weights.to_vec(), device)?;
            Ok((header, model))
        }
        Some("json") => {
            let header: ArtifactHeader = serde_json::from_slice(&fs::read(path)?)?;
            let model = LoadedModel::init(&header.architecture, device)
                .load_file(split_weights_path(path), device)?;
            Ok((header, model))
        }
        _ => Err(Error::Format(format!(
            "Unrecognized artifact {}",
            path.display()
        ))),
    }
}
