use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::{Dataset, InMemDataset},
    },
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        metric::{AccuracyMetric, LossMetric},
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        ClassificationOutput, LearnerBuilder, TrainStep, ValidStep,
    },
};

use crate::data::{ImageBatch, ImageBatcher};
use crate::dataset::ImageItem;
use crate::error::Error;
use crate::model::Classifier;
use crate::schedule::{InverseTimeDecayConfig, LearningRateSchedule};

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Replaces the constant learning rate when set.
    pub decay: Option<InverseTimeDecayConfig>,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Export the checkpoint with the lowest validation loss instead of the last epoch.
    #[config(default = false)]
    pub restore_best: bool,
    /// Only train the classification head of pretrained networks.
    #[config(default = false)]
    pub freeze_backbone: bool,
    /// Show the learner's terminal dashboard. Progress is logged instead when disabled.
    #[config(default = true)]
    pub dashboard: bool,
}

impl TrainingConfig {
    fn schedule(&self) -> LearningRateSchedule {
        match &self.decay {
            Some(decay) => LearningRateSchedule::InverseTimeDecay(decay.init()),
            None => LearningRateSchedule::Constant(self.learning_rate),
        }
    }
}

/// Reports epoch results through `log` for runs without a terminal.
#[derive(Default)]
struct LogRenderer {
    metrics: Vec<String>,
}

impl LogRenderer {
    fn record(&mut self, state: MetricState) {
        let entry = match state {
            MetricState::Generic(entry) => entry,
            MetricState::Numeric(entry, _) => entry,
        };
        self.metrics.retain(|line| !line.starts_with(&entry.name));
        self.metrics.push(format!("{}: {}", entry.name, entry.formatted));
    }

    fn render(&mut self, split: &str, item: TrainingProgress) {
        if item.progress.items_processed < item.progress.items_total {
            return;
        }

        log::info!(
            "[{split}] epoch {}/{}: {}",
            item.epoch,
            item.epoch_total,
            self.metrics.join(", ")
        );
        self.metrics.clear();
    }
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        self.record(state);
    }

    fn update_valid(&mut self, state: MetricState) {
        self.record(state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        self.render("train", item);
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        self.render("valid", item);
    }
}

/// Loss and accuracy of a model over a whole dataset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    /// Mean cross-entropy per item.
    pub loss: f64,
    /// Fraction of correctly classified items.
    pub accuracy: f64,
    pub items: usize,
}

impl core::fmt::Display for Evaluation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "loss {:.4}, accuracy {:.2}% over {} items",
            self.loss,
            self.accuracy * 100.0,
            self.items
        )
    }
}

/// Fit `model` on `train`, validating on `valid` after every epoch.
///
/// Checkpoints, metrics and the learner's `experiment.log` are written under `artifact_dir`.
/// Returns the trained network without its autodiff graph.
pub fn train<B, M>(
    model: M,
    batcher: ImageBatcher,
    train: InMemDataset<ImageItem>,
    valid: InMemDataset<ImageItem>,
    config: &TrainingConfig,
    artifact_dir: &Path,
    device: B::Device,
) -> crate::Result<M::InnerModule>
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
    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join("config.json"))?;

    B::seed(config.seed);

    let valid = Arc::new(valid);

    let dataloader_train = DataLoaderBuilder::new(batcher.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train);

    let dataloader_valid = DataLoaderBuilder::new(batcher.clone())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid.clone());

    let directory = artifact_dir.to_string_lossy().to_string();
    let mut builder = LearnerBuilder::new(directory.as_str())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary();
    if !config.dashboard {
        builder = builder.renderer(LogRenderer::default());
    }
    let learner = builder.build(model, config.optimizer.init(), config.schedule());

    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    let model = model_trained.valid();
    if !config.restore_best {
        return Ok(model);
    }

    restore_best::<B::InnerBackend, _, _>(
        model,
        &batcher,
        valid,
        config.batch_size,
        artifact_dir,
        &device,
    )
}

/// Checkpoints left by the learner, ordered by epoch.
pub fn checkpoints(artifact_dir: &Path) -> crate::Result<Vec<(usize, PathBuf)>> {
    let directory = artifact_dir.join("checkpoint");
    if !directory.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        let epoch = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("model-"))
            .and_then(|name| name.strip_suffix(".mpk"))
            .and_then(|epoch| epoch.parse::<usize>().ok());

        if let Some(epoch) = epoch {
            checkpoints.push((epoch, path));
        }
    }
    checkpoints.sort_by_key(|(epoch, _)| *epoch);

    Ok(checkpoints)
}

/// Keep the retained checkpoint with the lowest validation loss.
///
/// The learner keeps the best epoch by validation loss alongside the most recent ones, so
/// scoring every remaining checkpoint recovers it.
pub fn restore_best<B, M, D>(
    model: M,
    batcher: &ImageBatcher,
    valid: D,
    batch_size: usize,
    artifact_dir: &Path,
    device: &B::Device,
) -> crate::Result<M>
where
    B: Backend,
    M: Classifier<B>,
    D: Dataset<ImageItem>,
{
    let mut best: Option<(usize, Evaluation, M)> = None;

    for (epoch, path) in checkpoints(artifact_dir)? {
        let candidate = model
            .clone()
            .load_file(path, &CompactRecorder::new(), device)?;
        let evaluation = evaluate(&candidate, batcher, &valid, batch_size, device)?;
        log::info!("Checkpoint of epoch {epoch}: {evaluation}");

        let improves = best
            .as_ref()
            .map_or(true, |(_, current, _)| evaluation.loss < current.loss);
        if improves {
            best = Some((epoch, evaluation, candidate));
        }
    }

    match best {
        Some((epoch, evaluation, model)) => {
            log::info!("Restored epoch {epoch} with validation {evaluation}");
            Ok(model)
        }
        None => {
            log::warn!("No checkpoint found, keeping the weights of the last epoch");
            Ok(model)
        }
    }
}

/// Score `model` on every item of `dataset`.
pub fn evaluate<B, M, D>(
    model: &M,
    batcher: &ImageBatcher,
    dataset: &D,
    batch_size: usize,
    device: &B::Device,
) -> crate::Result<Evaluation>
where
    B: Backend,
    M: Classifier<B>,
    D: Dataset<ImageItem> + ?Sized,
{
    let items = dataset.len();
    if items == 0 {
        return Err(Error::Dataset("Cannot evaluate on an empty dataset".to_string()));
    }

    let mut loss = 0.0;
    let mut correct = 0;

    for start in (0..items).step_by(batch_size.max(1)) {
        let end = usize::min(start + batch_size.max(1), items);
        let batch_items = (start..end)
            .filter_map(|index| dataset.get(index))
            .collect::<Vec<_>>();
        let batch_len = batch_items.len();
        let batch: ImageBatch<B> = batcher.batch(batch_items, device);

        let output = model.forward_classification(batch.images, batch.targets);
        loss += output.loss.into_scalar().elem::<f64>() * batch_len as f64;
        correct += output
            .output
            .argmax(1)
            .reshape([batch_len])
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
    }

    Ok(Evaluation {
        loss: loss / items as f64,
        accuracy: correct as f64 / items as f64,
        items,
    })
}
