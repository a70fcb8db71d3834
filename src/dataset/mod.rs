//! Labelled image datasets held in memory.
//!
//! Every source is converted to [`ImageItem`]s, channel-first raw pixel
//! intensities, so preprocessing and batching do not depend on where the
//! images came from.

mod cifar;
mod mnist;

pub use cifar::*;
pub use mnist::*;

use burn::data::dataset::{Dataset, InMemDataset};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Image with its class label.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    /// Raw `0..=255` pixel values, channel-first (`C, H, W`).
    pub image: Vec<u8>,
    /// `[channels, height, width]`.
    pub shape: [usize; 3],
    /// Class index.
    pub label: usize,
}

impl ImageItem {
    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }
}

/// Dataset a recipe trains on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum DatasetKind {
    Mnist,
    Cifar10,
}

impl DatasetKind {
    pub fn num_classes(&self) -> usize {
        match self {
            DatasetKind::Mnist => 10,
            DatasetKind::Cifar10 => 10,
        }
    }

    /// Shape of a raw item as `[channels, height, width]`.
    pub fn input_shape(&self) -> [usize; 3] {
        match self {
            DatasetKind::Mnist => [1, 28, 28],
            DatasetKind::Cifar10 => [3, 32, 32],
        }
    }

    /// Train and test items, downloading the data on first use.
    pub fn load(&self) -> Result<(Vec<ImageItem>, Vec<ImageItem>)> {
        match self {
            DatasetKind::Mnist => Ok((mnist_items(Split::Train), mnist_items(Split::Test))),
            DatasetKind::Cifar10 => Ok((
                Cifar10Dataset::train()?.into(),
                Cifar10Dataset::test()?.into(),
            )),
        }
    }
}

/// Train or test partition of a source dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Where the validation data comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValidationSplit {
    /// The last `n` train items are held out for validation.
    Holdout(usize),
    /// The last `n` train items are also used for validation, training still sees them.
    Overlap(usize),
    /// The test partition doubles as the validation set.
    Test,
}

impl ValidationSplit {
    /// Keep a held-out tail in the training set.
    pub fn overlapping(self) -> Self {
        match self {
            ValidationSplit::Holdout(size) => ValidationSplit::Overlap(size),
            other => other,
        }
    }
}

/// Train, validation and test datasets of one run.
pub struct Splits {
    pub train: InMemDataset<ImageItem>,
    pub valid: InMemDataset<ImageItem>,
    pub test: InMemDataset<ImageItem>,
}

impl Splits {
    /// Load `kind` and split it according to `validation`.
    ///
    /// `limit` truncates every split after splitting, for quick runs.
    pub fn load(
        kind: DatasetKind,
        validation: &ValidationSplit,
        limit: Option<usize>,
    ) -> Result<Self> {
        let (train, test) = kind.load()?;
        log::info!(
            "Loaded {:?}: {} train items, {} test items",
            kind,
            train.len(),
            test.len()
        );
        Self::from_items(train, test, validation, limit)
    }

    pub fn from_items(
        mut train: Vec<ImageItem>,
        mut test: Vec<ImageItem>,
        validation: &ValidationSplit,
        limit: Option<usize>,
    ) -> Result<Self> {
        let mut valid = match validation {
            ValidationSplit::Holdout(size) => holdout(&mut train, *size)?,
            ValidationSplit::Overlap(size) => {
                let mut rest = train.clone();
                holdout(&mut rest, *size)?
            }
            ValidationSplit::Test => test.clone(),
        };

        if let Some(limit) = limit {
            train.truncate(limit);
            valid.truncate(limit);
            test.truncate(limit);
        }

        Ok(Self {
            train: InMemDataset::new(train),
            valid: InMemDataset::new(valid),
            test: InMemDataset::new(test),
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "train: {}, valid: {}, test: {}",
            self.train.len(),
            self.valid.len(),
            self.test.len()
        )
    }
}

/// Remove the last `size` items from `items` and return them.
fn holdout(items: &mut Vec<ImageItem>, size: usize) -> Result<Vec<ImageItem>> {
    if size == 0 || size >= items.len() {
        return Err(Error::Dataset(format!(
            "Cannot hold out {size} validation items from a split of {}",
            items.len()
        )));
    }

    Ok(items.split_off(items.len() - size))
}
