//! Train LeNet, VGG16 and ResNet image classifiers on MNIST and CIFAR-10, then export
//! their topology and weights for inference in the browser.
//!
//! Every run follows the same stages: [load](dataset) → [preprocess](data) →
//! [build](model) and [train](training) → [export](export). The [recipe] module bundles
//! the presets.

pub mod backend;
pub mod data;
pub mod dataset;
pub mod error;
pub mod export;
pub mod inference;
pub mod model;
pub mod pretrained;
pub mod recipe;
pub mod schedule;
pub mod training;

pub use error::{Error, Result};
