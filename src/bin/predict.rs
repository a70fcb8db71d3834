use std::path::PathBuf;
use std::process;

use burn::data::dataset::Dataset;
use clap::Parser;
use vision_export::{
    backend::{self, Backend},
    dataset::{DatasetKind, Splits, ValidationSplit},
    inference::Predictor,
    Error, Result,
};

/// Classify one test image with an exported model.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// `model.json` directory, `.vxm` file or split `.json` header.
    artifact: PathBuf,
    #[arg(long, value_enum)]
    dataset: DatasetKind,
    /// Index of the image in the test split.
    #[arg(long, default_value_t = 0)]
    index: usize,
}

fn predict(args: &Args) -> Result<()> {
    let device = backend::device();
    let predictor = Predictor::<Backend>::load(&args.artifact, &device)?;

    let splits = Splits::load(args.dataset, &ValidationSplit::Test, None)?;
    let item = splits.test.get(args.index).ok_or_else(|| {
        Error::Dataset(format!(
            "Index {} is out of range for {} test items",
            args.index,
            splits.test.len()
        ))
    })?;

    let prediction = predictor.predict(&item)?;
    println!(
        "Predicted class {} ({:.2}%), label {}",
        prediction.class,
        prediction.confidence() * 100.0,
        item.label
    );

    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = predict(&args) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
