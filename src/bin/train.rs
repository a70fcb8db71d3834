use std::path::PathBuf;
use std::process;

use clap::Parser;
use vision_export::{
    backend::{self, TrainingBackend},
    recipe::{self, Recipe},
};

/// Train a preset network and export it for web inference.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Preset to run.
    #[arg(value_enum)]
    recipe: Recipe,
    /// Directory receiving checkpoints, logs and exported artifacts.
    #[arg(long, default_value = "/tmp/vision-export")]
    artifact_dir: PathBuf,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Truncate every split to this many items.
    #[arg(long)]
    limit: Option<usize>,
    /// PyTorch state dict with pretrained weights.
    #[arg(long)]
    pretrained: Option<PathBuf>,
    /// Validate on the held-out tail of the train split without removing it from training.
    #[arg(long)]
    overlap_validation: bool,
    /// Only train the classification head.
    #[arg(long)]
    freeze_backbone: bool,
    /// Log progress instead of showing the terminal dashboard.
    #[arg(long)]
    no_dashboard: bool,
}

fn main() {
    let args = Args::parse();

    let mut config = args.recipe.config();
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if args.overlap_validation {
        config.validation = config.validation.overlapping();
    }
    if args.freeze_backbone {
        config.training.freeze_backbone = true;
    }
    if args.no_dashboard {
        config.training.dashboard = false;
    }
    config.limit = args.limit.or(config.limit);
    config.pretrained = args.pretrained.or(config.pretrained);

    let artifact_dir = args.artifact_dir.join(&config.name);
    match recipe::run::<TrainingBackend>(&config, &artifact_dir, backend::device()) {
        Ok(summary) => {
            if let Some(test) = summary.test {
                println!("Test {test}");
            }
            for path in summary.paths {
                println!("{}", path.display());
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}
