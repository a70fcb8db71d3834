use std::path::PathBuf;
use std::process;

use clap::Parser;
use vision_export::{
    backend::{self, TrainingBackend},
    recipe::{self, Recipe},
};

/// Export a pretrained network as-is, without training.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(value_enum, default_value = "resnet152-imagenet")]
    recipe: Recipe,
    /// PyTorch state dict with the pretrained weights.
    #[arg(long)]
    pretrained: PathBuf,
    #[arg(long, default_value = "/tmp/vision-export")]
    artifact_dir: PathBuf,
}

fn main() {
    let args = Args::parse();

    let mut config = args.recipe.config();
    config.pretrained = Some(args.pretrained);
    config.training.num_epochs = 0;

    let artifact_dir = args.artifact_dir.join(&config.name);
    match recipe::run::<TrainingBackend>(&config, &artifact_dir, backend::device()) {
        Ok(summary) => {
            println!("Exported {} parameters", summary.num_params);
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
