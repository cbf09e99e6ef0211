/// Average the most recent checkpoints of a training run
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nmt_layers::{average_checkpoints, AveragingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "average-checkpoints",
    about = "Average the model tensors of the last checkpoints into a new checkpoint."
)]
struct Cli {
    /// JSON averaging configuration (command line flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing the checkpoints to average
    #[arg(long, required_unless_present = "config")]
    model_dir: Option<PathBuf>,

    /// Directory receiving the averaged checkpoint
    #[arg(long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    /// Maximum number of most recent checkpoints to average
    #[arg(long)]
    max_count: Option<usize>,

    /// Prefix of the tensors to average
    #[arg(long)]
    model_key: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AveragingConfig> {
        let mut config = match &self.config {
            Some(path) => AveragingConfig::from_json_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            None => AveragingConfig::new(PathBuf::new(), PathBuf::new()),
        };

        if let Some(model_dir) = self.model_dir {
            config.model_dir = model_dir;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(max_count) = self.max_count {
            config.max_count = max_count;
        }
        if let Some(model_key) = self.model_key {
            config.model_key = model_key;
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    log::debug!("Averaging configuration: {:#?}", config);

    let path = average_checkpoints(&config).context("Checkpoint averaging failed")?;
    println!("{}", path.display());

    Ok(())
}
