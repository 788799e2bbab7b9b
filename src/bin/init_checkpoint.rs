//! Write a freshly initialized GPT model as a checkpoint that
//! `generate_samples_gpt --load` accepts.

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use gpt_generate::checkpoint::{save_checkpoint, Tracker};
use gpt_generate::initialize::{get_model, init_logging, initialize};
use gpt_generate::model::GptModel;

#[derive(Parser, Debug)]
#[command(about = "Initialize a GPT checkpoint from a seed")]
struct Cli {
    #[command(flatten)]
    args: gpt_generate::Args,

    /// Directory to write the checkpoint to.
    #[arg(long)]
    save: PathBuf,

    /// Save as this iteration instead of a release checkpoint.
    #[arg(long)]
    iteration: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.args.logging.log_format);
    ensure!(
        cli.args.parallel.num_layers_per_virtual_pipeline_stage.is_none(),
        "interleaved pipeline checkpoints are not supported"
    );

    let runtime = initialize(cli.args).context("failed to initialize")?;
    let models = get_model(
        |spec| {
            Ok(GptModel::new(
                runtime.gpt_config.clone(),
                runtime.parallel.tensor,
                spec,
                runtime.seed(),
            ))
        },
        &runtime,
    )?;
    let tracker = cli.iteration.map_or(Tracker::Release, Tracker::Iteration);
    for model in &models {
        save_checkpoint(&cli.save, tracker, model)?;
    }
    println!("Saved checkpoint to {}", cli.save.display());
    Ok(())
}
