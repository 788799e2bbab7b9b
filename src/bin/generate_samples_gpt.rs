//! Sample text from a GPT model: conditioned on prompts from a file or an
//! interactive terminal, or unconditionally into a JSON-lines file.

use std::io;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use gpt_generate::args::Args;
use gpt_generate::checkpoint::load_checkpoint;
use gpt_generate::generation::{GenerationSettings, Generator};
use gpt_generate::inference::{init_inference, InferenceConfig};
use gpt_generate::initialize::{get_model, init_logging, initialize, Runtime};
use gpt_generate::model::{GptModel, LanguageModel, StageSpec};

/// Build one pipeline stage of the GPT model.
fn model_provider(runtime: &Runtime, spec: StageSpec) -> gpt_generate::Result<GptModel> {
    tracing::info!(
        layers = ?spec.layers,
        pre_process = spec.pre_process,
        post_process = spec.post_process,
        "building GPT model ..."
    );
    Ok(GptModel::new(
        runtime.gpt_config.clone(),
        runtime.parallel.tensor,
        spec,
        runtime.seed(),
    ))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.logging.log_format);

    if args.parallel.num_layers_per_virtual_pipeline_stage.is_some() {
        println!("Interleaved pipeline schedule is not yet supported for text generation.");
        std::process::exit(0);
    }

    let runtime = initialize(args).context("failed to initialize")?;
    let mut models = get_model(|spec| model_provider(&runtime, spec), &runtime)?;
    if let Some(dir) = &runtime.args.load {
        for model in &mut models {
            load_checkpoint(dir, model)
                .with_context(|| format!("failed to load checkpoint from {}", dir.display()))?;
        }
    }
    ensure!(models.len() == 1, "Above condition should have caught this");
    let model = models.pop().context("no model was built")?;

    let args = &runtime.args;
    let model: Box<dyn LanguageModel> = if args.inference.ds_inference {
        let config = InferenceConfig {
            mp_size: runtime.parallel.tensor,
            quantize: args.inference.ds_inference_quantize,
            quantize_groups: args.inference.quantize_groups,
        };
        let engine = init_inference(model, &config)?;
        tracing::info!("> inference engine initialized");
        Box::new(engine)
    } else {
        Box::new(model)
    };

    let settings =
        GenerationSettings::new(args.model.seq_length, &args.text, args.logging.log_interval);
    let mut generator =
        Generator::new(model.as_ref(), runtime.tokenizer.as_ref(), runtime.sampler(), settings);

    if args.text.num_samples == 0 {
        // conditional sampling handles one prompt at a time
        if let Some(input) = &args.text.sample_input_file {
            let output = generator
                .generate_samples_input_from_file(input, args.text.sample_output_file.as_deref())?;
            tracing::info!(path = %output.display(), "finished conditional sampling");
        } else {
            generator.generate_samples_interactive(io::stdin().lock(), io::stdout().lock())?;
        }
    } else {
        let genfile = args
            .text
            .genfile
            .as_deref()
            .context("--genfile is required for unconditional sampling")?;
        generator.generate_and_write_samples_unconditional(
            genfile,
            args.text.num_samples,
            args.parallel.micro_batch_size,
        )?;
    }
    Ok(())
}
