//! Process setup: logging, argument checks, tokenizer, model layout and
//! model construction.

use crate::args::{Args, LogFormat};
use crate::error::{GenerateError, Result};
use crate::model::{GptConfig, GptModel, GptPipeline, StageSpec};
use crate::parallel::ParallelConfig;
use crate::sampling::{Sampler, SamplingParams};
use crate::tokenizer::{build_tokenizer, vocab_size_with_padding, Tokenizer};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Logs go to stderr so stdout only carries samples.
pub fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // a second call (tests) keeps the first subscriber
    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_timer(tracing_subscriber::fmt::time::uptime())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
    };
}

/// Everything derived from the arguments before the model is built.
pub struct Runtime {
    pub args: Args,
    pub parallel: ParallelConfig,
    pub tokenizer: Box<dyn Tokenizer>,
    pub gpt_config: GptConfig,
}

impl Runtime {
    pub fn seed(&self) -> u64 {
        self.args.model.seed
    }

    /// Sampler over the real (unpadded) vocabulary.
    pub fn sampler(&self) -> Sampler {
        Sampler::new(
            SamplingParams::from(&self.args.text),
            self.tokenizer.vocab_size(),
            self.seed(),
        )
    }
}

/// Model hyperparameters for a padded vocabulary size.
pub fn gpt_config(args: &Args, padded_vocab_size: usize) -> GptConfig {
    let m = &args.model;
    GptConfig {
        num_layers: m.num_layers,
        hidden_size: m.hidden_size,
        num_attention_heads: m.num_attention_heads,
        ffn_hidden_size: m.ffn_hidden_size(),
        padded_vocab_size,
        max_position_embeddings: m.max_position_embeddings(),
        layernorm_epsilon: m.layernorm_epsilon,
        init_method_std: m.init_method_std,
    }
}

/// Validate `args` and build the tokenizer they select.
pub fn initialize(args: Args) -> Result<Runtime> {
    let tokenizer = build_tokenizer(&args.tokenizer)?;
    initialize_with_tokenizer(args, tokenizer)
}

/// Same as [`initialize`] with an already constructed tokenizer. This is
/// where the arguments are validated.
pub fn initialize_with_tokenizer(args: Args, tokenizer: Box<dyn Tokenizer>) -> Result<Runtime> {
    args.validate()?;
    let p = &args.parallel;
    let parallel = ParallelConfig {
        tensor: p.tensor_model_parallel_size,
        pipeline: p.pipeline_model_parallel_size,
        virtual_stage_layers: p.num_layers_per_virtual_pipeline_stage,
    };
    let padded = vocab_size_with_padding(
        tokenizer.vocab_size(),
        args.model.make_vocab_size_divisible_by,
        parallel.tensor,
    );
    let gpt_config = gpt_config(&args, padded);

    tracing::info!(
        world_size = parallel.world_size(),
        tensor_model_parallel_size = parallel.tensor,
        pipeline_model_parallel_size = parallel.pipeline,
        seed = args.model.seed,
        "initialized model parallel layout"
    );
    Ok(Runtime { args, parallel, tokenizer, gpt_config })
}

/// Build one [`GptPipeline`] per model chunk, calling `provider` once per
/// pipeline stage of each chunk.
///
/// With an interleaved schedule every pipeline rank holds several chunks;
/// chunk `c` of stage `s` owns the layers after those of all earlier
/// (chunk, stage) pairs. Only the first stage of the first chunk embeds
/// tokens and only the last stage of the last chunk produces logits. When
/// the embedding and output layers live on different stages the output
/// layer is initialized from the input embedding.
pub fn get_model<F>(mut provider: F, runtime: &Runtime) -> Result<Vec<GptPipeline>>
where
    F: FnMut(StageSpec) -> Result<GptModel>,
{
    let parallel = &runtime.parallel;
    let num_layers = runtime.gpt_config.num_layers;
    let chunks = parallel.virtual_chunks(num_layers);
    let per_chunk = num_layers / chunks;

    let mut models = Vec::with_capacity(chunks);
    for chunk in 0..chunks {
        let mut stages = Vec::with_capacity(parallel.pipeline);
        for stage in 0..parallel.pipeline {
            let layers = parallel.stage_layers(stage, per_chunk);
            let offset = chunk * per_chunk;
            let spec = StageSpec {
                pre_process: chunk == 0 && parallel.is_first_stage(stage),
                post_process: chunk + 1 == chunks && parallel.is_last_stage(stage),
                layers: layers.start + offset..layers.end + offset,
            };
            let model = provider(spec.clone())?;
            if model.spec() != &spec {
                return Err(GenerateError::InvalidArgument(format!(
                    "model provider built {:?}, expected {:?}",
                    model.spec(),
                    spec
                )));
            }
            stages.push(model);
        }
        models.push(GptPipeline::new(stages)?);
    }

    if parallel.pipeline > 1 || chunks > 1 {
        let source = models
            .first()
            .and_then(|m| m.stages().first())
            .and_then(GptModel::word_embeddings)
            .cloned();
        let head = models.last_mut().and_then(|m| m.stages_mut().last_mut());
        if let (Some(source), Some(head)) = (source, head) {
            head.tie_word_embeddings(&source);
        }
    }

    let mut params = 0;
    for stage in models.iter().flat_map(|m| m.stages()) {
        for rank in 0..parallel.tensor {
            params += stage.state_dict(rank).values().map(|t| t.len()).sum::<usize>();
        }
    }
    tracing::info!(chunks, parameters = params, "number of parameters on all ranks");
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    struct Chars;

    impl Tokenizer for Chars {
        fn tokenize(&self, text: &str) -> Result<Vec<usize>> {
            Ok(text.bytes().map(usize::from).collect())
        }
        fn detokenize(&self, ids: &[usize]) -> Result<String> {
            Ok(ids.iter().map(|&i| i as u8 as char).collect())
        }
        fn eod(&self) -> usize {
            0
        }
        fn vocab_size(&self) -> usize {
            100
        }
    }

    fn runtime(extra: &[&str]) -> Runtime {
        let mut argv = vec![
            "generate_samples_gpt",
            "--num-layers",
            "4",
            "--hidden-size",
            "16",
            "--num-attention-heads",
            "4",
            "--seq-length",
            "32",
            "--make-vocab-size-divisible-by",
            "8",
        ];
        argv.extend_from_slice(extra);
        initialize_with_tokenizer(Args::parse_from(argv), Box::new(Chars)).unwrap()
    }

    fn build(runtime: &Runtime) -> Vec<GptPipeline> {
        let tp = runtime.parallel.tensor;
        get_model(
            |spec| Ok(GptModel::new(runtime.gpt_config.clone(), tp, spec, runtime.seed())),
            runtime,
        )
        .unwrap()
    }

    #[test]
    fn test_vocab_is_padded() {
        let rt = runtime(&["--tensor-model-parallel-size", "2"]);
        assert_eq!(rt.gpt_config.padded_vocab_size, 112);
        assert_eq!(rt.gpt_config.ffn_hidden_size, 64);
    }

    #[test]
    fn test_stage_layout() {
        let rt = runtime(&["--pipeline-model-parallel-size", "2"]);
        let models = build(&rt);
        assert_eq!(models.len(), 1);
        let stages = models[0].stages();
        assert_eq!(stages[0].spec().layers, 0..2);
        assert_eq!(stages[1].spec().layers, 2..4);
        assert!(stages[0].spec().pre_process && !stages[0].spec().post_process);
        assert!(stages[1].spec().post_process && !stages[1].spec().pre_process);

        let words = stages[0].word_embeddings().unwrap().gather().unwrap();
        let head = stages[1].word_embeddings().unwrap().gather().unwrap();
        assert_eq!(words, head);
    }

    #[test]
    fn test_interleaved_chunks() {
        let rt = runtime(&[
            "--pipeline-model-parallel-size",
            "2",
            "--num-layers-per-virtual-pipeline-stage",
            "1",
        ]);
        let models = build(&rt);
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].stages()[0].spec().layers, 2..3);
        assert!(!models[1].stages()[0].spec().pre_process);
    }

    #[test]
    fn test_initialize_validates_args() {
        let args = Args::parse_from(["generate_samples_gpt", "--hidden-size", "15"]);
        assert!(matches!(
            initialize_with_tokenizer(args, Box::new(Chars)),
            Err(GenerateError::InvalidArgument(_))
        ));
    }
}
