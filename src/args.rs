//! Command-line arguments for sample generation.
//!
//! The flags are split into groups the same way they show up in `--help`:
//! text generation, model shape, parallel layout, tokenizer, checkpoint,
//! inference engine and logging.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{GenerateError, Result};

/// Full argument set of `generate_samples_gpt`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Sample text from a GPT model")]
pub struct Args {
    #[command(flatten)]
    pub text: TextGenerationArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub parallel: ParallelArgs,

    #[command(flatten)]
    pub tokenizer: TokenizerArgs,

    /// Directory containing a model checkpoint to load.
    #[arg(long, help_heading = "checkpointing")]
    pub load: Option<PathBuf>,

    #[command(flatten)]
    pub inference: InferenceArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

/// Text generation arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "text generation")]
pub struct TextGenerationArgs {
    /// Sampling temperature.
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,

    /// Use greedy sampling.
    #[arg(long)]
    pub greedy: bool,

    /// Top p sampling.
    #[arg(long = "top_p", default_value_t = 0.0)]
    pub top_p: f32,

    /// Top k sampling.
    #[arg(long = "top_k", default_value_t = 0)]
    pub top_k: usize,

    /// Size of the output generated text.
    #[arg(long, default_value_t = 1024)]
    pub out_seq_length: usize,

    /// Get input from file instead of interactive mode, each line is an input.
    #[arg(long)]
    pub sample_input_file: Option<PathBuf>,

    /// Output file got from --sample-input-file.
    #[arg(long)]
    pub sample_output_file: Option<PathBuf>,

    /// Number of samples to generate unconditionally, defaults to 0 and
    /// interactive conditional sampling.
    #[arg(long, default_value_t = 0)]
    pub num_samples: usize,

    /// Output file when generating unconditionally.
    #[arg(long)]
    pub genfile: Option<PathBuf>,

    /// During generation recompute all attention instead of using previously
    /// computed keys/values.
    #[arg(long)]
    pub recompute: bool,
}

/// Model shape arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "model")]
pub struct ModelArgs {
    #[arg(long, default_value_t = 24)]
    pub num_layers: usize,

    #[arg(long, default_value_t = 1024)]
    pub hidden_size: usize,

    #[arg(long, default_value_t = 16)]
    pub num_attention_heads: usize,

    /// Defaults to 4 x hidden size.
    #[arg(long)]
    pub ffn_hidden_size: Option<usize>,

    /// Maximum sequence length processed.
    #[arg(long, default_value_t = 1024)]
    pub seq_length: usize,

    /// Defaults to the sequence length.
    #[arg(long)]
    pub max_position_embeddings: Option<usize>,

    #[arg(long, default_value_t = 1e-5)]
    pub layernorm_epsilon: f32,

    /// Standard deviation of the normal weight initialization.
    #[arg(long, default_value_t = 0.02)]
    pub init_method_std: f32,

    /// Pad the vocab size to be divisible by this value times the tensor
    /// model parallel size.
    #[arg(long, default_value_t = 128)]
    pub make_vocab_size_divisible_by: usize,

    /// Random seed for weight initialization and sampling.
    #[arg(long, default_value_t = 1234)]
    pub seed: u64,
}

/// Parallel layout arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "distributed")]
pub struct ParallelArgs {
    #[arg(long, default_value_t = 1)]
    pub tensor_model_parallel_size: usize,

    #[arg(long, default_value_t = 1)]
    pub pipeline_model_parallel_size: usize,

    /// Number of layers per virtual pipeline stage (interleaved schedule).
    #[arg(long)]
    pub num_layers_per_virtual_pipeline_stage: Option<usize>,

    #[arg(long, default_value_t = 1)]
    pub micro_batch_size: usize,
}

/// Tokenizer arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "tokenizer")]
pub struct TokenizerArgs {
    #[arg(long, value_enum, default_value_t = TokenizerType::Gpt2BpeTokenizer)]
    pub tokenizer_type: TokenizerType,

    /// BPE vocabulary (vocab.json).
    #[arg(long)]
    pub vocab_file: Option<PathBuf>,

    /// BPE merge rules (merges.txt).
    #[arg(long)]
    pub merge_file: Option<PathBuf>,

    /// Serialized tokenizer JSON, used instead of vocab and merge files.
    #[arg(long)]
    pub tokenizer_file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerType {
    #[value(name = "GPT2BPETokenizer")]
    Gpt2BpeTokenizer,
}

/// Accelerated inference engine arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "inference engine")]
pub struct InferenceArgs {
    /// Replace the transformer layers with fused inference layers.
    #[arg(long)]
    pub ds_inference: bool,

    /// Store the fused layer weights as int8.
    #[arg(long)]
    pub ds_inference_quantize: bool,

    /// Number of quantization groups per weight matrix.
    #[arg(long, default_value_t = 1)]
    pub quantize_groups: usize,
}

/// Logging arguments.
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "logging")]
pub struct LoggingArgs {
    /// Report timing every this many unconditional samples.
    #[arg(long, default_value_t = 100)]
    pub log_interval: usize,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl ModelArgs {
    pub fn ffn_hidden_size(&self) -> usize {
        self.ffn_hidden_size.unwrap_or(4 * self.hidden_size)
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings.unwrap_or(self.seq_length)
    }

    pub fn kv_channels(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

impl Args {
    /// Check cross-argument constraints that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let p = &self.parallel;
        let t = &self.text;

        if m.num_layers == 0 || m.hidden_size == 0 || m.num_attention_heads == 0 {
            return invalid("num layers, hidden size and attention heads must be positive");
        }
        if p.tensor_model_parallel_size == 0 || p.pipeline_model_parallel_size == 0 {
            return invalid("parallel sizes must be positive");
        }
        if m.hidden_size % m.num_attention_heads != 0 {
            return invalid(format!(
                "hidden size {} is not divisible by {} attention heads",
                m.hidden_size, m.num_attention_heads
            ));
        }
        if m.num_attention_heads % p.tensor_model_parallel_size != 0 {
            return invalid(format!(
                "{} attention heads are not divisible by tensor model parallel size {}",
                m.num_attention_heads, p.tensor_model_parallel_size
            ));
        }
        if m.ffn_hidden_size() % p.tensor_model_parallel_size != 0 {
            return invalid(format!(
                "ffn hidden size {} is not divisible by tensor model parallel size {}",
                m.ffn_hidden_size(),
                p.tensor_model_parallel_size
            ));
        }
        if m.num_layers % p.pipeline_model_parallel_size != 0 {
            return invalid(format!(
                "{} layers are not divisible by pipeline model parallel size {}",
                m.num_layers, p.pipeline_model_parallel_size
            ));
        }
        if m.max_position_embeddings() < m.seq_length {
            return invalid(format!(
                "max position embeddings {} is smaller than sequence length {}",
                m.max_position_embeddings(),
                m.seq_length
            ));
        }
        if m.seq_length < 2 {
            return invalid("sequence length must be at least 2");
        }
        if !t.greedy && !(t.temperature > 0.0) {
            return invalid("temperature must be positive unless --greedy is set");
        }
        if !(0.0..=1.0).contains(&t.top_p) {
            return invalid("top_p must lie in [0, 1]");
        }
        if t.num_samples > 0 && t.genfile.is_none() {
            return invalid("--genfile is required when --num-samples is positive");
        }
        if p.micro_batch_size == 0 {
            return invalid("micro batch size must be positive");
        }
        if self.inference.quantize_groups == 0 {
            return invalid("quantize groups must be positive");
        }
        Ok(())
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(GenerateError::InvalidArgument(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["generate_samples_gpt"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_text_generation_defaults() {
        let args = parse(&[]);
        assert_eq!(args.text.temperature, 1.0);
        assert!(!args.text.greedy);
        assert_eq!(args.text.top_p, 0.0);
        assert_eq!(args.text.top_k, 0);
        assert_eq!(args.text.out_seq_length, 1024);
        assert_eq!(args.text.num_samples, 0);
        assert!(args.text.genfile.is_none());
        assert!(!args.text.recompute);
        assert_eq!(args.tokenizer.tokenizer_type, TokenizerType::Gpt2BpeTokenizer);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_flag_spellings() {
        let args = parse(&[
            "--top_p", "0.9", "--top_k", "40", "--out-seq-length", "64",
            "--num-samples", "3", "--genfile", "out.jsonl", "--recompute",
            "--tokenizer-type", "GPT2BPETokenizer",
        ]);
        assert_eq!(args.text.top_p, 0.9);
        assert_eq!(args.text.top_k, 40);
        assert_eq!(args.text.out_seq_length, 64);
        assert_eq!(args.text.num_samples, 3);
        assert!(args.text.recompute);
    }

    #[test]
    fn test_derived_sizes() {
        let args = parse(&[
            "--hidden-size",
            "64",
            "--num-attention-heads",
            "4",
            "--seq-length",
            "32",
        ]);
        assert_eq!(args.model.ffn_hidden_size(), 256);
        assert_eq!(args.model.max_position_embeddings(), 32);
        assert_eq!(args.model.kv_channels(), 16);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let args = parse(&["--hidden-size", "65", "--num-attention-heads", "4"]);
        assert!(args.validate().is_err());

        let args = parse(&["--num-attention-heads", "16", "--tensor-model-parallel-size", "3"]);
        assert!(args.validate().is_err());

        let args = parse(&["--num-layers", "3", "--pipeline-model-parallel-size", "2"]);
        assert!(args.validate().is_err());

        let args = parse(&["--seq-length", "64", "--max-position-embeddings", "32"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sampling() {
        assert!(parse(&["--temperature", "0"]).validate().is_err());
        assert!(parse(&["--temperature", "0", "--greedy"]).validate().is_ok());
        assert!(parse(&["--temperature", "NaN"]).validate().is_err());
        assert!(parse(&["--temperature=-0.5"]).validate().is_err());
        assert!(parse(&["--top_p", "1.5"]).validate().is_err());
        assert!(parse(&["--num-samples", "2"]).validate().is_err());
    }
}
