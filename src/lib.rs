//! GPT text sampling: model, checkpoints, tokenizer and the generation
//! loops behind the `generate_samples_gpt` binary.

pub mod args;
pub mod checkpoint;
pub mod error;
pub mod generation;
pub mod inference;
pub mod initialize;
pub mod kv_cache;
pub mod model;
pub mod parallel;
pub mod sampling;
pub mod tokenizer;

pub use args::Args;
pub use error::{GenerateError, Result};
pub use generation::{Completion, GenerationSettings, Generator, Sample, TokenStream};
pub use model::{GptConfig, GptModel, GptPipeline, LanguageModel, StageSpec};
pub use sampling::{Sampler, SamplingParams};
pub use tokenizer::Tokenizer;
