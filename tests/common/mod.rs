#![allow(dead_code)]

use gpt_generate::kv_cache::KvCache;
use gpt_generate::model::{GptConfig, GptModel, GptPipeline, LanguageModel, StageSpec};
use gpt_generate::{Result, Tokenizer};
use ndarray::Array2;

pub const EOD: usize = 0;
pub const VOCAB: usize = 128;

/// One token per ASCII byte, NUL is end-of-document.
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<usize>> {
        Ok(text.bytes().map(usize::from).collect())
    }

    fn detokenize(&self, ids: &[usize]) -> Result<String> {
        Ok(ids.iter().map(|&id| char::from(id as u8)).collect())
    }

    fn eod(&self) -> usize {
        EOD
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }
}

/// Predicts `token + 1`, and end-of-document in place of `stop`.
pub struct CountingModel {
    pub config: GptConfig,
    pub stop: usize,
}

impl CountingModel {
    pub fn new(stop: usize) -> Self {
        Self { config: GptConfig { padded_vocab_size: VOCAB, ..GptConfig::default() }, stop }
    }

    fn next(&self, token: usize) -> usize {
        if token + 1 == self.stop {
            EOD
        } else {
            token + 1
        }
    }
}

impl LanguageModel for CountingModel {
    fn config(&self) -> &GptConfig {
        &self.config
    }

    fn forward(&self, tokens: &[usize], _cache: Option<&mut KvCache>) -> Result<Array2<f32>> {
        let mut logits = Array2::zeros((tokens.len(), VOCAB));
        for (i, &t) in tokens.iter().enumerate() {
            logits[[i, self.next(t)]] = 1.0;
        }
        Ok(logits)
    }
}

pub fn small_config() -> GptConfig {
    GptConfig { padded_vocab_size: VOCAB, ..GptConfig::default() }
}

/// Model split over `tp` tensor ranks and `pp` pipeline stages.
pub fn pipeline(config: &GptConfig, tp: usize, pp: usize, seed: u64) -> GptPipeline {
    let per_stage = config.num_layers / pp;
    let mut stages: Vec<GptModel> = (0..pp)
        .map(|s| {
            let spec = StageSpec {
                pre_process: s == 0,
                post_process: s + 1 == pp,
                layers: s * per_stage..(s + 1) * per_stage,
            };
            GptModel::new(config.clone(), tp, spec, seed)
        })
        .collect();
    if pp > 1 {
        let words = stages[0].word_embeddings().unwrap().clone();
        stages[pp - 1].tie_word_embeddings(&words);
    }
    GptPipeline::new(stages).unwrap()
}

pub fn max_abs_diff(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    assert_eq!(a.dim(), b.dim());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
