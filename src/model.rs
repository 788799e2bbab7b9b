//! GPT model: one pipeline stage per [`GptModel`], stages chained in a
//! [`GptPipeline`].

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{s, Array1, Array2, ArrayD, ArrayView2, ArrayViewMut1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{GenerateError, Result};
use crate::kv_cache::{KvCache, LayerKvCache};
use crate::parallel::{
    take1, take2, ColumnParallelLinear, ParallelConfig, RowParallelLinear, VocabParallelEmbedding,
};

/// Named tensors of one rank, as written to and read from checkpoints.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// Shape of the transformer.
#[derive(Clone, Debug, PartialEq)]
pub struct GptConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub ffn_hidden_size: usize,
    /// Vocabulary size after padding.
    pub padded_vocab_size: usize,
    pub max_position_embeddings: usize,
    pub layernorm_epsilon: f32,
    pub init_method_std: f32,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            hidden_size: 64,
            num_attention_heads: 4,
            ffn_hidden_size: 256,
            padded_vocab_size: 128,
            max_position_embeddings: 128,
            layernorm_epsilon: 1e-5,
            init_method_std: 0.02,
        }
    }
}

impl GptConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Seeded normal initialization. Every tensor gets its own stream keyed by
/// (layer, slot) so the weights do not depend on how the model is split.
struct Initializer {
    seed: u64,
    std: f32,
    output_std: f32,
}

const EMBEDDING_LAYER: usize = usize::MAX;

impl Initializer {
    fn new(seed: u64, config: &GptConfig) -> Self {
        Self {
            seed,
            std: config.init_method_std,
            output_std: config.init_method_std / (2.0 * config.num_layers as f32).sqrt(),
        }
    }

    fn normal(&self, shape: (usize, usize), layer: usize, slot: u64, std: f32) -> Array2<f32> {
        let stream = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((layer as u64).wrapping_mul(16))
            .wrapping_add(slot);
        let mut rng = StdRng::seed_from_u64(stream);
        Array2::from_shape_fn(shape, |_| {
            let z: f32 = StandardNormal.sample(&mut rng);
            z * std
        })
    }

    fn linear(&self, inp: usize, out: usize, layer: usize, slot: u64, std: f32) -> Linear {
        Linear::from_parts(self.normal((out, inp), layer, slot, std), Some(Array1::zeros(out)))
    }
}

/// Fully connected layer.
#[derive(Clone)]
pub struct Linear {
    weight: Array2<f32>, // out x in
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn from_parts(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    pub fn save(&self, prefix: &str, out: &mut StateDict) {
        out.insert(format!("{prefix}.weight"), self.weight.clone().into_dyn());
        if let Some(b) = &self.bias {
            out.insert(format!("{prefix}.bias"), b.clone().into_dyn());
        }
    }

    pub fn load(&mut self, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.weight = take2(tensors, &format!("{prefix}.weight"), self.weight.dim())?;
        if let Some(b) = &mut self.bias {
            *b = take1(tensors, &format!("{prefix}.bias"), b.len())?;
        }
        Ok(())
    }
}

/// Layer normalization over the hidden dimension.
#[derive(Clone)]
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f32) -> Self {
        Self { weight: Array1::ones(dim), bias: Array1::zeros(dim), eps }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + self.eps).sqrt();
            for ((v, w), b) in row.iter_mut().zip(&self.weight).zip(&self.bias) {
                *v = (*v - mean) / denom * w + b;
            }
        }
        out
    }

    pub fn save(&self, prefix: &str, out: &mut StateDict) {
        out.insert(format!("{prefix}.weight"), self.weight.clone().into_dyn());
        out.insert(format!("{prefix}.bias"), self.bias.clone().into_dyn());
    }

    pub fn load(&mut self, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.weight = take1(tensors, &format!("{prefix}.weight"), self.weight.len())?;
        self.bias = take1(tensors, &format!("{prefix}.bias"), self.bias.len())?;
        Ok(())
    }
}

/// GELU, tanh approximation.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_6 * x * (1.0 + 0.044_715 * x * x)).tanh())
}

fn softmax_in_place(mut row: ArrayViewMut1<'_, f32>) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

fn attend(
    q: ArrayView2<'_, f32>,
    k: ArrayView2<'_, f32>,
    v: ArrayView2<'_, f32>,
    start: usize,
    scale: f32,
) -> Array2<f32> {
    let mut scores = q.dot(&k.t()) / scale;
    for (i, mut row) in scores.axis_iter_mut(Axis(0)).enumerate() {
        // query i sits at absolute position start + i
        for s in row.iter_mut().skip(start + i + 1) {
            *s = f32::NEG_INFINITY;
        }
        softmax_in_place(row);
    }
    scores.dot(&v)
}

/// Causal self attention over a fused QKV projection laid out per head as
/// `[q | k | v]`. `heads` are the global head indices the columns belong to,
/// used to address the cache. Returns `[seq, heads * head_dim]`.
pub fn causal_attention(
    qkv: &Array2<f32>,
    heads: Range<usize>,
    head_dim: usize,
    mut cache: Option<&mut LayerKvCache>,
    start: usize,
) -> Result<Array2<f32>> {
    let seq = qkv.nrows();
    let scale = (head_dim as f32).sqrt();
    let mut out = Array2::<f32>::zeros((seq, heads.len() * head_dim));

    for (local, head) in heads.enumerate() {
        let base = local * 3 * head_dim;
        let q = qkv.slice(s![.., base..base + head_dim]);
        let k = qkv.slice(s![.., base + head_dim..base + 2 * head_dim]);
        let v = qkv.slice(s![.., base + 2 * head_dim..base + 3 * head_dim]);

        let ctx = match cache.as_deref_mut() {
            Some(layer) => {
                let (keys, values) = layer.extend(head, k, v)?;
                attend(q, keys, values, start, scale)
            }
            None => attend(q, k, v, 0, scale),
        };
        out.slice_mut(s![.., local * head_dim..(local + 1) * head_dim])
            .assign(&ctx);
    }
    Ok(out)
}

/// Multi-head attention with heads split across tensor ranks.
#[derive(Clone)]
pub struct ParallelAttention {
    query_key_value: ColumnParallelLinear,
    dense: RowParallelLinear,
    heads_per_partition: usize,
    head_dim: usize,
}

impl ParallelAttention {
    pub fn forward(
        &self,
        x: &Array2<f32>,
        start: usize,
        mut cache: Option<&mut LayerKvCache>,
    ) -> Result<Array2<f32>> {
        let np = self.heads_per_partition;
        let mut partials = Vec::with_capacity(self.query_key_value.tp());
        for rank in 0..self.query_key_value.tp() {
            let qkv = self.query_key_value.forward_rank(rank, x);
            let heads = rank * np..(rank + 1) * np;
            let ctx = causal_attention(&qkv, heads, self.head_dim, cache.as_deref_mut(), start)?;
            partials.push(ctx);
        }
        Ok(self.dense.forward_partitions(&partials))
    }
}

/// Feed-forward block: h -> ffn (GELU) -> h.
#[derive(Clone)]
pub struct ParallelMlp {
    dense_h_to_4h: ColumnParallelLinear,
    dense_4h_to_h: RowParallelLinear,
}

impl ParallelMlp {
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let partials: Vec<_> = (0..self.dense_h_to_4h.tp())
            .map(|rank| self.dense_h_to_4h.forward_rank(rank, x).mapv(gelu))
            .collect();
        self.dense_4h_to_h.forward_partitions(&partials)
    }
}

/// Pre-layernorm transformer block.
#[derive(Clone)]
pub struct ParallelTransformerLayer {
    input_layernorm: LayerNorm,
    attention: ParallelAttention,
    post_attention_layernorm: LayerNorm,
    mlp: ParallelMlp,
}

impl ParallelTransformerLayer {
    fn new(config: &GptConfig, tp: usize, layer: usize, init: &Initializer) -> Self {
        let h = config.hidden_size;
        let eps = config.layernorm_epsilon;
        let qkv = init.linear(h, 3 * h, layer, 0, init.std);
        let dense = init.linear(h, h, layer, 1, init.output_std);
        let up = init.linear(h, config.ffn_hidden_size, layer, 2, init.std);
        let down = init.linear(config.ffn_hidden_size, h, layer, 3, init.output_std);

        Self {
            input_layernorm: LayerNorm::new(h, eps),
            attention: ParallelAttention {
                query_key_value: ColumnParallelLinear::split(&qkv, tp),
                dense: RowParallelLinear::split(&dense, tp),
                heads_per_partition: config.num_attention_heads / tp,
                head_dim: config.head_dim(),
            },
            post_attention_layernorm: LayerNorm::new(h, eps),
            mlp: ParallelMlp {
                dense_h_to_4h: ColumnParallelLinear::split(&up, tp),
                dense_4h_to_h: RowParallelLinear::split(&down, tp),
            },
        }
    }

    pub fn forward(
        &self,
        x: &Array2<f32>,
        start: usize,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<Array2<f32>> {
        let attn = self
            .attention
            .forward(&self.input_layernorm.forward(x), start, cache)?;
        let h = x + &attn;
        let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&h));
        Ok(h + &mlp)
    }

    /// Gathered (unsplit) weights, in the order qkv, dense, h_to_4h, 4h_to_h.
    pub(crate) fn gathered(&self) -> Result<GatheredLayer> {
        Ok(GatheredLayer {
            input_layernorm: self.input_layernorm.clone(),
            query_key_value: self.attention.query_key_value.gather()?,
            dense: self.attention.dense.gather()?,
            post_attention_layernorm: self.post_attention_layernorm.clone(),
            dense_h_to_4h: self.mlp.dense_h_to_4h.gather()?,
            dense_4h_to_h: self.mlp.dense_4h_to_h.gather()?,
        })
    }

    fn save(&self, rank: usize, prefix: &str, out: &mut StateDict) {
        self.input_layernorm.save(&format!("{prefix}.input_layernorm"), out);
        self.attention
            .query_key_value
            .save(rank, &format!("{prefix}.attention.query_key_value"), out);
        self.attention.dense.save(rank, &format!("{prefix}.attention.dense"), out);
        self.post_attention_layernorm
            .save(&format!("{prefix}.post_attention_layernorm"), out);
        self.mlp.dense_h_to_4h.save(rank, &format!("{prefix}.mlp.dense_h_to_4h"), out);
        self.mlp.dense_4h_to_h.save(rank, &format!("{prefix}.mlp.dense_4h_to_h"), out);
    }

    fn load(&mut self, rank: usize, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.input_layernorm
            .load(&format!("{prefix}.input_layernorm"), tensors)?;
        self.attention
            .query_key_value
            .load(rank, &format!("{prefix}.attention.query_key_value"), tensors)?;
        self.attention
            .dense
            .load(rank, &format!("{prefix}.attention.dense"), tensors)?;
        self.post_attention_layernorm
            .load(&format!("{prefix}.post_attention_layernorm"), tensors)?;
        self.mlp
            .dense_h_to_4h
            .load(rank, &format!("{prefix}.mlp.dense_h_to_4h"), tensors)?;
        self.mlp
            .dense_4h_to_h
            .load(rank, &format!("{prefix}.mlp.dense_4h_to_h"), tensors)
    }
}

/// Unsplit weights of one layer.
pub(crate) struct GatheredLayer {
    pub input_layernorm: LayerNorm,
    pub query_key_value: Linear,
    pub dense: Linear,
    pub post_attention_layernorm: LayerNorm,
    pub dense_h_to_4h: Linear,
    pub dense_4h_to_h: Linear,
}

/// What a model provider is asked to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    /// Stage owns the embeddings.
    pub pre_process: bool,
    /// Stage owns the final layernorm and the output logits.
    pub post_process: bool,
    /// Global indices of the transformer layers of this stage.
    pub layers: Range<usize>,
}

/// Input of a pipeline stage.
pub enum StageInput<'a> {
    Tokens(&'a [usize]),
    Hidden(Array2<f32>),
}

const WORD_EMBEDDINGS: &str = "language_model.embedding.word_embeddings";
const POSITION_EMBEDDINGS: &str = "language_model.embedding.position_embeddings";
const HEAD_EMBEDDINGS: &str = "word_embeddings_for_head";
const FINAL_LAYERNORM: &str = "language_model.transformer.final_layernorm";

fn layer_prefix(layer: usize) -> String {
    format!("language_model.transformer.layers.{layer}")
}

/// One pipeline stage of a GPT model.
#[derive(Clone)]
pub struct GptModel {
    config: GptConfig,
    tp: usize,
    spec: StageSpec,
    word_embeddings: Option<VocabParallelEmbedding>,
    position_embeddings: Option<Array2<f32>>,
    layers: Vec<ParallelTransformerLayer>,
    final_layernorm: Option<LayerNorm>,
}

impl GptModel {
    pub fn new(config: GptConfig, tp: usize, spec: StageSpec, seed: u64) -> Self {
        let init = Initializer::new(seed, &config);
        let h = config.hidden_size;

        // the last stage keeps its own copy of the word embeddings for the
        // output logits; it is drawn from the same stream as the input copy
        let word_embeddings = (spec.pre_process || spec.post_process).then(|| {
            let table = init.normal((config.padded_vocab_size, h), EMBEDDING_LAYER, 0, init.std);
            VocabParallelEmbedding::split(&table, tp)
        });
        let position_embeddings = spec.pre_process.then(|| {
            init.normal((config.max_position_embeddings, h), EMBEDDING_LAYER, 1, init.std)
        });
        let layers = spec
            .layers
            .clone()
            .map(|layer| ParallelTransformerLayer::new(&config, tp, layer, &init))
            .collect();
        let final_layernorm = spec
            .post_process
            .then(|| LayerNorm::new(h, config.layernorm_epsilon));

        Self {
            config,
            tp,
            spec,
            word_embeddings,
            position_embeddings,
            layers,
            final_layernorm,
        }
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.tp
    }

    pub fn layers(&self) -> &[ParallelTransformerLayer] {
        &self.layers
    }

    pub fn word_embeddings(&self) -> Option<&VocabParallelEmbedding> {
        self.word_embeddings.as_ref()
    }

    pub(crate) fn position_embeddings(&self) -> Option<&Array2<f32>> {
        self.position_embeddings.as_ref()
    }

    pub(crate) fn final_layernorm(&self) -> Option<&LayerNorm> {
        self.final_layernorm.as_ref()
    }

    /// Run this stage. Returns logits on the last stage and hidden states
    /// otherwise. `start` is the absolute position of the first row.
    pub fn forward(
        &self,
        input: StageInput<'_>,
        start: usize,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Array2<f32>> {
        let mut h = match input {
            StageInput::Tokens(tokens) => self.embed(tokens, start)?,
            StageInput::Hidden(h) => h,
        };

        for (offset, layer) in self.layers.iter().enumerate() {
            let global = self.spec.layers.start + offset;
            let layer_cache = cache.as_deref_mut().map(|c| c.layer_mut(global));
            h = layer.forward(&h, start, layer_cache)?;
        }

        match (&self.final_layernorm, &self.word_embeddings) {
            (Some(norm), Some(head)) if self.spec.post_process => {
                head.lm_logits(&norm.forward(&h))
            }
            _ => Ok(h),
        }
    }

    fn embed(&self, tokens: &[usize], start: usize) -> Result<Array2<f32>> {
        let (Some(words), Some(positions)) = (&self.word_embeddings, &self.position_embeddings)
        else {
            return Err(GenerateError::InvalidArgument(
                "token input given to a stage without embeddings".to_string(),
            ));
        };
        let mut h = words.forward(tokens)?;
        let rows = positions.slice(s![start..start + tokens.len(), ..]);
        h += &rows;
        Ok(h)
    }

    /// Make the output embedding of a post-process stage equal to `source`.
    pub fn tie_word_embeddings(&mut self, source: &VocabParallelEmbedding) {
        if self.spec.post_process {
            self.word_embeddings = Some(source.clone());
        }
    }

    /// Tensors of tensor rank `rank` of this stage.
    pub fn state_dict(&self, rank: usize) -> StateDict {
        let mut out = StateDict::new();
        if let Some(words) = &self.word_embeddings {
            let name = if self.spec.pre_process { WORD_EMBEDDINGS } else { HEAD_EMBEDDINGS };
            words.save(rank, name, &mut out);
        }
        if let Some(pos) = &self.position_embeddings {
            out.insert(format!("{POSITION_EMBEDDINGS}.weight"), pos.clone().into_dyn());
        }
        for (offset, layer) in self.layers.iter().enumerate() {
            layer.save(rank, &layer_prefix(self.spec.layers.start + offset), &mut out);
        }
        if let Some(norm) = &self.final_layernorm {
            norm.save(FINAL_LAYERNORM, &mut out);
        }
        out
    }

    pub fn load_state_dict(&mut self, rank: usize, tensors: &StateDict) -> Result<()> {
        if let Some(words) = &mut self.word_embeddings {
            let name = if self.spec.pre_process { WORD_EMBEDDINGS } else { HEAD_EMBEDDINGS };
            words.load(rank, name, tensors)?;
        }
        if let Some(pos) = &mut self.position_embeddings {
            *pos = take2(tensors, &format!("{POSITION_EMBEDDINGS}.weight"), pos.dim())?;
        }
        let first = self.spec.layers.start;
        for (offset, layer) in self.layers.iter_mut().enumerate() {
            layer.load(rank, &layer_prefix(first + offset), tensors)?;
        }
        if let Some(norm) = &mut self.final_layernorm {
            norm.load(FINAL_LAYERNORM, tensors)?;
        }
        Ok(())
    }
}

/// Anything that maps a token sequence to next-token logits.
pub trait LanguageModel {
    fn config(&self) -> &GptConfig;

    /// Logits `[tokens.len(), padded_vocab]`. With a cache the tokens
    /// continue the cached sequence and are appended to it.
    fn forward(&self, tokens: &[usize], cache: Option<&mut KvCache>) -> Result<Array2<f32>>;

    fn new_cache(&self) -> KvCache {
        let c = self.config();
        KvCache::new(c.num_layers, c.num_attention_heads, c.head_dim(), c.max_position_embeddings)
    }
}

/// Absolute position of the first new token, checked against the position
/// table and the cache capacity.
pub(crate) fn start_position(
    config: &GptConfig,
    tokens: usize,
    cache: Option<&KvCache>,
) -> Result<usize> {
    let start = cache.map(KvCache::len).unwrap_or(0);
    if start + tokens > config.max_position_embeddings {
        return Err(GenerateError::PositionOverflow {
            position: start + tokens - 1,
            max: config.max_position_embeddings,
        });
    }
    if let Some(cache) = cache {
        cache.reserve(tokens)?;
    }
    Ok(start)
}

/// All pipeline stages of one model chunk, executed in order.
#[derive(Clone)]
pub struct GptPipeline {
    stages: Vec<GptModel>,
}

impl GptPipeline {
    /// Chain stages in order. Only a chunk that starts with embeddings
    /// accepts tokens, and only one that ends with the output layer yields
    /// logits.
    pub fn new(stages: Vec<GptModel>) -> Result<Self> {
        if stages.is_empty() {
            return Err(GenerateError::InvalidArgument("pipeline has no stages".to_string()));
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[GptModel] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [GptModel] {
        &mut self.stages
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.stages[0].tp
    }

    pub fn pipeline_parallel_size(&self) -> usize {
        self.stages.len()
    }

    pub fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::new(self.tensor_parallel_size(), self.pipeline_parallel_size())
    }
}

impl LanguageModel for GptPipeline {
    fn config(&self) -> &GptConfig {
        &self.stages[0].config
    }

    fn forward(&self, tokens: &[usize], mut cache: Option<&mut KvCache>) -> Result<Array2<f32>> {
        let start = start_position(self.config(), tokens.len(), cache.as_deref())?;
        let mut input = StageInput::Tokens(tokens);
        let mut out = Array2::zeros((0, 0));
        for stage in &self.stages {
            out = stage.forward(input, start, cache.as_deref_mut())?;
            input = StageInput::Hidden(out.clone());
        }
        Ok(out)
    }
}
