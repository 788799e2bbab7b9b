//! Inference engine that replaces the partitioned transformer layers with
//! fused ones.
//!
//! Every tensor-parallel partition and pipeline stage is gathered back into
//! whole matrices, so a layer runs one QKV matmul, one MLP up projection and
//! one down projection. Optionally the fused weights are stored as int8 with
//! one scale per group of output rows.

use ndarray::{s, Array1, Array2, Axis};

use crate::error::{GenerateError, Result};
use crate::kv_cache::{KvCache, LayerKvCache};
use crate::model::{
    causal_attention, gelu, start_position, GptConfig, GptPipeline, LanguageModel, LayerNorm,
    Linear,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Tensor-parallel size the source model was partitioned with.
    pub mp_size: usize,
    pub quantize: bool,
    pub quantize_groups: usize,
}

/// Quantize rows of `t` to int8, one scale per group of rows.
fn quantize_tensor(t: &Array2<f32>, groups: usize) -> (Vec<i8>, Vec<f32>) {
    let rows = t.nrows();
    let groups = groups.clamp(1, rows.max(1));
    let rows_per_group = rows.div_ceil(groups);
    let mut data = Vec::with_capacity(t.len());
    let mut scales = Vec::with_capacity(groups);

    for chunk in t.axis_chunks_iter(Axis(0), rows_per_group) {
        let max = chunk.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
        let scale = if max == 0.0 { 1.0 } else { 127.0 / max };
        data.extend(chunk.iter().map(|&v| (v * scale).round() as i8));
        scales.push(1.0 / scale);
    }
    (data, scales)
}

/// Quantized linear layer.
///
/// The int8 levels are kept as `f32` once at construction, so a forward pass
/// is one matmul followed by scaling each output column by its group scale.
#[derive(Clone)]
pub struct QLinear {
    levels: Array2<f32>, // out x in, integral values in [-127, 127]
    row_scales: Array1<f32>,
    bias: Option<Array1<f32>>,
}

impl QLinear {
    pub fn from_linear(l: &Linear, groups: usize) -> Self {
        let (data, scales) = quantize_tensor(l.weight(), groups);
        let (out_features, in_features) = l.weight().dim();
        let rows_per_group = out_features.div_ceil(scales.len().max(1)).max(1);
        Self {
            levels: Array2::from_shape_fn((out_features, in_features), |(i, j)| {
                f32::from(data[i * in_features + j])
            }),
            row_scales: Array1::from_shape_fn(out_features, |i| scales[i / rows_per_group]),
            bias: l.bias().cloned(),
        }
    }

    pub fn dequantize(&self) -> Array2<f32> {
        &self.levels * &self.row_scales.view().insert_axis(Axis(1))
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.levels.t());
        out *= &self.row_scales.view().insert_axis(Axis(0));
        if let Some(b) = &self.bias {
            out += &b.view().insert_axis(Axis(0));
        }
        out
    }
}

/// Linear layer of a fused block.
#[derive(Clone)]
pub enum FusedLinear {
    Dense(Linear),
    Quantized(QLinear),
}

impl FusedLinear {
    fn new(l: Linear, config: &InferenceConfig) -> Self {
        if config.quantize {
            FusedLinear::Quantized(QLinear::from_linear(&l, config.quantize_groups))
        } else {
            FusedLinear::Dense(l)
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            FusedLinear::Dense(l) => l.forward(x),
            FusedLinear::Quantized(q) => q.forward(x),
        }
    }
}

/// Transformer layer with fused projections.
#[derive(Clone)]
pub struct FusedTransformerLayer {
    input_layernorm: LayerNorm,
    query_key_value: FusedLinear,
    dense: FusedLinear,
    post_attention_layernorm: LayerNorm,
    dense_h_to_4h: FusedLinear,
    dense_4h_to_h: FusedLinear,
    num_heads: usize,
    head_dim: usize,
}

impl FusedTransformerLayer {
    fn forward(
        &self,
        x: &Array2<f32>,
        start: usize,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<Array2<f32>> {
        let qkv = self.query_key_value.forward(&self.input_layernorm.forward(x));
        let ctx = causal_attention(&qkv, 0..self.num_heads, self.head_dim, cache, start)?;
        let h = x + &self.dense.forward(&ctx);
        let up = self
            .dense_h_to_4h
            .forward(&self.post_attention_layernorm.forward(&h))
            .mapv(gelu);
        Ok(h + &self.dense_4h_to_h.forward(&up))
    }
}

/// Model with all transformer layers replaced by fused layers.
pub struct InferenceEngine {
    config: GptConfig,
    word_embeddings: Array2<f32>,
    position_embeddings: Array2<f32>,
    layers: Vec<FusedTransformerLayer>,
    final_layernorm: LayerNorm,
    quantized: bool,
}

impl InferenceEngine {
    pub fn is_quantized(&self) -> bool {
        self.quantized
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Build the fused engine from a partitioned model.
pub fn init_inference(model: GptPipeline, config: &InferenceConfig) -> Result<InferenceEngine> {
    if config.mp_size != model.tensor_parallel_size() {
        return Err(GenerateError::InvalidArgument(format!(
            "inference mp_size {} does not match tensor model parallel size {}",
            config.mp_size,
            model.tensor_parallel_size()
        )));
    }
    let stages = model.stages();
    let (first, last) = match (stages.first(), stages.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(GenerateError::InvalidArgument("empty pipeline".to_string())),
    };
    let missing = || GenerateError::InvalidArgument("pipeline is missing embeddings".to_string());

    let word_embeddings = first.word_embeddings().ok_or_else(missing)?.gather()?;
    let position_embeddings = first.position_embeddings().ok_or_else(missing)?.clone();
    let no_head = || GenerateError::InvalidArgument("pipeline has no final layernorm".to_string());
    let final_layernorm = last.final_layernorm().ok_or_else(no_head)?.clone();

    let gpt = model.config().clone();
    let mut layers = Vec::with_capacity(gpt.num_layers);
    for stage in stages {
        for layer in stage.layers() {
            let g = layer.gathered()?;
            layers.push(FusedTransformerLayer {
                input_layernorm: g.input_layernorm,
                query_key_value: FusedLinear::new(g.query_key_value, config),
                dense: FusedLinear::new(g.dense, config),
                post_attention_layernorm: g.post_attention_layernorm,
                dense_h_to_4h: FusedLinear::new(g.dense_h_to_4h, config),
                dense_4h_to_h: FusedLinear::new(g.dense_4h_to_h, config),
                num_heads: gpt.num_attention_heads,
                head_dim: gpt.head_dim(),
            });
        }
    }
    tracing::info!(
        layers = layers.len(),
        mp_size = config.mp_size,
        quantize = config.quantize,
        groups = config.quantize_groups,
        "replaced transformer layers with fused inference layers"
    );

    Ok(InferenceEngine {
        config: gpt,
        word_embeddings,
        position_embeddings,
        layers,
        final_layernorm,
        quantized: config.quantize,
    })
}

impl LanguageModel for InferenceEngine {
    fn config(&self) -> &GptConfig {
        &self.config
    }

    fn forward(&self, tokens: &[usize], mut cache: Option<&mut KvCache>) -> Result<Array2<f32>> {
        let start = start_position(&self.config, tokens.len(), cache.as_deref())?;
        let vocab = self.word_embeddings.nrows();

        let mut h = Array2::<f32>::zeros((tokens.len(), self.config.hidden_size));
        for (i, &tok) in tokens.iter().enumerate() {
            if tok >= vocab {
                return Err(GenerateError::InvalidArgument(format!(
                    "token id {tok} outside padded vocabulary {vocab}"
                )));
            }
            h.row_mut(i).assign(&self.word_embeddings.row(tok));
        }
        h += &self.position_embeddings.slice(s![start..start + tokens.len(), ..]);

        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| c.layer_mut(i));
            h = layer.forward(&h, start, layer_cache)?;
        }
        let h = self.final_layernorm.forward(&h);
        Ok(h.dot(&self.word_embeddings.t()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_quantize_groups_scale_independently() {
        let t = array![[1.0, -0.5], [100.0, 25.0]];
        let (data, scales) = quantize_tensor(&t, 2);
        assert_eq!(scales.len(), 2);
        assert_eq!(&data[..2], &[127, -64]);
        assert_eq!(&data[2..], &[127, 32]);

        let (_, scales) = quantize_tensor(&t, 1);
        assert_eq!(scales.len(), 1);
    }

    #[test]
    fn test_qlinear_close_to_linear() {
        let l = Linear::from_parts(
            array![[0.1, -0.2, 0.3], [0.05, 0.0, -0.07]],
            Some(array![0.01, -0.01]),
        );
        let q = QLinear::from_linear(&l, 2);
        let x = array![[1.0, 2.0, 3.0]];
        let diff = (&l.forward(&x) - &q.forward(&x)).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-2));
    }

    #[test]
    fn test_qlinear_forward_uses_group_scales() {
        let l = Linear::from_parts(array![[1.0, -0.5], [100.0, 25.0]], None);
        let q = QLinear::from_linear(&l, 2);
        let levels = array![[127.0, -64.0], [127.0, 32.0]];
        assert_eq!(q.levels, levels);

        let x = array![[2.0, 1.0], [0.0, -1.0]];
        let expected = x.dot(&q.dequantize().t());
        let diff = (&expected - &q.forward(&x)).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-4));
        assert!((q.dequantize()[[1, 0]] - 100.0).abs() < 1e-4);
    }
}
