//! Tensor and pipeline parallel layout.
//!
//! Weights are partitioned exactly as a multi-rank run would partition them,
//! but every rank's partition lives in this process and the collectives
//! (all-reduce, all-gather) are plain sums and concatenations.

use std::ops::Range;

use ndarray::{concatenate, s, Array1, Array2, ArrayD, Axis};

use crate::error::{GenerateError, Result};
use crate::model::{Linear, StateDict};

/// How the model is split across ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelConfig {
    pub tensor: usize,
    pub pipeline: usize,
    /// Layers per virtual pipeline stage, when an interleaved schedule is used.
    pub virtual_stage_layers: Option<usize>,
}

impl ParallelConfig {
    pub fn new(tensor: usize, pipeline: usize) -> Self {
        Self { tensor, pipeline, virtual_stage_layers: None }
    }

    pub fn world_size(&self) -> usize {
        self.tensor * self.pipeline
    }

    /// Number of model chunks each pipeline rank holds.
    pub fn virtual_chunks(&self, num_layers: usize) -> usize {
        match self.virtual_stage_layers {
            Some(per_stage) if per_stage > 0 => {
                (num_layers / self.pipeline / per_stage).max(1)
            }
            _ => 1,
        }
    }

    /// Global layer indices owned by a pipeline stage.
    pub fn stage_layers(&self, stage: usize, num_layers: usize) -> Range<usize> {
        let per_stage = num_layers / self.pipeline;
        stage * per_stage..(stage + 1) * per_stage
    }

    pub fn is_first_stage(&self, stage: usize) -> bool {
        stage == 0
    }

    pub fn is_last_stage(&self, stage: usize) -> bool {
        stage + 1 == self.pipeline
    }
}

/// Split `total` into `parts` equal contiguous ranges.
pub fn partition(total: usize, parts: usize, index: usize) -> Range<usize> {
    let size = total / parts;
    index * size..(index + 1) * size
}

/// Linear layer whose output features are split across tensor ranks.
#[derive(Clone)]
pub struct ColumnParallelLinear {
    shards: Vec<Linear>,
}

impl ColumnParallelLinear {
    /// Split a full ("master") layer row-wise into `tp` shards.
    pub fn split(full: &Linear, tp: usize) -> Self {
        let out = full.weight().nrows();
        let shards = (0..tp)
            .map(|rank| {
                let rows = partition(out, tp, rank);
                Linear::from_parts(
                    full.weight().slice(s![rows.clone(), ..]).to_owned(),
                    full.bias().map(|b| b.slice(s![rows]).to_owned()),
                )
            })
            .collect();
        Self { shards }
    }

    pub fn tp(&self) -> usize {
        self.shards.len()
    }

    /// Output partition of one rank (not gathered).
    pub fn forward_rank(&self, rank: usize, x: &Array2<f32>) -> Array2<f32> {
        self.shards[rank].forward(x)
    }

    /// Reassemble the full layer.
    pub fn gather(&self) -> Result<Linear> {
        let weights: Vec<_> = self.shards.iter().map(|l| l.weight().view()).collect();
        let weight = concatenate(Axis(0), &weights)?;
        let bias = match self.shards[0].bias() {
            Some(_) => {
                let biases: Vec<_> = self
                    .shards
                    .iter()
                    .filter_map(|l| l.bias().map(|b| b.view()))
                    .collect();
                Some(concatenate(Axis(0), &biases)?)
            }
            None => None,
        };
        Ok(Linear::from_parts(weight, bias))
    }

    pub fn save(&self, rank: usize, prefix: &str, out: &mut StateDict) {
        self.shards[rank].save(prefix, out);
    }

    pub fn load(&mut self, rank: usize, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.shards[rank].load(prefix, tensors)
    }
}

/// Linear layer whose input features are split across tensor ranks. The
/// partial products are summed and the bias is added once.
#[derive(Clone)]
pub struct RowParallelLinear {
    /// Per rank: [out, in / tp]
    shards: Vec<Array2<f32>>,
    bias: Option<Array1<f32>>,
}

impl RowParallelLinear {
    pub fn split(full: &Linear, tp: usize) -> Self {
        let inp = full.weight().ncols();
        let shards = (0..tp)
            .map(|rank| full.weight().slice(s![.., partition(inp, tp, rank)]).to_owned())
            .collect();
        Self { shards, bias: full.bias().cloned() }
    }

    /// `inputs[rank]` is that rank's input partition.
    pub fn forward_partitions(&self, inputs: &[Array2<f32>]) -> Array2<f32> {
        let mut out = inputs[0].dot(&self.shards[0].t());
        for (x, w) in inputs.iter().zip(&self.shards).skip(1) {
            out += &x.dot(&w.t());
        }
        if let Some(b) = &self.bias {
            out += &b.view().insert_axis(Axis(0));
        }
        out
    }

    pub fn gather(&self) -> Result<Linear> {
        let weights: Vec<_> = self.shards.iter().map(|w| w.view()).collect();
        Ok(Linear::from_parts(concatenate(Axis(1), &weights)?, self.bias.clone()))
    }

    pub fn save(&self, rank: usize, prefix: &str, out: &mut StateDict) {
        out.insert(format!("{prefix}.weight"), self.shards[rank].clone().into_dyn());
        if let Some(b) = &self.bias {
            out.insert(format!("{prefix}.bias"), b.clone().into_dyn());
        }
    }

    pub fn load(&mut self, rank: usize, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.shards[rank] = take2(tensors, &format!("{prefix}.weight"), self.shards[rank].dim())?;
        if let Some(b) = &mut self.bias {
            *b = take1(tensors, &format!("{prefix}.bias"), b.len())?;
        }
        Ok(())
    }
}

/// Word embedding table split by vocabulary rows across tensor ranks.
#[derive(Clone)]
pub struct VocabParallelEmbedding {
    /// Per rank: [vocab / tp, hidden]
    shards: Vec<Array2<f32>>,
}

impl VocabParallelEmbedding {
    pub fn split(full: &Array2<f32>, tp: usize) -> Self {
        let vocab = full.nrows();
        let shards = (0..tp)
            .map(|rank| full.slice(s![partition(vocab, tp, rank), ..]).to_owned())
            .collect();
        Self { shards }
    }

    fn rows_per_rank(&self) -> usize {
        self.shards[0].nrows()
    }

    pub fn vocab_size(&self) -> usize {
        self.rows_per_rank() * self.shards.len()
    }

    /// Every rank masks ids outside its range; the all-reduce picks the
    /// owner's row.
    pub fn forward(&self, tokens: &[usize]) -> Result<Array2<f32>> {
        let per_rank = self.rows_per_rank();
        let hidden = self.shards[0].ncols();
        let mut out = Array2::<f32>::zeros((tokens.len(), hidden));
        for (i, &tok) in tokens.iter().enumerate() {
            if tok >= self.vocab_size() {
                return Err(GenerateError::InvalidArgument(format!(
                    "token id {tok} outside padded vocabulary {}",
                    self.vocab_size()
                )));
            }
            for (rank, shard) in self.shards.iter().enumerate() {
                let owned = partition(self.vocab_size(), self.shards.len(), rank);
                if owned.contains(&tok) {
                    out.row_mut(i).assign(&shard.row(tok - rank * per_rank));
                }
            }
        }
        Ok(out)
    }

    /// Logits over the full padded vocabulary, gathered from every rank.
    pub fn lm_logits(&self, hidden: &Array2<f32>) -> Result<Array2<f32>> {
        let parts: Vec<_> = self.shards.iter().map(|w| hidden.dot(&w.t())).collect();
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        Ok(concatenate(Axis(1), &views)?)
    }

    pub fn gather(&self) -> Result<Array2<f32>> {
        let views: Vec<_> = self.shards.iter().map(|w| w.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    pub fn save(&self, rank: usize, prefix: &str, out: &mut StateDict) {
        out.insert(format!("{prefix}.weight"), self.shards[rank].clone().into_dyn());
    }

    pub fn load(&mut self, rank: usize, prefix: &str, tensors: &StateDict) -> Result<()> {
        self.shards[rank] = take2(tensors, &format!("{prefix}.weight"), self.shards[rank].dim())?;
        Ok(())
    }
}

fn lookup<'a>(tensors: &'a StateDict, name: &str) -> Result<&'a ArrayD<f32>> {
    tensors
        .get(name)
        .ok_or_else(|| GenerateError::MissingWeight(name.to_string()))
}

/// Fetch a 2-D tensor and check its shape.
pub fn take2(tensors: &StateDict, name: &str, shape: (usize, usize)) -> Result<Array2<f32>> {
    let t = lookup(tensors, name)?;
    if t.shape() != [shape.0, shape.1] {
        return Err(GenerateError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![shape.0, shape.1],
            got: t.shape().to_vec(),
        });
    }
    Ok(t.clone().into_dimensionality()?)
}

/// Fetch a 1-D tensor and check its length.
pub fn take1(tensors: &StateDict, name: &str, len: usize) -> Result<Array1<f32>> {
    let t = lookup(tensors, name)?;
    if t.shape() != [len] {
        return Err(GenerateError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![len],
            got: t.shape().to_vec(),
        });
    }
    Ok(t.clone().into_dimensionality()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_stage_layers() {
        let cfg = ParallelConfig::new(1, 2);
        assert_eq!(cfg.world_size(), 2);
        assert_eq!(cfg.stage_layers(0, 4), 0..2);
        assert_eq!(cfg.stage_layers(1, 4), 2..4);
        assert!(cfg.is_first_stage(0) && !cfg.is_last_stage(0));
        assert!(cfg.is_last_stage(1));
        assert_eq!(cfg.virtual_chunks(4), 1);
    }

    #[test]
    fn test_column_then_row_matches_full() {
        let up = Linear::from_parts(
            array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, -1.0]],
            Some(array![0.5, 0.0, -0.5, 1.0]),
        );
        let down = Linear::from_parts(array![[1.0, 2.0, 3.0, 4.0]], Some(array![0.25]));
        let x = array![[1.0, 2.0], [-1.0, 0.5]];
        let expected = down.forward(&up.forward(&x));

        let col = ColumnParallelLinear::split(&up, 2);
        let row = RowParallelLinear::split(&down, 2);
        let partials: Vec<_> = (0..2).map(|r| col.forward_rank(r, &x)).collect();
        assert_eq!(row.forward_partitions(&partials), expected);

        assert_eq!(col.gather().unwrap().weight(), up.weight());
        assert_eq!(row.gather().unwrap().weight(), down.weight());
    }

    #[test]
    fn test_vocab_parallel_embedding() {
        let table = array![[0.0, 0.1], [1.0, 1.1], [2.0, 2.1], [3.0, 3.1]];
        let emb = VocabParallelEmbedding::split(&table, 2);
        let rows = emb.forward(&[3, 0]).unwrap();
        assert_eq!(rows, array![[3.0, 3.1], [0.0, 0.1]]);
        assert!(emb.forward(&[4]).is_err());

        let h = array![[1.0, 0.0]];
        assert_eq!(emb.lm_logits(&h).unwrap(), array![[0.0, 1.0, 2.0, 3.0]]);
        assert_eq!(emb.gather().unwrap(), table);
    }
}
