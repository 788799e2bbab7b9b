//! Key/value cache for incremental decoding.
//!
//! Each layer keeps, for every attention head, the keys and values of all
//! positions processed so far. Decoding a new token then only computes its
//! own query/key/value and attends over the cached rows.

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{GenerateError, Result};

/// Cached keys and values of one transformer layer.
#[derive(Clone, Debug)]
pub struct LayerKvCache {
    /// Per head: [seq, head_dim]
    keys: Vec<Array2<f32>>,
    /// Per head: [seq, head_dim]
    values: Vec<Array2<f32>>,
}

impl LayerKvCache {
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            keys: (0..num_heads).map(|_| Array2::zeros((0, head_dim))).collect(),
            values: (0..num_heads).map(|_| Array2::zeros((0, head_dim))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.first().map(|k| k.nrows()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append new rows for `head` and return the full key and value history.
    pub fn extend(
        &mut self,
        head: usize,
        keys: ArrayView2<'_, f32>,
        values: ArrayView2<'_, f32>,
    ) -> Result<(ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        self.keys[head].append(Axis(0), keys)?;
        self.values[head].append(Axis(0), values)?;
        Ok((self.keys[head].view(), self.values[head].view()))
    }

    fn clear(&mut self) {
        for k in self.keys.iter_mut().chain(self.values.iter_mut()) {
            *k = Array2::zeros((0, k.ncols()));
        }
    }
}

/// Key/value cache of every layer of a model.
#[derive(Clone, Debug)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
    capacity: usize,
}

impl KvCache {
    pub fn new(num_layers: usize, num_heads: usize, head_dim: usize, capacity: usize) -> Self {
        Self {
            layers: (0..num_layers)
                .map(|_| LayerKvCache::new(num_heads, head_dim))
                .collect(),
            capacity,
        }
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.layers.first().map(LayerKvCache::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Fail if `incoming` more positions would not fit.
    pub fn reserve(&self, incoming: usize) -> Result<()> {
        if self.len() + incoming > self.capacity {
            return Err(GenerateError::CacheOverflow {
                len: self.len(),
                incoming,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn layer_mut(&mut self, layer: usize) -> &mut LayerKvCache {
        &mut self.layers[layer]
    }

    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }
}
