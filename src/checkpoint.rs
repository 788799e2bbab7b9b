//! Checkpoint save/load.
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! latest_checkpointed_iteration.txt     "release" or an iteration number
//! release/ or iter_0000100/
//!     mp_rank_00/model.safetensors      pipeline size 1
//!     mp_rank_01_002/model.safetensors  tensor rank 1, pipeline stage 2
//! ```
//!
//! Each file holds one rank's shard as f32 tensors. The safetensors
//! metadata carries the iteration and the model arguments the checkpoint
//! was written with.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::error::{GenerateError, Result};
use crate::model::{GptConfig, GptPipeline, LanguageModel, StateDict};
use crate::parallel::ParallelConfig;

pub const TRACKER_FILENAME: &str = "latest_checkpointed_iteration.txt";
const MODEL_FILENAME: &str = "model.safetensors";

/// Which checkpoint the tracker file points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tracker {
    Release,
    Iteration(u64),
}

impl Tracker {
    fn dir_name(&self) -> String {
        match self {
            Tracker::Release => "release".to_string(),
            Tracker::Iteration(it) => format!("iter_{it:07}"),
        }
    }

    fn iteration(&self) -> u64 {
        match self {
            Tracker::Release => 0,
            Tracker::Iteration(it) => *it,
        }
    }
}

/// Model arguments stored with every shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointArgs {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub padded_vocab_size: usize,
    pub tensor_model_parallel_size: usize,
    pub pipeline_model_parallel_size: usize,
}

impl CheckpointArgs {
    pub fn new(config: &GptConfig, parallel: &ParallelConfig) -> Self {
        Self {
            num_layers: config.num_layers,
            hidden_size: config.hidden_size,
            num_attention_heads: config.num_attention_heads,
            max_position_embeddings: config.max_position_embeddings,
            padded_vocab_size: config.padded_vocab_size,
            tensor_model_parallel_size: parallel.tensor,
            pipeline_model_parallel_size: parallel.pipeline,
        }
    }

    /// Fail on the first field that differs from the running configuration.
    pub fn check(&self, current: &CheckpointArgs) -> Result<()> {
        let fields = [
            ("num_layers", self.num_layers, current.num_layers),
            ("hidden_size", self.hidden_size, current.hidden_size),
            ("num_attention_heads", self.num_attention_heads, current.num_attention_heads),
            (
                "max_position_embeddings",
                self.max_position_embeddings,
                current.max_position_embeddings,
            ),
            ("padded_vocab_size", self.padded_vocab_size, current.padded_vocab_size),
            (
                "tensor_model_parallel_size",
                self.tensor_model_parallel_size,
                current.tensor_model_parallel_size,
            ),
            (
                "pipeline_model_parallel_size",
                self.pipeline_model_parallel_size,
                current.pipeline_model_parallel_size,
            ),
        ];
        for (name, checkpoint, current) in fields {
            if checkpoint != current {
                return Err(GenerateError::CheckpointMismatch { name, checkpoint, current });
            }
        }
        Ok(())
    }
}

/// Shard file of one (tensor rank, pipeline stage).
pub fn checkpoint_name(
    dir: &Path,
    tracker: Tracker,
    tp_rank: usize,
    pp_rank: usize,
    pipeline: usize,
) -> PathBuf {
    let rank_dir = if pipeline == 1 {
        format!("mp_rank_{tp_rank:02}")
    } else {
        format!("mp_rank_{tp_rank:02}_{pp_rank:03}")
    };
    dir.join(tracker.dir_name()).join(rank_dir).join(MODEL_FILENAME)
}

pub fn read_tracker(dir: &Path) -> Result<Tracker> {
    let path = dir.join(TRACKER_FILENAME);
    if !path.exists() {
        return Err(GenerateError::CheckpointNotFound(path.display().to_string()));
    }
    let text = fs::read_to_string(&path)?;
    let text = text.trim();
    if text == "release" {
        return Ok(Tracker::Release);
    }
    text.parse::<u64>()
        .map(Tracker::Iteration)
        .map_err(|_| GenerateError::InvalidTracker(format!("{}: {text:?}", path.display())))
}

/// Write every rank's shard of `model` and point the tracker at it.
pub fn save_checkpoint(dir: &Path, tracker: Tracker, model: &GptPipeline) -> Result<()> {
    let parallel = model.parallel_config();
    let args = CheckpointArgs::new(model.config(), &parallel);
    let mut metadata = HashMap::new();
    metadata.insert("iteration".to_string(), tracker.iteration().to_string());
    metadata.insert("args".to_string(), serde_json::to_string(&args)?);
    let metadata = Some(metadata);

    for (pp_rank, stage) in model.stages().iter().enumerate() {
        for tp_rank in 0..parallel.tensor {
            let path = checkpoint_name(dir, tracker, tp_rank, pp_rank, parallel.pipeline);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_state_dict(&path, &stage.state_dict(tp_rank), &metadata)?;
            tracing::debug!(path = %path.display(), "saved shard");
        }
    }

    let contents = match tracker {
        Tracker::Release => "release".to_string(),
        Tracker::Iteration(it) => it.to_string(),
    };
    fs::write(dir.join(TRACKER_FILENAME), contents)?;
    tracing::info!(
        "successfully saved checkpoint at iteration {} to {}",
        tracker.iteration(),
        dir.display()
    );
    Ok(())
}

fn write_state_dict(
    path: &Path,
    tensors: &StateDict,
    metadata: &Option<HashMap<String, String>>,
) -> Result<()> {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, t)| {
            let data = t.iter().copied().collect::<Vec<f32>>();
            (name.clone(), t.shape().to_vec(), bytemuck::cast_slice(&data).to_vec())
        })
        .collect();
    let views = bytes
        .iter()
        .map(|(name, shape, data)| {
            Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, metadata, path)?;
    Ok(())
}

fn read_state_dict(path: &Path) -> Result<(StateDict, Option<CheckpointArgs>)> {
    if !path.exists() {
        return Err(GenerateError::CheckpointNotFound(path.display().to_string()));
    }
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let (_, header) = SafeTensors::read_metadata(&mmap)?;
    let args = match header.metadata().as_ref().and_then(|m| m.get("args")) {
        Some(json) => Some(serde_json::from_str(json)?),
        None => None,
    };

    let tensors = SafeTensors::deserialize(&mmap)?;
    let mut out = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(GenerateError::InvalidArgument(format!(
                "tensor {name} has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let array = ndarray::ArrayD::from_shape_vec(view.shape().to_vec(), data)?;
        out.insert(name, array);
    }
    Ok((out, args))
}

/// Load the checkpoint the tracker points at into `model`. Returns the
/// iteration (0 for a release checkpoint).
pub fn load_checkpoint(dir: &Path, model: &mut GptPipeline) -> Result<u64> {
    let tracker = read_tracker(dir)?;
    let parallel = model.parallel_config();
    let current = CheckpointArgs::new(model.config(), &parallel);
    tracing::info!(
        "loading checkpoint from {} at iteration {}",
        dir.display(),
        tracker.iteration()
    );

    for (pp_rank, stage) in model.stages_mut().iter_mut().enumerate() {
        for tp_rank in 0..parallel.tensor {
            let path = checkpoint_name(dir, tracker, tp_rank, pp_rank, parallel.pipeline);
            let (tensors, stored) = read_state_dict(&path)?;
            match stored {
                Some(stored) => stored.check(&current)?,
                None => tracing::warn!(path = %path.display(), "shard carries no model arguments"),
            }
            stage.load_state_dict(tp_rank, &tensors)?;
        }
    }

    tracing::info!(
        "successfully loaded checkpoint from {} at iteration {}",
        dir.display(),
        tracker.iteration()
    );
    Ok(tracker.iteration())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_names() {
        let dir = Path::new("/ckpt");
        assert_eq!(
            checkpoint_name(dir, Tracker::Release, 0, 0, 1),
            PathBuf::from("/ckpt/release/mp_rank_00/model.safetensors")
        );
        assert_eq!(
            checkpoint_name(dir, Tracker::Iteration(100), 1, 2, 4),
            PathBuf::from("/ckpt/iter_0000100/mp_rank_01_002/model.safetensors")
        );
    }

    #[test]
    fn test_read_tracker() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_tracker(dir.path()),
            Err(GenerateError::CheckpointNotFound(_))
        ));

        fs::write(dir.path().join(TRACKER_FILENAME), "release\n").unwrap();
        assert_eq!(read_tracker(dir.path()).unwrap(), Tracker::Release);

        fs::write(dir.path().join(TRACKER_FILENAME), "2000").unwrap();
        assert_eq!(read_tracker(dir.path()).unwrap(), Tracker::Iteration(2000));

        fs::write(dir.path().join(TRACKER_FILENAME), "latest").unwrap();
        assert!(matches!(
            read_tracker(dir.path()),
            Err(GenerateError::InvalidTracker(_))
        ));
    }

    #[test]
    fn test_args_check_reports_field() {
        let config = GptConfig::default();
        let saved = CheckpointArgs::new(&config, &ParallelConfig::new(1, 1));
        let running = CheckpointArgs::new(&config, &ParallelConfig::new(2, 1));
        match saved.check(&running) {
            Err(GenerateError::CheckpointMismatch { name, checkpoint, current }) => {
                assert_eq!(name, "tensor_model_parallel_size");
                assert_eq!((checkpoint, current), (1, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
