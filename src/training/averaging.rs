/// Checkpoint averaging
///
/// Averages the model tensors of the most recent checkpoints of a directory
/// into a new checkpoint. Checkpoints are read one at a time, so memory use is
/// bounded by one snapshot plus the accumulators.
use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};

use super::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::AveragingConfig;
use crate::utils::count_parameters;
use crate::{NmtError, Result};

/// Running mean of one tensor
struct Accumulator {
    sum: Tensor,
    dtype: DType,
}

impl Accumulator {
    /// f64 tensors accumulate in f64, every other float type in f32
    fn accumulation_dtype(dtype: DType) -> DType {
        match dtype {
            DType::F64 => DType::F64,
            _ => DType::F32,
        }
    }

    fn new(value: &Tensor, scale: f64) -> candle_core::Result<Self> {
        let dtype = value.dtype();
        let sum = value.to_dtype(Self::accumulation_dtype(dtype))?.affine(scale, 0.0)?;
        Ok(Self { sum, dtype })
    }

    fn add(&mut self, value: &Tensor, scale: f64) -> candle_core::Result<()> {
        let value = value.to_dtype(self.sum.dtype())?.affine(scale, 0.0)?;
        self.sum = (&self.sum + value)?;
        Ok(())
    }

    fn finish(self) -> candle_core::Result<Tensor> {
        self.sum.to_dtype(self.dtype)
    }
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

/// Average the model tensors of the last `max_count` checkpoints of `model_dir`
///
/// Tensors selected by `model_key` are averaged. Every other tensor (optimizer
/// slots, counters) is copied from the most recent checkpoint, so the output
/// holds exactly the same tensor names as the latest input. The averaged
/// checkpoint is written to `output_dir` with the step of the latest input.
///
/// # Returns
/// Path of the averaged checkpoint
pub fn average_checkpoints(config: &AveragingConfig) -> Result<PathBuf> {
    config.validate()?;

    let source = CheckpointManager::new(&config.model_dir, None);
    let mut checkpoints = source.checkpoints()?;
    if checkpoints.is_empty() {
        return Err(NmtError::Checkpoint(format!(
            "No checkpoints found in {}",
            config.model_dir.display()
        )));
    }
    if checkpoints.len() > config.max_count {
        checkpoints.drain(..checkpoints.len() - config.max_count);
    }

    let num_checkpoints = checkpoints.len();
    let scale = 1.0 / num_checkpoints as f64;
    let averaged_steps: Vec<usize> = checkpoints.iter().map(|(step, _)| *step).collect();
    let last_step = averaged_steps[num_checkpoints - 1];

    log::info!("Averaging {} checkpoints...", num_checkpoints);

    let device = Device::Cpu;
    let mut accumulators: HashMap<String, Accumulator> = HashMap::new();
    let mut copied: HashMap<String, Tensor> = HashMap::new();
    let mut metadata = None;

    // Newest first: it provides the tensors that are not averaged
    for (i, (step, path)) in checkpoints.iter().rev().enumerate() {
        log::info!("Reading checkpoint {}...", path.display());
        let checkpoint = Checkpoint::load(path, &device)?;

        if i == 0 {
            for (name, tensor) in checkpoint.tensors {
                if config.is_model_tensor(&name) && is_float(tensor.dtype()) {
                    accumulators.insert(name, Accumulator::new(&tensor, scale)?);
                } else {
                    copied.insert(name, tensor);
                }
            }
            metadata = Some(checkpoint.metadata);
            continue;
        }

        for (name, accumulator) in accumulators.iter_mut() {
            let value = checkpoint.tensors.get(name).ok_or_else(|| {
                NmtError::Checkpoint(format!(
                    "tensor {:?} is missing from checkpoint at step {}",
                    name, step
                ))
            })?;
            if value.dims() != accumulator.sum.dims() {
                return Err(NmtError::Checkpoint(format!(
                    "tensor {:?} has shape {:?} at step {} but {:?} at step {}",
                    name,
                    value.dims(),
                    step,
                    accumulator.sum.dims(),
                    last_step
                )));
            }
            accumulator.add(value, scale)?;
        }
    }

    let num_parameters: usize = accumulators.values().map(|a| count_parameters(&a.sum)).sum();
    log::info!(
        "Averaged {} tensors ({} parameters), copied {} tensors from step {}",
        accumulators.len(),
        num_parameters,
        copied.len(),
        last_step
    );

    let mut tensors = copied;
    for (name, accumulator) in accumulators {
        tensors.insert(name, accumulator.finish()?);
    }

    let mut metadata = metadata.unwrap_or_default();
    metadata.step = last_step;
    metadata.averaged_steps = averaged_steps;

    let output = CheckpointManager::new(&config.output_dir, None);
    let path = output.save(&Checkpoint::new(tensors, metadata), last_step)?;
    log::info!("Saved averaged checkpoint to {}", path.display());

    Ok(path)
}
