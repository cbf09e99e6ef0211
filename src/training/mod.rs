/// Training utilities: checkpoint storage and averaging
pub mod averaging;
pub mod checkpoint;

pub use averaging::average_checkpoints;
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
