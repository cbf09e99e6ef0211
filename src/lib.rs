//! Sequence-to-sequence layer building blocks
//!
//! Reusable layers for encoder/decoder models built on candle, plus the
//! checkpoint tooling used around training.
//!
//! # Layers
//!
//! - **Dense**: linear projection that can reuse (and transpose) an existing
//!   weight matrix, e.g. to tie the output projection to the embeddings
//! - **LayerNorm**: feature normalization with learned scale and shift
//! - **LayerWrapper**: pre/post normalization, dropout and residual connection
//!   around any sub-layer
//!
//! # Checkpoints
//!
//! Checkpoints are safetensors files managed by [`training::CheckpointManager`].
//! [`training::average_checkpoints`] averages the model tensors of the most
//! recent checkpoints into a new one.
//!
//! # Example
//!
//! ```ignore
//! use nmt_layers::layers::{Dense, LayerWrapper};
//! use nmt_layers::config::{DenseConfig, WrapperConfig};
//!
//! let ffn = Dense::new(DenseConfig::new(512, 512), vb.pp("ffn"))?;
//! let block = LayerWrapper::new(ffn, WrapperConfig::pre_norm(0.1), 512, 512, vb.pp("block"))?;
//! let output = block.forward(&input, true)?;
//! ```

pub mod config;
pub mod layers;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::AveragingConfig;
pub use layers::{Dense, LayerNorm, LayerWrapper};
pub use training::{average_checkpoints, Checkpoint, CheckpointManager};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum NmtError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Layer error: {0}")]
    Layer(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NmtError>;
