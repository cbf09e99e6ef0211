/// Neural network layer primitives
///
/// This module contains the building blocks of encoder/decoder models:
/// - Dense projections (with optional weight reuse)
/// - Layer normalization
/// - Layer wrapper (normalization, dropout, residual connection)
/// - Activations (GELU and friends) and dropout

pub mod activations;
pub mod dense;
pub mod dropout;
pub mod normalization;
pub mod v1;
pub mod wrapper;

pub use activations::{gelu, Activation};
pub use dense::Dense;
pub use dropout::dropout;
pub use normalization::LayerNorm;
pub use wrapper::{ConfigurableLayer, LayerOutput, LayerWrapper, SubLayer};
