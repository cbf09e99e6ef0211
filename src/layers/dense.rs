/// Dense projection that can reuse an existing weight matrix
use std::collections::HashMap;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::v1::assign_v1_weights;
use super::wrapper::{LayerOutput, SubLayer};
use crate::config::DenseConfig;
use crate::utils::shape_with_last_dim;
use crate::NmtError;

/// Fully connected layer: `activation(x @ kernel + bias)`
///
/// The kernel is either owned (`[in_features, units]`, Glorot uniform
/// initialization) or borrowed from another layer, in which case it can be
/// used transposed. Tying the output projection of a decoder to its embedding
/// matrix is the typical use:
///
/// ```ignore
/// // embeddings: [vocab_size, depth]
/// let proj = Dense::with_weight(embeddings.clone(), true, DenseConfig::new(depth, vocab_size), vb)?;
/// ```
pub struct Dense {
    kernel: Tensor,
    bias: Option<Tensor>,
    transpose: bool,
    shared: bool,
    config: DenseConfig,
}

impl Dense {
    /// Create a projection owning its kernel
    pub fn new(config: DenseConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let limit = (6.0 / (config.in_features + config.units) as f64).sqrt();
        let kernel = vb.get_with_hints(
            (config.in_features, config.units),
            "kernel",
            Init::Uniform { lo: -limit, up: limit },
        )?;
        let bias = Self::make_bias(&config, &vb)?;

        Ok(Self {
            kernel,
            bias,
            transpose: false,
            shared: false,
            config,
        })
    }

    /// Create a projection reusing `weight` as kernel
    ///
    /// # Arguments
    /// * `weight` - `[in_features, units]`, or `[units, in_features]` when `transpose` is set
    /// * `transpose` - Whether `weight` is transposed before the matmul
    /// * `config` - Projection configuration, `in_features` and `units` must agree with `weight`
    /// * `vb` - VarBuilder for the bias
    pub fn with_weight(
        weight: Tensor,
        transpose: bool,
        config: DenseConfig,
        vb: VarBuilder,
    ) -> crate::Result<Self> {
        config.validate()?;

        let (rows, cols) = weight.dims2().map_err(|_| {
            NmtError::Layer(format!(
                "shared weight must have rank 2, got shape {:?}",
                weight.dims()
            ))
        })?;
        let (in_features, units) = if transpose { (cols, rows) } else { (rows, cols) };
        if units != config.units || in_features != config.in_features {
            return Err(NmtError::Layer(format!(
                "shared weight of shape {:?} (transpose: {}) cannot project {} features to {} units",
                weight.dims(),
                transpose,
                config.in_features,
                config.units
            )));
        }

        let bias = Self::make_bias(&config, &vb)?;

        Ok(Self {
            kernel: weight,
            bias,
            transpose,
            shared: true,
            config,
        })
    }

    fn make_bias(config: &DenseConfig, vb: &VarBuilder) -> crate::Result<Option<Tensor>> {
        if !config.use_bias {
            return Ok(None);
        }
        Ok(Some(vb.get_with_hints(config.units, "bias", Init::Const(0.0))?))
    }

    /// Rebuild a projection from its configuration. The kernel is always owned.
    pub fn from_config(config: DenseConfig, vb: VarBuilder) -> crate::Result<Self> {
        Self::new(config, vb)
    }

    pub fn config(&self) -> DenseConfig {
        self.config.clone()
    }

    pub fn units(&self) -> usize {
        self.config.units
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Whether the kernel is borrowed from another layer
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shape = x.dims().to_vec();
        let rank = shape.len();
        if rank < 2 {
            candle_core::bail!("Dense expects inputs of rank >= 2, got shape {:?}", shape)
        }
        let depth = shape[rank - 1];
        if depth != self.config.in_features {
            candle_core::bail!(
                "Dense expects inputs of depth {}, got shape {:?}",
                self.config.in_features,
                shape
            )
        }

        // Flatten leading dimensions
        let inputs = if rank > 2 {
            x.reshape((x.elem_count() / depth, depth))?
        } else {
            x.clone()
        };

        // Cast parameters to input dtype
        let dtype = inputs.dtype();
        let kernel = if self.kernel.dtype() != dtype {
            self.kernel.to_dtype(dtype)?
        } else {
            self.kernel.clone()
        };
        let kernel = if self.transpose { kernel.t()? } else { kernel };

        let mut outputs = inputs.matmul(&kernel)?;
        if let Some(ref b) = self.bias {
            outputs = outputs.broadcast_add(&b.to_dtype(dtype)?)?;
        }
        let outputs = self.config.activation.apply(&outputs)?;

        if rank > 2 {
            outputs.reshape(shape_with_last_dim(&shape, self.config.units))
        } else {
            Ok(outputs)
        }
    }

    /// Pair parameters with the `kernel` (and `bias`) entries of a legacy checkpoint
    pub fn map_v1_weights<'a>(
        &'a self,
        weights: &HashMap<String, Tensor>,
    ) -> crate::Result<Vec<(&'a Tensor, Tensor)>> {
        let lookup = |name: &str| {
            weights.get(name).cloned().ok_or_else(|| {
                NmtError::Layer(format!("missing v1 weight {:?} for Dense", name))
            })
        };

        let mut mapping = vec![(&self.kernel, lookup("kernel")?)];
        if let Some(ref bias) = self.bias {
            mapping.push((bias, lookup("bias")?));
        }
        Ok(mapping)
    }

    /// Assign parameters from a legacy checkpoint
    pub fn load_v1_weights(&self, weights: &HashMap<String, Tensor>) -> crate::Result<()> {
        assign_v1_weights(self.map_v1_weights(weights)?)
    }
}

impl SubLayer for Dense {
    fn forward_t(&self, x: &Tensor, _args: (), _training: bool) -> Result<LayerOutput> {
        Ok(LayerOutput::new(self.forward(x)?))
    }
}
