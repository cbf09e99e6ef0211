/// Layer normalization
use std::collections::HashMap;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use super::v1::assign_v1_weights;
use crate::config::LayerNormConfig;

/// Precision used for the reductions: f64 stays f64, everything else runs in f32
fn compute_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

/// Normalize the last dimension in the compute dtype, without casting back
fn normalize(x: &Tensor, epsilon: f64) -> Result<Tensor> {
    let x = x.to_dtype(compute_dtype(x.dtype()))?;

    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;

    // (x - mean) * rsqrt(variance + epsilon)
    centered.broadcast_div(&(variance + epsilon)?.sqrt()?)
}

/// Layer normalization function without learned parameters
///
/// Normalizes the last dimension to zero mean and unit variance.
/// Half precision inputs are computed in f32, then cast back to original dtype.
///
/// # Arguments
/// * `x` - Input tensor
/// * `epsilon` - Added to the variance for numerical stability
///
/// # Returns
/// Normalized tensor with same shape and dtype as input
pub fn layer_norm(x: &Tensor, epsilon: f64) -> Result<Tensor> {
    normalize(x, epsilon)?.to_dtype(x.dtype())
}

/// Layer normalization with learned shift (`beta`) and scale (`gamma`)
pub struct LayerNorm {
    beta: Tensor,
    gamma: Tensor,
    epsilon: f64,
}

impl LayerNorm {
    pub fn new(depth: usize, vb: VarBuilder) -> crate::Result<Self> {
        Self::from_config(LayerNormConfig::new(depth), vb)
    }

    pub fn from_config(config: LayerNormConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let beta = vb.get_with_hints(config.depth, "beta", Init::Const(0.0))?;
        let gamma = vb.get_with_hints(config.depth, "gamma", Init::Const(1.0))?;

        Ok(Self {
            beta,
            gamma,
            epsilon: config.epsilon,
        })
    }

    pub fn config(&self) -> LayerNormConfig {
        LayerNormConfig {
            depth: self.gamma.elem_count(),
            epsilon: self.epsilon,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Scale and shift are applied before casting back to the input dtype
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normalized = normalize(x, self.epsilon)?;
        let dtype = normalized.dtype();
        normalized
            .broadcast_mul(&self.gamma.to_dtype(dtype)?)?
            .broadcast_add(&self.beta.to_dtype(dtype)?)?
            .to_dtype(x.dtype())
    }

    /// Pair parameters with the `beta` and `gamma` entries of a legacy checkpoint
    pub fn map_v1_weights<'a>(
        &'a self,
        weights: &HashMap<String, Tensor>,
    ) -> crate::Result<Vec<(&'a Tensor, Tensor)>> {
        let mut mapping = Vec::with_capacity(2);
        for (name, param) in [("beta", &self.beta), ("gamma", &self.gamma)] {
            let value = weights.get(name).ok_or_else(|| {
                crate::NmtError::Layer(format!("missing v1 weight {:?} for LayerNorm", name))
            })?;
            mapping.push((param, value.clone()));
        }
        Ok(mapping)
    }

    /// Assign parameters from a legacy checkpoint
    pub fn load_v1_weights(&self, weights: &HashMap<String, Tensor>) -> crate::Result<()> {
        assign_v1_weights(self.map_v1_weights(weights)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_statistics() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0]], &device)?;
        let normalized = layer_norm(&x, 1e-6)?;

        let mean = normalized.mean_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        let var = normalized.sqr()?.mean_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for (m, v) in mean.iter().zip(var.iter()) {
            assert!(m.abs() < 1e-5, "mean should be 0, got {}", m);
            assert!((v - 1.0).abs() < 1e-3, "variance should be 1, got {}", v);
        }

        Ok(())
    }

    #[test]
    fn test_layer_norm_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &device)?.to_dtype(DType::BF16)?;
        let normalized = layer_norm(&x, 1e-6)?;

        assert_eq!(x.dims(), normalized.dims());
        assert_eq!(normalized.dtype(), DType::BF16);

        Ok(())
    }

    #[test]
    fn test_layer_norm_f64_stays_f64() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::new(&[[1e8f64, 1e8 + 1.0, 1e8 + 2.0, 1e8 + 3.0]], &device)?;
        let normalized = layer_norm(&x, 1e-12)?;
        assert_eq!(normalized.dtype(), DType::F64);

        // f32 cannot even represent these inputs apart from each other
        let values = normalized.flatten_all()?.to_vec1::<f64>()?;
        let expected = [-1.341_640_786, -0.447_213_595, 0.447_213_595, 1.341_640_786];
        for (got, want) in values.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "expected {}, got {}", want, got);
        }

        Ok(())
    }

    #[test]
    fn test_scale_and_shift_before_cast() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(8, vb)?;

        let mut weights = HashMap::new();
        weights.insert("beta".to_string(), Tensor::full(0.3f32, 8, &device)?);
        weights.insert("gamma".to_string(), Tensor::full(1.7f32, 8, &device)?);
        norm.load_v1_weights(&weights)?;

        let x = Tensor::randn(0f32, 1.0, (4, 8), &device)?.to_dtype(DType::BF16)?;
        let out = norm.forward(&x)?;
        assert_eq!(out.dtype(), DType::BF16);

        // Single rounding to bf16 at the end
        let reference = layer_norm(&x.to_dtype(DType::F32)?, 1e-6)?
            .affine(1.7, 0.3)?
            .to_dtype(DType::BF16)?;
        let diff = (out.to_dtype(DType::F32)? - reference.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 5e-2, "difference {}", diff);

        Ok(())
    }

    #[test]
    fn test_layer_norm_initial_parameters() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let norm = LayerNorm::new(4, vb)?;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device)?;

        // beta = 0 and gamma = 1 at initialization
        let out = norm.forward(&x)?;
        let reference = layer_norm(&x, 1e-6)?;
        let diff = (out - reference)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["beta".to_string(), "gamma".to_string()]);

        Ok(())
    }

    #[test]
    fn test_load_v1_weights() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(3, vb)?;

        let mut weights = HashMap::new();
        weights.insert("beta".to_string(), Tensor::full(1.0f32, 3, &device)?);
        weights.insert("gamma".to_string(), Tensor::full(2.0f32, 3, &device)?);
        norm.load_v1_weights(&weights)?;

        // Normalized values scaled by 2 and shifted by 1
        let x = Tensor::new(&[[-1.0f32, 0.0, 1.0]], &device)?;
        let out = norm.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = 2.0 * 1.224_744_9;
        assert!((out[0] - (1.0 - expected)).abs() < 1e-3);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!((out[2] - (1.0 + expected)).abs() < 1e-3);

        Ok(())
    }

    #[test]
    fn test_map_v1_weights_missing_entry() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(3, vb)?;

        let mut weights = HashMap::new();
        weights.insert("beta".to_string(), Tensor::zeros(3, DType::F32, &device)?);
        assert!(norm.map_v1_weights(&weights).is_err());

        Ok(())
    }

    #[test]
    fn test_config_round_trip() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = LayerNormConfig { depth: 32, epsilon: 1e-5 };
        let norm = LayerNorm::from_config(config.clone(), vb)?;
        assert_eq!(norm.config(), config);

        Ok(())
    }
}
