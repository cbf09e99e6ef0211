/// Activation functions
use candle_core::{Result, Tensor};

/// Gaussian Error Linear Unit, tanh approximation
///
/// `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`
/// See <https://arxiv.org/abs/1606.08415>.
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    let cube = x.sqr()?.mul(x)?;
    let inner = (x + cube.affine(0.044715, 0.0)?)?;
    let scaled = inner.affine((2.0 / std::f64::consts::PI).sqrt(), 0.0)?;
    let gate = scaled.tanh()?.affine(0.5, 0.5)?;
    x.mul(&gate)
}

/// Activation applied at the end of a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Identity
    #[default]
    Linear,
    Relu,
    Gelu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Linear => Ok(x.clone()),
            Activation::Relu => x.relu(),
            Activation::Gelu => gelu(x),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_gelu_reference_values() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-3.0f32, -1.0, 0.0, 1.0, 3.0], &device)?;

        let y = gelu(&x)?.to_vec1::<f32>()?;

        // Reference values of the tanh approximation
        let expected = [-0.003637, -0.158808, 0.0, 0.841192, 2.996363];
        for (got, want) in y.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "expected {}, got {}", want, got);
        }

        Ok(())
    }

    #[test]
    fn test_gelu_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 16), &device)?;

        assert_eq!(gelu(&x)?.dims(), x.dims());

        Ok(())
    }

    #[test]
    fn test_activation_apply() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-2.0f32, 0.0, 2.0], &device)?;

        assert_eq!(Activation::Linear.apply(&x)?.to_vec1::<f32>()?, vec![-2.0, 0.0, 2.0]);
        assert_eq!(Activation::Relu.apply(&x)?.to_vec1::<f32>()?, vec![0.0, 0.0, 2.0]);

        let sig = Activation::Sigmoid.apply(&x)?.to_vec1::<f32>()?;
        assert!((sig[1] - 0.5).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_activation_serde_names() {
        let json = serde_json::to_string(&Activation::Gelu).unwrap();
        assert_eq!(json, "\"gelu\"");

        let parsed: Activation = serde_json::from_str("\"tanh\"").unwrap();
        assert_eq!(parsed, Activation::Tanh);
    }
}
