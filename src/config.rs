/// Layer and tool configurations
///
/// Every layer can report its configuration and be rebuilt from it, which is
/// what allows a `LayerWrapper` to be serialized together with the layer it
/// wraps.
use std::path::{Path, PathBuf};

use crate::layers::activations::Activation;
use crate::{NmtError, Result};

fn default_true() -> bool {
    true
}

fn default_epsilon() -> f64 {
    1e-6
}

/// Configuration of a `Dense` projection
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DenseConfig {
    /// Depth of the last input dimension
    pub in_features: usize,

    /// Dimensionality of the output space
    pub units: usize,

    /// Whether a bias vector is added after the projection
    #[serde(default = "default_true")]
    pub use_bias: bool,

    /// Activation applied to the outputs
    #[serde(default)]
    pub activation: Activation,
}

impl DenseConfig {
    pub fn new(in_features: usize, units: usize) -> Self {
        Self {
            in_features,
            units,
            use_bias: true,
            activation: Activation::Linear,
        }
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.in_features == 0 {
            return Err(NmtError::Config("in_features must be > 0".to_string()));
        }

        if self.units == 0 {
            return Err(NmtError::Config("units must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Configuration of a `LayerNorm`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LayerNormConfig {
    /// Size of the normalized (last) dimension
    pub depth: usize,

    /// Added to the variance before the reciprocal square root
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl LayerNormConfig {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            epsilon: default_epsilon(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(NmtError::Config("depth must be > 0".to_string()));
        }

        if !(self.epsilon > 0.0) {
            return Err(NmtError::Config(format!(
                "epsilon must be > 0, got {}",
                self.epsilon
            )));
        }

        Ok(())
    }
}

/// Options of a `LayerWrapper`
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct WrapperConfig {
    /// Apply layer normalization on the input
    #[serde(default)]
    pub normalize_input: bool,

    /// Apply layer normalization on the output
    #[serde(default)]
    pub normalize_output: bool,

    /// Probability to drop units of the layer input
    #[serde(default)]
    pub input_dropout: f32,

    /// Probability to drop units of the layer output
    #[serde(default)]
    pub output_dropout: f32,

    /// Add the inputs to the layer outputs when their depths match
    #[serde(default)]
    pub residual_connection: bool,
}

impl WrapperConfig {
    /// Pre-norm residual block: normalize the input, drop the output, add the input back
    pub fn pre_norm(dropout: f32) -> Self {
        Self {
            normalize_input: true,
            output_dropout: dropout,
            residual_connection: true,
            ..Self::default()
        }
    }

    /// Post-norm residual block: drop the output, add the input back, normalize
    pub fn post_norm(dropout: f32) -> Self {
        Self {
            normalize_output: true,
            output_dropout: dropout,
            residual_connection: true,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("input_dropout", self.input_dropout),
            ("output_dropout", self.output_dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(NmtError::Config(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }

        Ok(())
    }
}

/// Serialized form of a `LayerWrapper`, embedding the wrapped layer's own configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LayerWrapperConfig<C> {
    /// Configuration of the wrapped layer
    pub layer: C,

    /// Depth of the wrapper inputs
    pub input_depth: usize,

    /// Depth of the wrapped layer outputs
    pub output_depth: usize,

    #[serde(flatten)]
    pub wrapper: WrapperConfig,
}

impl<C> LayerWrapperConfig<C> {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_depth == 0 || self.output_depth == 0 {
            return Err(NmtError::Config(
                "input_depth and output_depth must be > 0".to_string(),
            ));
        }

        self.wrapper.validate()
    }
}

fn default_max_count() -> usize {
    8
}

fn default_model_key() -> String {
    "model".to_string()
}

/// Configuration for checkpoint averaging
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AveragingConfig {
    /// Directory containing the checkpoints to average
    pub model_dir: PathBuf,

    /// Directory receiving the averaged checkpoint
    pub output_dir: PathBuf,

    /// Maximum number of most recent checkpoints to average
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Tensors named `model_key` or prefixed by `model_key.` are averaged,
    /// everything else is taken from the most recent checkpoint
    #[serde(default = "default_model_key")]
    pub model_key: String,
}

impl AveragingConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(model_dir: P, output_dir: Q) -> Self {
        Self {
            model_dir: model_dir.into(),
            output_dir: output_dir.into(),
            max_count: default_max_count(),
            model_key: default_model_key(),
        }
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.same_directories() {
            return Err(NmtError::Config(format!(
                "Model and output directory must be different, both are {}",
                self.model_dir.display()
            )));
        }

        if self.max_count == 0 {
            return Err(NmtError::Config("max_count must be > 0".to_string()));
        }

        if self.model_key.is_empty() {
            return Err(NmtError::Config("model_key must not be empty".to_string()));
        }

        Ok(())
    }

    /// Compare directories after resolving them when they both exist
    fn same_directories(&self) -> bool {
        match (
            std::fs::canonicalize(&self.model_dir),
            std::fs::canonicalize(&self.output_dir),
        ) {
            (Ok(model_dir), Ok(output_dir)) => model_dir == output_dir,
            _ => self.model_dir == self.output_dir,
        }
    }

    /// Whether a tensor name belongs to the averaged model
    pub fn is_model_tensor(&self, name: &str) -> bool {
        name == self.model_key
            || name
                .strip_prefix(self.model_key.as_str())
                .map_or(false, |rest| rest.starts_with('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_config_defaults_from_json() {
        let config: DenseConfig =
            serde_json::from_str(r#"{"in_features": 8, "units": 4}"#).unwrap();

        assert!(config.use_bias);
        assert_eq!(config.activation, Activation::Linear);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wrapper_config_rejects_invalid_dropout() {
        let config = WrapperConfig {
            output_dropout: 1.0,
            ..WrapperConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WrapperConfig {
            input_dropout: -0.1,
            ..WrapperConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(WrapperConfig::pre_norm(0.1).validate().is_ok());
    }

    #[test]
    fn test_layer_wrapper_config_flattens_options() {
        let config = LayerWrapperConfig {
            layer: LayerNormConfig::new(16),
            input_depth: 16,
            output_depth: 16,
            wrapper: WrapperConfig::post_norm(0.2),
        };

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["normalize_output"], true);
        assert_eq!(value["residual_connection"], true);
        assert_eq!(value["layer"]["depth"], 16);

        let restored: LayerWrapperConfig<LayerNormConfig> = serde_json::from_value(value).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_averaging_config_validation() {
        let config = AveragingConfig::new("run", "run");
        assert!(config.validate().is_err());

        let mut config = AveragingConfig::new("run", "run/avg");
        assert!(config.validate().is_ok());
        assert_eq!(config.max_count, 8);

        config.max_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_averaging_config_resolves_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("run"))?;

        let config = AveragingConfig::new(dir.path().join("run"), dir.path().join(".").join("run"));
        assert!(config.validate().is_err());

        let config = AveragingConfig::new(dir.path().join("run"), dir.path().join("run/../avg"));
        assert!(config.validate().is_ok());

        Ok(())
    }

    #[test]
    fn test_averaging_config_from_json_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("average.json");
        std::fs::write(&path, r#"{"model_dir": "run", "output_dir": "run/avg"}"#)?;

        let config = AveragingConfig::from_json_file(&path)?;
        assert_eq!(config.model_dir, PathBuf::from("run"));
        assert_eq!(config.output_dir, PathBuf::from("run/avg"));
        assert_eq!(config.max_count, 8);
        assert_eq!(config.model_key, "model");

        Ok(())
    }

    #[test]
    fn test_is_model_tensor() {
        let config = AveragingConfig::new("a", "b");

        assert!(config.is_model_tensor("model.encoder.kernel"));
        assert!(config.is_model_tensor("model"));
        assert!(!config.is_model_tensor("models.kernel"));
        assert!(!config.is_model_tensor("optimizer.model.m"));
    }
}
