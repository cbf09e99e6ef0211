/// Pre/post-processing around residual sub-layers
///
/// A `LayerWrapper` adds, around any layer implementing [`SubLayer`]:
/// - layer normalization of the input and/or the output
/// - dropout on the input and/or the output (training only)
/// - a residual connection when the output depth equals the input depth
///
/// Extra outputs of the wrapped layer (attention weights, decoding state…)
/// are passed through untouched.
use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use super::dropout::dropout;
use super::normalization::LayerNorm;
use crate::config::{LayerNormConfig, LayerWrapperConfig, WrapperConfig};

/// Outputs of a sub-layer: the primary tensor plus any extra outputs
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub outputs: Tensor,
    pub extra: Vec<Tensor>,
}

impl LayerOutput {
    pub fn new(outputs: Tensor) -> Self {
        Self {
            outputs,
            extra: Vec::new(),
        }
    }

    pub fn with_extra(outputs: Tensor, extra: Vec<Tensor>) -> Self {
        Self { outputs, extra }
    }
}

/// A layer that can be wrapped
///
/// `A` carries whatever additional inputs the layer needs (masks, memory,
/// cached state) and is forwarded untouched by the wrapper.
pub trait SubLayer<A = ()> {
    fn forward_t(&self, x: &Tensor, args: A, training: bool) -> Result<LayerOutput>;
}

/// Layers that can describe themselves and be rebuilt from that description
pub trait ConfigurableLayer: Sized {
    type Config: Clone + serde::Serialize + serde::de::DeserializeOwned;

    fn config(&self) -> Self::Config;

    fn from_config(config: Self::Config, vb: VarBuilder) -> crate::Result<Self>;
}

impl ConfigurableLayer for super::Dense {
    type Config = crate::config::DenseConfig;

    fn config(&self) -> Self::Config {
        super::Dense::config(self)
    }

    fn from_config(config: Self::Config, vb: VarBuilder) -> crate::Result<Self> {
        super::Dense::from_config(config, vb)
    }
}

impl ConfigurableLayer for LayerNorm {
    type Config = LayerNormConfig;

    fn config(&self) -> Self::Config {
        LayerNorm::config(self)
    }

    fn from_config(config: Self::Config, vb: VarBuilder) -> crate::Result<Self> {
        LayerNorm::from_config(config, vb)
    }
}

impl SubLayer for LayerNorm {
    fn forward_t(&self, x: &Tensor, _args: (), _training: bool) -> Result<LayerOutput> {
        Ok(LayerOutput::new(self.forward(x)?))
    }
}

/// Wrapper applying normalization, dropout and residual connection around a layer
pub struct LayerWrapper<L> {
    layer: L,
    input_layer_norm: Option<LayerNorm>,
    output_layer_norm: Option<LayerNorm>,
    input_dropout: f32,
    output_dropout: f32,
    residual_connection: bool,
    input_depth: usize,
    output_depth: usize,
}

impl<L> LayerWrapper<L> {
    /// Wrap `layer`
    ///
    /// # Arguments
    /// * `layer` - The layer to wrap
    /// * `config` - Normalization, dropout and residual options
    /// * `input_depth` - Depth of the wrapper inputs (input normalization)
    /// * `output_depth` - Depth of the wrapped layer outputs (output normalization)
    /// * `vb` - VarBuilder for the normalization parameters
    pub fn new(
        layer: L,
        config: WrapperConfig,
        input_depth: usize,
        output_depth: usize,
        vb: VarBuilder,
    ) -> crate::Result<Self> {
        config.validate()?;

        let input_layer_norm = if config.normalize_input {
            Some(LayerNorm::new(input_depth, vb.pp("input_layer_norm"))?)
        } else {
            None
        };
        let output_layer_norm = if config.normalize_output {
            Some(LayerNorm::new(output_depth, vb.pp("output_layer_norm"))?)
        } else {
            None
        };

        Ok(Self {
            layer,
            input_layer_norm,
            output_layer_norm,
            input_dropout: config.input_dropout,
            output_dropout: config.output_dropout,
            residual_connection: config.residual_connection,
            input_depth,
            output_depth,
        })
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn wrapper_config(&self) -> WrapperConfig {
        WrapperConfig {
            normalize_input: self.input_layer_norm.is_some(),
            normalize_output: self.output_layer_norm.is_some(),
            input_dropout: self.input_dropout,
            output_dropout: self.output_dropout,
            residual_connection: self.residual_connection,
        }
    }

    /// Run the wrapper, forwarding `args` to the wrapped layer
    pub fn forward_with<A>(&self, inputs: &Tensor, args: A, training: bool) -> Result<LayerOutput>
    where
        L: SubLayer<A>,
    {
        let mut x = inputs.clone();
        if let Some(ref norm) = self.input_layer_norm {
            x = norm.forward(&x)?;
        }
        let x = dropout(&x, self.input_dropout, training)?;

        let LayerOutput { outputs, extra } = self.layer.forward_t(&x, args, training)?;

        let mut outputs = dropout(&outputs, self.output_dropout, training)?;
        // The residual is only added when depths are compatible
        if self.residual_connection && outputs.dim(D::Minus1)? == inputs.dim(D::Minus1)? {
            outputs = (outputs + inputs)?;
        }
        if let Some(ref norm) = self.output_layer_norm {
            outputs = norm.forward(&outputs)?;
        }

        Ok(LayerOutput::with_extra(outputs, extra))
    }

    /// Run the wrapper and keep only the primary output
    pub fn forward(&self, inputs: &Tensor, training: bool) -> Result<Tensor>
    where
        L: SubLayer,
    {
        Ok(self.forward_with(inputs, (), training)?.outputs)
    }
}

impl<L: ConfigurableLayer> LayerWrapper<L> {
    /// Serializable description of the wrapper and the wrapped layer
    pub fn config(&self) -> LayerWrapperConfig<L::Config> {
        LayerWrapperConfig {
            layer: self.layer.config(),
            input_depth: self.input_depth,
            output_depth: self.output_depth,
            wrapper: self.wrapper_config(),
        }
    }

    /// Rebuild a wrapper, wrapped layer included, from its description
    ///
    /// The wrapped layer is created under the `layer` prefix of `vb`.
    pub fn from_config(config: LayerWrapperConfig<L::Config>, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;
        let layer = L::from_config(config.layer, vb.pp("layer"))?;
        Self::new(layer, config.wrapper, config.input_depth, config.output_depth, vb)
    }
}

impl<L, A> SubLayer<A> for LayerWrapper<L>
where
    L: SubLayer<A>,
{
    fn forward_t(&self, x: &Tensor, args: A, training: bool) -> Result<LayerOutput> {
        self.forward_with(x, args, training)
    }
}

impl<L: ConfigurableLayer> ConfigurableLayer for LayerWrapper<L> {
    type Config = LayerWrapperConfig<L::Config>;

    fn config(&self) -> Self::Config {
        LayerWrapper::config(self)
    }

    fn from_config(config: Self::Config, vb: VarBuilder) -> crate::Result<Self> {
        LayerWrapper::from_config(config, vb)
    }
}
