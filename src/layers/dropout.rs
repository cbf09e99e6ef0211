/// Dropout that is only active in training mode
use candle_core::{Result, Tensor};

/// Drop units of `x` with probability `rate` when `training` is set
///
/// Surviving units are scaled by `1 / (1 - rate)`. Outside training, or with a
/// zero rate, the input is returned as is.
pub fn dropout(x: &Tensor, rate: f32, training: bool) -> Result<Tensor> {
    if !(0.0..1.0).contains(&rate) {
        candle_core::bail!("dropout rate must be in [0, 1), got {}", rate)
    }
    if !training || rate == 0.0 {
        return Ok(x.clone());
    }
    candle_nn::ops::dropout(x, rate)
}
