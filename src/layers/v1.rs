/// Loading of weights exported from legacy (v1) checkpoints
use candle_core::{Tensor, Var};

use crate::{NmtError, Result};

/// Assign legacy values to the parameters they were mapped to
///
/// Parameters must be trainable variables (built from a `VarMap`) and shapes
/// must match exactly. Values are cast to the parameter dtype.
pub fn assign_v1_weights(mapping: Vec<(&Tensor, Tensor)>) -> Result<()> {
    for (param, value) in mapping {
        if param.dims() != value.dims() {
            return Err(NmtError::Layer(format!(
                "v1 weight shape {:?} does not match parameter shape {:?}",
                value.dims(),
                param.dims()
            )));
        }
        if !param.is_variable() {
            return Err(NmtError::Layer(
                "cannot assign v1 weights to a frozen parameter".to_string(),
            ));
        }

        // Wrapping a variable tensor shares its storage
        let var = Var::from_tensor(param)?;
        var.set(&value.to_dtype(param.dtype())?)?;
    }
    Ok(())
}
