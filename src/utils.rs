/// Utility functions
use candle_core::Tensor;

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Replace the last dimension of `dims` by `last`
pub fn shape_with_last_dim(dims: &[usize], last: usize) -> Vec<usize> {
    let mut shape = dims.to_vec();
    match shape.last_mut() {
        Some(d) => *d = last,
        None => shape.push(last),
    }
    shape
}
