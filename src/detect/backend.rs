use anyhow::{anyhow, Result};

use crate::detect::result::RawDetection;
use crate::preprocess::{InputShape, InputTensor};

/// Detector backend trait.
///
/// # Contract
///
/// - Input: a `[1, H, W, 3]` u8 tensor, `(H, W)` fixed by `input_shape()`.
/// - Output: the model's raw `[1, 1, N, 7]` rows, parsed into
///   `RawDetection`s, including low-confidence padding rows.
/// - One synchronous call per frame, no retry. An input whose shape differs
///   from `input_shape()` is a configuration error, not a per-frame glitch.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Fixed input size the model was loaded with.
    fn input_shape(&self) -> InputShape;

    /// Run the detector on one prepared frame.
    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reject tensors that do not match the detector's input shape.
pub fn check_input(expected: InputShape, input: &InputTensor) -> Result<()> {
    if input.shape() != expected.tensor_dims() {
        return Err(anyhow!(
            "input tensor shape {:?} does not match detector input {:?}",
            input.shape(),
            expected.tensor_dims()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn check_input_compares_nhwc_dims() -> Result<()> {
        let shape = InputShape::new(4, 2)?;
        assert!(check_input(shape, &Array4::zeros((1, 2, 4, 3))).is_ok());
        assert!(check_input(shape, &Array4::zeros((1, 4, 2, 3))).is_err());
        assert!(check_input(shape, &Array4::zeros((2, 2, 4, 3))).is_err());
        Ok(())
    }
}
