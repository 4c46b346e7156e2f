use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Swaps the two axes of a 2-D tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transpose;

impl Transpose {
    /// Creates a new Transpose function node, boxed for the Function trait.
    #[must_use]
    pub fn new() -> Box<dyn Function> {
        Box::new(Self)
    }
}

impl Function for Transpose {
    fn name(&self) -> &'static str {
        "Transpose"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 1, "Transpose")?;
        inps[0].transpose()
    }

    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 1, "Transpose::grad")?;
        Ok(vec![out_grad.transpose()?])
    }
}
