use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Element-wise product: `Output = Input1 * Input2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mul;

impl Mul {
    /// Creates a new Mul function node, boxed for the Function trait.
    #[must_use]
    pub fn new() -> Box<dyn Function> {
        Box::new(Self)
    }
}

impl Function for Mul {
    fn name(&self) -> &'static str {
        "Mul"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 2, "Mul")?;
        inps[0].mul(inps[1])
    }

    /// `dA = B * g`, `dB = A * g`.
    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 2, "Mul::grad")?;
        let (a, b) = (inps[0], inps[1]);
        Ok(vec![
            b.mul(out_grad)?.reduce_to(a.shape())?,
            a.mul(out_grad)?.reduce_to(b.shape())?,
        ])
    }
}
