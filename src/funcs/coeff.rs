use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Multiplies every element by a fixed scalar.
#[derive(Debug, Clone, Copy)]
pub struct Coeff {
    coeff: f64,
}

impl Coeff {
    /// Creates a new Coeff function node, boxed for the Function trait.
    #[must_use]
    pub fn new(coeff: f64) -> Box<dyn Function> {
        Box::new(Self { coeff })
    }
}

impl Function for Coeff {
    fn name(&self) -> &'static str {
        "Coeff"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 1, "Coeff")?;
        Ok(inps[0].map_values(|v| v * self.coeff))
    }

    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 1, "Coeff::grad")?;
        Ok(vec![out_grad.map_values(|g| g * self.coeff)])
    }
}
