use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Element-wise addition: `Output = Input1 + Input2`.
///
/// Inputs must share a shape, or one must be a trailing suffix of the other
/// (a bias row added to every row of a batch).
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl Add {
    /// Creates a new Add function node, boxed for the Function trait.
    #[must_use]
    pub fn new() -> Box<dyn Function> {
        Box::new(Self)
    }
}

impl Function for Add {
    fn name(&self) -> &'static str {
        "Add"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 2, "Add")?;
        inps[0].add(inps[1])
    }

    /// Both inputs receive the output gradient unchanged; a broadcast operand
    /// gets it summed over the broadcast rows.
    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 2, "Add::grad")?;
        Ok(vec![
            out_grad.reduce_to(inps[0].shape())?,
            out_grad.reduce_to(inps[1].shape())?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grad_reduces_broadcast_bias() {
        let x = Tensor::zeros(&[3, 2]);
        let b = Tensor::zeros(&[2]);
        let g = Tensor::ones(&[3, 2]);
        let grads = Add.grad(&[&x, &b], &g).unwrap();
        assert_eq!(grads[0], g);
        assert_eq!(grads[1].blob(), &[3.0, 3.0]);
    }

    #[test]
    fn rejects_wrong_arity() {
        let x = Tensor::zeros(&[2]);
        assert!(matches!(
            Add.run(&[&x]),
            Err(TensorError::UnexpectedInputCount { expected: 2, got: 1, .. })
        ));
    }
}
