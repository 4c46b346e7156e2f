use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Matrix product `A @ B`, where `A` is `[k]` or `[m, k]` and `B` is `[k, n]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatMul;

impl MatMul {
    /// Creates a new MatMul function node, boxed for the Function trait.
    #[must_use]
    pub fn new() -> Box<dyn Function> {
        Box::new(Self)
    }
}

impl Function for MatMul {
    fn name(&self) -> &'static str {
        "MatMul"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 2, "MatMul")?;
        inps[0].matmul(inps[1])
    }

    /// `dA = g @ Bᵀ`, `dB = Aᵀ @ g` (an outer product when `A` is a vector).
    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 2, "MatMul::grad")?;
        let (a, b) = (inps[0], inps[1]);
        let grad_a = out_grad.matmul(&b.transpose()?)?;
        let grad_b = if a.dim() == 1 {
            a.outer(out_grad)?
        } else {
            a.transpose()?.matmul(out_grad)?
        };
        Ok(vec![grad_a, grad_b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grads_have_operand_shapes() {
        let a = Tensor::ones(&[2, 3]);
        let b = Tensor::ones(&[3, 4]);
        let g = Tensor::ones(&[2, 4]);
        let grads = MatMul.grad(&[&a, &b], &g).unwrap();
        assert_eq!(grads[0].shape(), &[2, 3]);
        assert_eq!(grads[1].shape(), &[3, 4]);
        assert!(grads[0].blob().iter().all(|&v| (v - 4.0).abs() < 1e-12));
        assert!(grads[1].blob().iter().all(|&v| (v - 2.0).abs() < 1e-12));
    }

    #[test]
    fn vector_lhs_grad_is_outer_product() {
        let x = Tensor::vector(vec![1.0, 2.0]);
        let w = Tensor::ones(&[2, 3]);
        let g = Tensor::vector(vec![1.0, 0.0, -1.0]);
        let grads = MatMul.grad(&[&x, &w], &g).unwrap();
        assert_eq!(grads[0].blob(), &[0.0, 0.0]);
        assert_eq!(grads[1].blob(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    }
}
