//! Differentiable operations.
//!
//! Each operation is a small struct implementing [`Function`]: a forward
//! `run` over its input tensors and a `grad` that maps the gradient of the
//! output back onto every input. A [`Value`](crate::graph::Value) stores the
//! boxed function together with its operand handles and calls `grad` once
//! during the backward pass.

use crate::tensor::{Tensor, TensorError};
use std::fmt;

mod add;
mod coeff;
mod gather;
mod matmul;
mod mul;
mod softmax;
mod transpose;

pub use add::Add;
pub use coeff::Coeff;
pub use gather::Gather;
pub use matmul::MatMul;
pub use mul::Mul;
pub use softmax::Softmax;
pub use transpose::Transpose;

/// A node operation in the autograd graph.
pub trait Function: fmt::Debug + Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Forward computation.
    ///
    /// # Errors
    /// Returns `TensorError` on a wrong input count or incompatible shapes.
    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError>;

    /// Gradients with respect to each input, given the gradient of the output.
    ///
    /// The returned vector has one entry per input, each shaped like that input.
    ///
    /// # Errors
    /// Returns `TensorError` on a wrong input count or incompatible shapes.
    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError>;
}

/// Checks the arity of a function call.
pub(crate) fn expect_inputs(
    inps: &[&Tensor],
    expected: usize,
    func_name: &str,
) -> Result<(), TensorError> {
    if inps.len() == expected {
        Ok(())
    } else {
        Err(TensorError::UnexpectedInputCount {
            expected,
            got: inps.len(),
            func_name: func_name.to_string(),
        })
    }
}
