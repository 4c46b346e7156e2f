use super::{expect_inputs, Function};
use crate::graph::{GraphError, Value};
use crate::tensor::{Tensor, TensorError};

/// Softmax over the last axis.
///
/// A 1-D input becomes a single probability distribution; a 2-D input is
/// normalized row by row. The forward pass subtracts the row maximum before
/// exponentiating.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax;

impl Softmax {
    /// Creates a new Softmax function node, boxed for the Function trait.
    #[must_use]
    pub fn new() -> Box<dyn Function> {
        Box::new(Self)
    }

    /// Applies softmax to `value`, recording the operation for backpropagation.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] if `value` is 0-D.
    pub fn apply(value: &Value) -> Result<Value, GraphError> {
        Value::from_function(Self::new(), &[value])
    }
}

impl Function for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 1, "Softmax")?;
        inps[0].softmax()
    }

    /// Per row: `dx = y * (g - sum(g * y))`.
    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 1, "Softmax::grad")?;
        let y = inps[0].softmax()?;
        if out_grad.shape() != y.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "Softmax::grad",
                details: format!("{:?} vs {:?}", out_grad.shape(), y.shape()),
            });
        }
        let width = y.last_dim()?;
        let mut data = Vec::with_capacity(y.size());
        if width > 0 {
            for (y_row, g_row) in y.blob().chunks(width).zip(out_grad.blob().chunks(width)) {
                let dot: f64 = y_row.iter().zip(g_row).map(|(y, g)| y * g).sum();
                data.extend(y_row.iter().zip(g_row).map(|(y, g)| y * (g - dot)));
            }
        }
        Ok(vec![Tensor::raw(y.shape(), data)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grad_matches_finite_differences() {
        let x = Tensor::vector(vec![0.3, -1.2, 2.0]);
        let g = Tensor::vector(vec![1.0, 0.5, -2.0]);
        let analytic = Softmax.grad(&[&x], &g).unwrap().remove(0);

        let loss = |t: &Tensor| -> f64 {
            let y = t.softmax().unwrap();
            y.blob().iter().zip(g.blob()).map(|(a, b)| a * b).sum()
        };
        let eps = 1e-6;
        for i in 0..3 {
            let mut plus = x.blob().to_vec();
            let mut minus = x.blob().to_vec();
            plus[i] += eps;
            minus[i] -= eps;
            let numeric =
                (loss(&Tensor::vector(plus)) - loss(&Tensor::vector(minus))) / (2.0 * eps);
            assert!((numeric - analytic.blob()[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn uniform_gradient_vanishes() {
        let x = Tensor::vector(vec![1.0, 2.0, 3.0, 4.0]);
        let g = Tensor::ones(&[4]);
        let grad = Softmax.grad(&[&x], &g).unwrap().remove(0);
        assert!(grad.blob().iter().all(|v| v.abs() < 1e-12));
    }

    proptest! {
        #[test]
        fn sums_to_one_and_stays_in_unit_interval(
            xs in prop::collection::vec(-50.0f64..50.0, 1..16),
        ) {
            let p = Softmax.run(&[&Tensor::vector(xs)]).unwrap();
            prop_assert!((p.sum() - 1.0).abs() < 1e-9);
            prop_assert!(p.blob().iter().all(|&v| (0.0..=1.0).contains(&v)));
        }

        #[test]
        fn is_shift_invariant(
            xs in prop::collection::vec(-50.0f64..50.0, 1..16),
            shift in -1.0e3f64..1.0e3,
        ) {
            let base = Softmax.run(&[&Tensor::vector(xs.clone())]).unwrap();
            let shifted_input: Vec<f64> = xs.iter().map(|v| v + shift).collect();
            let shifted = Softmax.run(&[&Tensor::vector(shifted_input)]).unwrap();
            for (a, b) in base.blob().iter().zip(shifted.blob()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
        }
    }
}
