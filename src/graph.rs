//! Reverse-mode automatic differentiation over [`Value`] handles.
//!
//! A [`Value`] wraps an immutable [`Tensor`] plus gradient bookkeeping. Every
//! operation produces a new `Value` that records the [`Function`] it came from
//! and handles to its operands; [`Value::backward`] walks that record in
//! reverse topological order and accumulates gradients into every node that
//! requires them.
//!
//! Values are cheap to clone (they share the node) and are `Send + Sync`, so
//! layer parameters can be shared read-only between concurrent forward passes.
//! Gradient writes are not coordinated across graphs: callers that train and
//! infer concurrently must serialize `backward` calls that touch the same
//! parameters.

use crate::funcs::{Add, Coeff, Function, MatMul, Mul, Softmax, Transpose};
use crate::tensor::{Tensor, TensorError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building or differentiating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// An operation rejected its operands.
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// The graph reachable from the root is not a DAG.
    #[error("cycle detected in the computation graph")]
    CycleDetected,
}

struct Backward {
    function: Box<dyn Function>,
    operands: Vec<Value>,
}

struct Node {
    data: Tensor,
    requires_grad: bool,
    grad: RwLock<Option<Tensor>>,
    backward: RwLock<Option<Backward>>,
}

/// A tensor node in the autograd graph.
#[derive(Clone)]
pub struct Value(Arc<Node>);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Value {
    fn from_parts(data: Tensor, requires_grad: bool) -> Self {
        Self(Arc::new(Node {
            data,
            requires_grad,
            grad: RwLock::new(None),
            backward: RwLock::new(None),
        }))
    }

    /// A constant leaf; no gradient is accumulated into it.
    #[must_use]
    pub fn new(data: Tensor) -> Self {
        Self::from_parts(data, false)
    }

    /// A trainable leaf that accumulates gradients.
    #[must_use]
    pub fn param(data: Tensor) -> Self {
        Self::from_parts(data, true)
    }

    /// Runs `function` on the operands and records it as the new node's backward step.
    ///
    /// The result requires a gradient whenever any operand does.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] if the forward computation rejects the operands.
    pub fn from_function(
        function: Box<dyn Function>,
        operands: &[&Self],
    ) -> Result<Self, GraphError> {
        let inputs: Vec<&Tensor> = operands.iter().map(|v| v.data()).collect();
        let data = function.run(&inputs)?;
        let requires_grad = operands.iter().any(|v| v.requires_grad());
        let out = Self::from_parts(data, requires_grad);
        out.attach_backward(function, operands.iter().map(|&v| v.clone()).collect());
        Ok(out)
    }

    /// Replaces this node's backward step.
    ///
    /// Intended for custom operations built outside [`crate::funcs`]. Nothing
    /// stops an operand list from pointing back at this node; such a graph is
    /// rejected by [`Value::backward`] with [`GraphError::CycleDetected`].
    pub fn attach_backward(&self, function: Box<dyn Function>, operands: Vec<Self>) {
        *self
            .0
            .backward
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Backward { function, operands });
    }

    /// The forward data.
    #[must_use]
    pub fn data(&self) -> &Tensor {
        &self.0.data
    }

    /// Shape of the forward data.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.0.data.shape()
    }

    /// Whether gradients are accumulated into this node.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    /// Snapshot of the accumulated gradient, if any.
    #[must_use]
    pub fn grad(&self) -> Option<Tensor> {
        self.0
            .grad
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.0.grad.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// True when both handles refer to the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Elementwise sum. Gradient passes through unchanged to both operands.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] with a `ShapeMismatch` for incompatible shapes.
    #[allow(clippy::should_implement_trait)]
    pub fn add(&self, other: &Self) -> Result<Self, GraphError> {
        Self::from_function(Add::new(), &[self, other])
    }

    /// Elementwise product.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] with a `ShapeMismatch` for incompatible shapes.
    pub fn multiply(&self, other: &Self) -> Result<Self, GraphError> {
        Self::from_function(Mul::new(), &[self, other])
    }

    /// Matrix product, see [`Tensor::matmul`].
    ///
    /// # Errors
    /// [`GraphError::Tensor`] with a `ShapeMismatch` for incompatible shapes.
    pub fn matmul(&self, other: &Self) -> Result<Self, GraphError> {
        Self::from_function(MatMul::new(), &[self, other])
    }

    /// Transpose of a 2-D value.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] with a `ShapeMismatch` unless 2-D.
    pub fn transpose(&self) -> Result<Self, GraphError> {
        Self::from_function(Transpose::new(), &[self])
    }

    /// Multiplies every element by `coeff`.
    ///
    /// # Errors
    /// Never fails for well-formed values; the `Result` mirrors the other operations.
    pub fn scale(&self, coeff: f64) -> Result<Self, GraphError> {
        Self::from_function(Coeff::new(coeff), &[self])
    }

    /// Softmax over the last axis.
    ///
    /// # Errors
    /// [`GraphError::Tensor`] for a 0-D value.
    pub fn softmax(&self) -> Result<Self, GraphError> {
        Softmax::apply(self)
    }

    fn key(&self) -> *const Node {
        Arc::as_ptr(&self.0)
    }

    fn operands(&self) -> Vec<Self> {
        self.0
            .backward
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|b| b.operands.clone())
            .unwrap_or_default()
    }

    /// Every node reachable from `self`, operands before the nodes that consume them.
    fn topological_order(&self) -> Result<Vec<Self>, GraphError> {
        let mut marks: HashMap<*const Node, Mark> = HashMap::new();
        let mut order = Vec::new();
        let mut stack = vec![(self.clone(), false)];

        while let Some((value, expanded)) = stack.pop() {
            let key = value.key();
            if expanded {
                marks.insert(key, Mark::Done);
                order.push(value);
                continue;
            }
            match marks.get(&key) {
                Some(Mark::Done) => continue,
                Some(Mark::Visiting) => return Err(GraphError::CycleDetected),
                None => {}
            }
            marks.insert(key, Mark::Visiting);
            let operands = value.operands();
            stack.push((value, true));
            for operand in operands {
                match marks.get(&operand.key()) {
                    Some(Mark::Visiting) => return Err(GraphError::CycleDetected),
                    Some(Mark::Done) => {}
                    None => stack.push((operand, false)),
                }
            }
        }
        Ok(order)
    }

    /// Adds `grad` into the stored gradient.
    fn accumulate(&self, grad: &Tensor) -> Result<(), GraphError> {
        if grad.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "accumulate_grad",
                details: format!("gradient {:?} for value {:?}", grad.shape(), self.shape()),
            }
            .into());
        }
        let mut slot = self.0.grad.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(match slot.take() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        });
        Ok(())
    }

    /// Runs this node's backward step once on `out_grad`, returning one gradient per operand.
    fn propagate(&self, out_grad: &Tensor) -> Result<Vec<(Self, Tensor)>, GraphError> {
        let backward = self.0.backward.read().unwrap_or_else(PoisonError::into_inner);
        let Some(backward) = backward.as_ref() else {
            return Ok(Vec::new());
        };
        let inputs: Vec<&Tensor> = backward.operands.iter().map(Self::data).collect();
        let grads = backward.function.grad(&inputs, out_grad)?;
        if grads.len() != backward.operands.len() {
            return Err(TensorError::UnexpectedInputCount {
                expected: backward.operands.len(),
                got: grads.len(),
                func_name: format!("{}::grad", backward.function.name()),
            }
            .into());
        }
        Ok(backward.operands.iter().cloned().zip(grads).collect())
    }

    /// Backpropagates from this value.
    ///
    /// The pass is seeded with this value's stored gradient, or with ones when
    /// it has none (the ones are then stored). Every reachable node's backward
    /// step runs exactly once, consumers before their operands, on the
    /// gradient contributed by this pass alone; that contribution is then
    /// added once to the node's stored gradient. Repeated calls and several
    /// roots sharing an intermediate therefore accumulate correctly.
    ///
    /// # Errors
    /// [`GraphError::CycleDetected`] if the reachable graph is not a DAG;
    /// [`GraphError::Tensor`] if a backward step produces a malformed gradient.
    pub fn backward(&self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        debug!(nodes = order.len(), shape = ?self.shape(), "backward pass");

        let seed = {
            let mut slot = self.0.grad.write().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| Tensor::ones(self.shape())).clone()
        };
        let mut pending: HashMap<*const Node, Tensor> = HashMap::new();
        pending.insert(self.key(), seed);

        for node in order.iter().rev() {
            let Some(grad) = pending.remove(&node.key()) else {
                continue;
            };
            if !node.ptr_eq(self) {
                node.accumulate(&grad)?;
            }
            for (operand, operand_grad) in node.propagate(&grad)? {
                if !operand.requires_grad() {
                    continue;
                }
                let key = operand.key();
                let total = match pending.remove(&key) {
                    Some(existing) => existing.add(&operand_grad)?,
                    None => operand_grad,
                };
                pending.insert(key, total);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("data", self.data())
            .field("requires_grad", &self.requires_grad())
            .field("grad", &self.grad())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn param(data: Vec<f64>) -> Value {
        Value::param(Tensor::vector(data))
    }

    #[test]
    fn add_passes_gradient_to_both_operands() {
        let a = param(vec![1.0, 2.0]);
        let b = param(vec![3.0, 4.0]);
        let out = a.add(&b).unwrap();
        out.backward().unwrap();
        let out_grad = out.grad().unwrap();
        assert_eq!(out_grad, Tensor::ones(&[2]));
        assert_eq!(a.grad().unwrap(), out_grad);
        assert_eq!(b.grad().unwrap(), out_grad);
    }

    #[test]
    fn multiply_applies_product_rule() {
        let a = param(vec![2.0, 3.0]);
        let b = param(vec![5.0, 7.0]);
        let out = a.multiply(&b).unwrap();
        assert_eq!(out.data().blob(), &[10.0, 21.0]);
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[5.0, 7.0]);
        assert_eq!(b.grad().unwrap().blob(), &[2.0, 3.0]);
    }

    #[test]
    fn shared_operand_accumulates() {
        // out = a * a + a  =>  d/da = 2a + 1
        let a = param(vec![3.0, -1.0]);
        let out = a.multiply(&a).unwrap().add(&a).unwrap();
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[7.0, -1.0]);
    }

    #[test]
    fn roots_sharing_an_intermediate_add_their_contributions() {
        // h = a * b feeds two losses; each contributes b = 3 to a's gradient.
        let a = param(vec![1.0]);
        let b = Value::new(Tensor::vector(vec![3.0]));
        let h = a.multiply(&b).unwrap();
        let first = h.scale(1.0).unwrap();
        let second = h.scale(1.0).unwrap();
        first.backward().unwrap();
        second.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[6.0]);
        assert_eq!(h.grad().unwrap().blob(), &[2.0]);
    }

    #[test]
    fn repeated_backward_accumulates_once_per_pass() {
        let a = param(vec![1.0]);
        let b = Value::new(Tensor::vector(vec![3.0]));
        let out = a.multiply(&b).unwrap().scale(2.0).unwrap();
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[6.0]);
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[12.0]);
        assert_eq!(out.grad().unwrap().blob(), &[1.0]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = param(vec![1.0, 2.0]);
        let b = param(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            a.add(&b),
            Err(GraphError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        assert!(matches!(
            a.multiply(&b),
            Err(GraphError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn constants_do_not_collect_gradients() {
        let a = param(vec![1.0]);
        let c = Value::new(Tensor::vector(vec![4.0]));
        let out = a.multiply(&c).unwrap();
        assert!(out.requires_grad());
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[4.0]);
        assert!(c.grad().is_none());
    }

    #[derive(Debug)]
    struct Counting(Arc<AtomicUsize>);

    impl Function for Counting {
        fn name(&self) -> &'static str {
            "Counting"
        }
        fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
            Ok(inps[0].clone())
        }
        fn grad(&self, _inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![out_grad.clone()])
        }
    }

    #[test]
    fn each_backward_step_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let a = param(vec![1.0, 2.0]);
        let mut x = a.clone();
        for _ in 0..5 {
            let y = Value::from_function(Box::new(Counting(calls.clone())), &[&x]).unwrap();
            // Fan out then join, so the counting node is reachable along two paths.
            x = y.add(&y).unwrap();
        }
        x.backward().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(a.grad().unwrap().blob(), &[32.0, 32.0]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let a = param(vec![1.0]);
        let b = a.add(&a).unwrap();
        b.attach_backward(Add::new(), vec![b.clone(), a.clone()]);
        assert_eq!(b.backward(), Err(GraphError::CycleDetected));
    }

    #[test]
    fn indirect_cycle_is_detected() {
        let a = param(vec![1.0]);
        let b = a.scale(2.0).unwrap();
        let c = b.scale(3.0).unwrap();
        b.attach_backward(Coeff::new(2.0), vec![c.clone()]);
        assert_eq!(c.backward(), Err(GraphError::CycleDetected));
    }

    #[test]
    fn existing_root_gradient_is_kept_as_seed() {
        let a = param(vec![1.0, 1.0]);
        let out = a.scale(3.0).unwrap();
        out.accumulate(&Tensor::vector(vec![2.0, -1.0])).unwrap();
        out.backward().unwrap();
        assert_eq!(a.grad().unwrap().blob(), &[6.0, -3.0]);
    }

    #[test]
    fn zero_grad_clears() {
        let a = param(vec![1.0]);
        a.add(&a).unwrap().backward().unwrap();
        assert!(a.grad().is_some());
        a.zero_grad();
        assert!(a.grad().is_none());
    }

    #[test]
    fn clones_share_a_node() {
        let a = param(vec![1.0]);
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&param(vec![1.0])));
    }

    #[test]
    fn values_are_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Value>();
    }
}
