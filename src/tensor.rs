//! Dense, row-major `f64` tensors.
//!
//! [`Tensor`] is the plain data container underneath every [`Value`](crate::graph::Value).
//! It knows nothing about gradients; all operations here are shape-checked and
//! return a fresh tensor rather than mutating in place.

use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Matrix products with at least this many multiply-adds are split across rayon workers.
const PARALLEL_MATMUL_THRESHOLD: usize = 1 << 15;

/// Errors raised by tensor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    /// Operand dimensions are incompatible for the requested operation.
    #[error("shape mismatch in {op}: {details}")]
    ShapeMismatch {
        /// Operation that rejected its operands.
        op: &'static str,
        /// Human readable description of the offending shapes.
        details: String,
    },
    /// An index fell outside `[0, len)`.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Length of the indexed axis.
        len: usize,
    },
    /// A value of the wrong kind was supplied (e.g. a fractional token id).
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// The element count does not match the product of the shape.
    #[error("shape {shape:?} expects {expected} elements, got {got}")]
    InvalidShape {
        /// Requested shape.
        shape: Vec<usize>,
        /// Product of `shape`.
        expected: usize,
        /// Number of elements actually provided.
        got: usize,
    },
    /// A [`Function`](crate::funcs::Function) was called with the wrong number of inputs.
    #[error("{func_name} expects {expected} input(s), got {got}")]
    UnexpectedInputCount {
        /// Expected number of inputs.
        expected: usize,
        /// Number of inputs received.
        got: usize,
        /// Name of the function.
        func_name: String,
    },
}

impl TensorError {
    fn shape_mismatch(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            details: format!("{lhs:?} vs {rhs:?}"),
        }
    }
}

/// A multi-dimensional array of `f64` values stored contiguously in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Builds a tensor from a shape and its flat row-major data.
    ///
    /// # Errors
    /// [`TensorError::InvalidShape`] if `data.len()` is not the product of `shape`.
    pub fn raw(shape: &[usize], data: Vec<f64>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::InvalidShape {
                shape: shape.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Builds a 1-D tensor owning `data`.
    #[must_use]
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Tensor of the given shape with every element set to `value`.
    #[must_use]
    pub fn filled(shape: &[usize], value: f64) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    /// Tensor of zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Tensor of ones.
    #[must_use]
    pub fn ones(shape: &[usize]) -> Self {
        Self::filled(shape, 1.0)
    }

    /// 1-D vector of length `len` holding `1.0` at `index` and zeros elsewhere.
    ///
    /// # Errors
    /// [`TensorError::IndexOutOfRange`] if `index >= len`.
    pub fn one_hot(len: usize, index: usize) -> Result<Self, TensorError> {
        if index >= len {
            return Err(TensorError::IndexOutOfRange { index, len });
        }
        let mut data = vec![0.0; len];
        data[index] = 1.0;
        Ok(Self::vector(data))
    }

    /// Standard-normal samples multiplied by `scale`.
    ///
    /// The caller owns the random source, so a seeded generator reproduces the
    /// exact same weights.
    pub fn randn<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], scale: f64) -> Self {
        let size = shape.iter().product();
        let data = (0..size)
            .map(|_| rng.sample::<f64, _>(StandardNormal) * scale)
            .collect();
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Dimensions of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major view of the elements.
    #[must_use]
    pub fn blob(&self) -> &[f64] {
        &self.data
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Applies `f` to every element.
    #[must_use]
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Elementwise combination. Shapes must be equal, or one shape must be a
    /// trailing suffix of the other (e.g. a bias vector against a batch).
    fn zip_with(
        &self,
        other: &Self,
        op: &'static str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Self, TensorError> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Self {
                shape: self.shape.clone(),
                data,
            });
        }
        if !other.data.is_empty() && self.shape.ends_with(&other.shape) {
            let data = self
                .data
                .iter()
                .zip(other.data.iter().cycle())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Self {
                shape: self.shape.clone(),
                data,
            });
        }
        if !self.data.is_empty() && other.shape.ends_with(&self.shape) {
            let data = other
                .data
                .iter()
                .zip(self.data.iter().cycle())
                .map(|(&b, &a)| f(a, b))
                .collect();
            return Ok(Self {
                shape: other.shape.clone(),
                data,
            });
        }
        Err(TensorError::shape_mismatch(op, &self.shape, &other.shape))
    }

    /// Elementwise sum.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] for shapes that are neither equal nor suffix-broadcastable.
    pub fn add(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Elementwise product.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] as for [`Tensor::add`].
    pub fn mul(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    /// Sums a (possibly broadcast) gradient back down to `shape`.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] if `shape` is not a trailing suffix of this tensor's shape.
    pub fn reduce_to(&self, shape: &[usize]) -> Result<Self, TensorError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        if !self.shape.ends_with(shape) {
            return Err(TensorError::shape_mismatch("reduce", &self.shape, shape));
        }
        let width: usize = shape.iter().product();
        let mut data = vec![0.0; width];
        if width > 0 {
            for chunk in self.data.chunks(width) {
                for (acc, &v) in data.iter_mut().zip(chunk) {
                    *acc += v;
                }
            }
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Matrix product.
    ///
    /// Supports `[k] @ [k, n] -> [n]` and `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] for any other rank combination or a
    /// mismatched inner dimension.
    pub fn matmul(&self, other: &Self) -> Result<Self, TensorError> {
        let (m, k, squeeze) = match self.shape.as_slice() {
            &[k] => (1, k, true),
            &[m, k] => (m, k, false),
            _ => return Err(TensorError::shape_mismatch("matmul", &self.shape, &other.shape)),
        };
        let n = match other.shape.as_slice() {
            &[k2, n] if k2 == k => n,
            _ => return Err(TensorError::shape_mismatch("matmul", &self.shape, &other.shape)),
        };

        let mut result = vec![0.0; m * n];
        let fill_row = |(i, row): (usize, &mut [f64])| {
            let lhs = &self.data[i * k..(i + 1) * k];
            for (l, &a) in lhs.iter().enumerate() {
                let rhs = &other.data[l * n..(l + 1) * n];
                for (r, &b) in row.iter_mut().zip(rhs) {
                    *r += a * b;
                }
            }
        };
        if n > 0 {
            if m * n * k >= PARALLEL_MATMUL_THRESHOLD {
                result.par_chunks_mut(n).enumerate().for_each(fill_row);
            } else {
                result.chunks_mut(n).enumerate().for_each(fill_row);
            }
        }

        let shape = if squeeze { vec![n] } else { vec![m, n] };
        Ok(Self {
            shape,
            data: result,
        })
    }

    /// Outer product of two 1-D tensors: `[m] x [n] -> [m, n]`.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] unless both operands are 1-D.
    pub fn outer(&self, other: &Self) -> Result<Self, TensorError> {
        if self.dim() != 1 || other.dim() != 1 {
            return Err(TensorError::shape_mismatch("outer", &self.shape, &other.shape));
        }
        let data = self
            .data
            .iter()
            .flat_map(|&a| other.data.iter().map(move |&b| a * b))
            .collect();
        Ok(Self {
            shape: vec![self.size(), other.size()],
            data,
        })
    }

    /// Transpose of a 2-D tensor.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] unless the tensor is 2-D.
    pub fn transpose(&self) -> Result<Self, TensorError> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(TensorError::ShapeMismatch {
                op: "transpose",
                details: format!("expected a 2-D tensor, got {:?}", self.shape),
            });
        };
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Ok(Self {
            shape: vec![cols, rows],
            data,
        })
    }

    /// Row `index` of a 2-D tensor as a 1-D tensor.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] if not 2-D, [`TensorError::IndexOutOfRange`]
    /// if `index` is past the last row.
    pub fn row(&self, index: usize) -> Result<Self, TensorError> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(TensorError::ShapeMismatch {
                op: "row",
                details: format!("expected a 2-D tensor, got {:?}", self.shape),
            });
        };
        if index >= rows {
            return Err(TensorError::IndexOutOfRange { index, len: rows });
        }
        Ok(Self::vector(
            self.data[index * cols..(index + 1) * cols].to_vec(),
        ))
    }

    /// Sum of all elements.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Position of the largest element; ties resolve to the lowest index.
    /// `None` for an empty tensor.
    #[must_use]
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &v) in self.data.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Size of the last axis.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] for a 0-D tensor.
    pub fn last_dim(&self) -> Result<usize, TensorError> {
        self.shape.last().copied().ok_or(TensorError::ShapeMismatch {
            op: "last_dim",
            details: "tensor has no axes".into(),
        })
    }

    /// Numerically stable softmax along the last axis.
    ///
    /// Each row is shifted by its maximum before exponentiation, so large
    /// logits do not overflow.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] for a 0-D tensor.
    pub fn softmax(&self) -> Result<Self, TensorError> {
        let width = self.last_dim()?;
        let mut data = self.data.clone();
        if width > 0 {
            for row in data.chunks_mut(width) {
                let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut total = 0.0;
                for v in row.iter_mut() {
                    *v = (*v - max).exp();
                    total += *v;
                }
                for v in row.iter_mut() {
                    *v /= total;
                }
            }
        }
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn raw_rejects_wrong_element_count() {
        let err = Tensor::raw(&[2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(
            err,
            TensorError::InvalidShape {
                shape: vec![2, 2],
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn matmul_2d() {
        let a = Tensor::raw(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::raw(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.blob(), &[4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn matmul_vector_by_matrix() {
        let x = Tensor::vector(vec![1.0, 2.0]);
        let w = Tensor::raw(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let y = x.matmul(&w).unwrap();
        assert_eq!(y.shape(), &[3]);
        assert_eq!(y.blob(), &[9.0, 12.0, 15.0]);
    }

    #[test]
    fn matmul_large_matches_sequential_result() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Tensor::randn(&mut rng, &[40, 32], 1.0);
        let b = Tensor::randn(&mut rng, &[32, 30], 1.0);
        let c = a.matmul(&b).unwrap();
        for i in [0, 17, 39] {
            for j in [0, 11, 29] {
                let expected: f64 = (0..32)
                    .map(|l| a.blob()[i * 32 + l] * b.blob()[l * 30 + j])
                    .sum();
                assert!((c.blob()[i * 30 + j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn matmul_inner_dimension_mismatch() {
        let a = Tensor::zeros(&[2, 3]);
        let b = Tensor::zeros(&[2, 3]);
        assert!(matches!(
            a.matmul(&b),
            Err(TensorError::ShapeMismatch { op: "matmul", .. })
        ));
    }

    #[test]
    fn add_broadcasts_trailing_suffix() {
        let x = Tensor::raw(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::vector(vec![10.0, 20.0]);
        assert_eq!(x.add(&b).unwrap().blob(), &[11.0, 22.0, 13.0, 24.0]);
        assert_eq!(b.add(&x).unwrap().shape(), &[2, 2]);
        assert!(x.add(&Tensor::vector(vec![1.0, 2.0, 3.0])).is_err());
    }

    #[test]
    fn reduce_to_sums_broadcast_rows() {
        let g = Tensor::raw(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(g.reduce_to(&[2]).unwrap().blob(), &[9.0, 12.0]);
        assert!(g.reduce_to(&[3]).is_err());
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = Tensor::raw(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose().unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.blob(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn argmax_breaks_ties_low() {
        let t = Tensor::vector(vec![0.5, 2.0, 2.0, -1.0]);
        assert_eq!(t.argmax(), Some(1));
        assert_eq!(Tensor::vector(vec![]).argmax(), None);
    }

    #[test]
    fn softmax_survives_large_logits() {
        let t = Tensor::vector(vec![1000.0, 1001.0, 1002.0]);
        let p = t.softmax().unwrap();
        assert!(p.blob().iter().all(|v| v.is_finite()));
        assert!((p.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn softmax_is_row_wise() {
        let t = Tensor::raw(&[2, 3], vec![1.0, 2.0, 3.0, -5.0, 0.0, 5.0]).unwrap();
        let p = t.softmax().unwrap();
        for r in 0..2 {
            assert!((p.row(r).unwrap().sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn randn_is_reproducible_for_a_seed() {
        let a = Tensor::randn(&mut StdRng::seed_from_u64(3), &[4, 4], 0.1);
        let b = Tensor::randn(&mut StdRng::seed_from_u64(3), &[4, 4], 0.1);
        assert_eq!(a, b);
    }

    #[test]
    fn one_hot_checks_range() {
        assert_eq!(Tensor::one_hot(3, 1).unwrap().blob(), &[0.0, 1.0, 0.0]);
        assert_eq!(
            Tensor::one_hot(3, 3),
            Err(TensorError::IndexOutOfRange { index: 3, len: 3 })
        );
    }
}
