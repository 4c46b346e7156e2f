//! Neural network layers built on [`Value`].
//!
//! Every layer owns its parameters exclusively and hands out clones of the
//! parameter handles through `parameters()` so an external optimizer can read
//! their gradients. Forward passes never mutate the layer.

use crate::funcs::Gather;
use crate::graph::{GraphError, Value};
use crate::tensor::{Tensor, TensorError};
use rand::Rng;
use tracing::debug;

/// Scale of the normal distribution used for weight initialization.
pub const INIT_SCALE: f64 = 0.1;

fn trailing_dim_mismatch(op: &'static str, shape: &[usize], expected: usize) -> GraphError {
    TensorError::ShapeMismatch {
        op,
        details: format!("input {shape:?} must end in a dimension of {expected}"),
    }
    .into()
}

/// Affine layer: `y = x · W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weights: Value,
    bias: Value,
}

impl Linear {
    /// `weights` `[in_features, out_features]` drawn from `N(0, 1) * 0.1`, zero `bias`.
    pub fn new<R: Rng + ?Sized>(rng: &mut R, in_features: usize, out_features: usize) -> Self {
        Self {
            weights: Value::param(Tensor::randn(
                rng,
                &[in_features, out_features],
                INIT_SCALE,
            )),
            bias: Value::param(Tensor::zeros(&[out_features])),
        }
    }

    /// Builds a layer from explicit weights.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] unless `weights` is 2-D and `bias` is
    /// 1-D with one entry per output feature.
    pub fn from_tensors(weights: Tensor, bias: Tensor) -> Result<Self, TensorError> {
        match (weights.shape(), bias.shape()) {
            (&[_, out], &[b]) if out == b => Ok(Self {
                weights: Value::param(weights),
                bias: Value::param(bias),
            }),
            (w, b) => Err(TensorError::ShapeMismatch {
                op: "Linear",
                details: format!("weights {w:?} with bias {b:?}"),
            }),
        }
    }

    /// Number of input features.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Number of output features.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }

    /// Projects a `[in]` vector or a `[batch, in]` matrix.
    ///
    /// # Errors
    /// `ShapeMismatch` if `x` is not 1-D/2-D or its trailing dimension is not `in_features`.
    pub fn forward(&self, x: &Value) -> Result<Value, GraphError> {
        let shape = x.shape();
        if !(1..=2).contains(&shape.len()) || shape.last() != Some(&self.in_features()) {
            return Err(trailing_dim_mismatch("Linear", shape, self.in_features()));
        }
        x.matmul(&self.weights)?.add(&self.bias)
    }

    /// `[weights, bias]`.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        vec![self.weights.clone(), self.bias.clone()]
    }

    /// Parameters keyed by `"{prefix}.weights"` and `"{prefix}.bias"`.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Value)> {
        vec![
            (format!("{prefix}.weights"), self.weights.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }

    pub(crate) fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Value)> {
        vec![
            (format!("{prefix}.weights"), &mut self.weights),
            (format!("{prefix}.bias"), &mut self.bias),
        ]
    }
}

/// Lookup table mapping a token id to a learned row vector.
#[derive(Debug, Clone)]
pub struct Embedding {
    weights: Value,
}

impl Embedding {
    /// A `[vocab_size, embed_size]` table drawn from `N(0, 1) * 0.1`.
    pub fn new<R: Rng + ?Sized>(rng: &mut R, vocab_size: usize, embed_size: usize) -> Self {
        Self {
            weights: Value::param(Tensor::randn(rng, &[vocab_size, embed_size], INIT_SCALE)),
        }
    }

    /// Wraps an existing `[vocab_size, embed_size]` table.
    ///
    /// # Errors
    /// [`TensorError::ShapeMismatch`] unless `weights` is 2-D.
    pub fn from_tensor(weights: Tensor) -> Result<Self, TensorError> {
        if weights.dim() != 2 {
            return Err(TensorError::ShapeMismatch {
                op: "Embedding",
                details: format!("expected a 2-D table, got {:?}", weights.shape()),
            });
        }
        Ok(Self {
            weights: Value::param(weights),
        })
    }

    /// Number of rows in the table.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Width of each row.
    #[must_use]
    pub fn embed_size(&self) -> usize {
        self.weights.shape()[1]
    }

    /// Row `index` as a 1-D value.
    ///
    /// # Errors
    /// `IndexOutOfRange` if `index >= vocab_size`.
    pub fn lookup(&self, index: usize) -> Result<Value, GraphError> {
        Value::from_function(Gather::row(index), &[&self.weights])
    }

    /// Rows for a sequence of token ids, as a `[tokens.len(), embed_size]` value.
    ///
    /// # Errors
    /// `IndexOutOfRange` if any id is `>= vocab_size`.
    pub fn embed(&self, tokens: &[usize]) -> Result<Value, GraphError> {
        Value::from_function(Gather::rows(tokens.to_vec()), &[&self.weights])
    }

    /// Embeds a 1-D value of token ids.
    ///
    /// # Errors
    /// `TypeMismatch` if any entry is not a whole, non-negative number;
    /// `ShapeMismatch` if `indices` is not 1-D; `IndexOutOfRange` as for [`Embedding::embed`].
    pub fn forward(&self, indices: &Value) -> Result<Value, GraphError> {
        if indices.data().dim() != 1 {
            return Err(TensorError::ShapeMismatch {
                op: "Embedding",
                details: format!("expected 1-D token ids, got {:?}", indices.shape()),
            }
            .into());
        }
        let tokens = indices
            .data()
            .blob()
            .iter()
            .map(|&v| token_index(v))
            .collect::<Result<Vec<_>, _>>()?;
        self.embed(&tokens)
    }

    /// `[weights]`.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        vec![self.weights.clone()]
    }

    /// The table keyed by `"{prefix}.weights"`.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Value)> {
        vec![(format!("{prefix}.weights"), self.weights.clone())]
    }

    pub(crate) fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Value)> {
        vec![(format!("{prefix}.weights"), &mut self.weights)]
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn token_index(v: f64) -> Result<usize, TensorError> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= usize::MAX as f64 {
        Ok(v as usize)
    } else {
        Err(TensorError::TypeMismatch(format!(
            "embedding index must be a non-negative integer, got {v}"
        )))
    }
}

/// Result of a self-attention pass, keeping the normalized attention matrix.
#[derive(Debug, Clone)]
pub struct Attention {
    /// `[seq_len, embed_size]` weighted combination of value vectors.
    pub output: Value,
    /// `[seq_len, seq_len]`; row `i` is query `i`'s distribution over keys.
    pub weights: Value,
}

/// Single-head scaled dot-product self-attention.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    w_q: Value,
    w_k: Value,
    w_v: Value,
}

impl SelfAttention {
    /// Three `[embed_size, embed_size]` projections drawn from `N(0, 1) * 0.1`.
    pub fn new<R: Rng + ?Sized>(rng: &mut R, embed_size: usize) -> Self {
        let mut projection =
            || Value::param(Tensor::randn(&mut *rng, &[embed_size, embed_size], INIT_SCALE));
        Self {
            w_q: projection(),
            w_k: projection(),
            w_v: projection(),
        }
    }

    /// Width of the embeddings this block attends over.
    #[must_use]
    pub fn embed_size(&self) -> usize {
        self.w_q.shape()[0]
    }

    /// Attention over a `[seq_len, embed_size]` sequence, returning the output.
    ///
    /// # Errors
    /// `ShapeMismatch` if `x` is not 2-D or its width is not `embed_size`.
    pub fn forward(&self, x: &Value) -> Result<Value, GraphError> {
        Ok(self.attend(x)?.output)
    }

    /// Like [`SelfAttention::forward`], also returning the attention matrix.
    ///
    /// `Q = xWq`, `K = xWk`, `V = xWv`; the scores `QKᵀ / sqrt(embed_size)`
    /// are normalized row by row so each query gets its own distribution.
    ///
    /// # Errors
    /// As for [`SelfAttention::forward`].
    pub fn attend(&self, x: &Value) -> Result<Attention, GraphError> {
        let embed_size = self.embed_size();
        let shape = x.shape();
        if shape.len() != 2 || shape[1] != embed_size {
            return Err(trailing_dim_mismatch("SelfAttention", shape, embed_size));
        }
        debug!(seq_len = shape[0], embed_size, "self-attention");

        let q = x.matmul(&self.w_q)?;
        let k = x.matmul(&self.w_k)?;
        let v = x.matmul(&self.w_v)?;

        let scores = q.matmul(&k.transpose()?)?;
        let scaled = scores.scale(1.0 / (embed_size as f64).sqrt())?;
        let weights = scaled.softmax()?;
        let output = weights.matmul(&v)?;
        Ok(Attention { output, weights })
    }

    /// `[w_q, w_k, w_v]`.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        vec![self.w_q.clone(), self.w_k.clone(), self.w_v.clone()]
    }

    /// Projections keyed by `"{prefix}.w_q"`, `"{prefix}.w_k"` and `"{prefix}.w_v"`.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Value)> {
        vec![
            (format!("{prefix}.w_q"), self.w_q.clone()),
            (format!("{prefix}.w_k"), self.w_k.clone()),
            (format!("{prefix}.w_v"), self.w_v.clone()),
        ]
    }

    pub(crate) fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Value)> {
        vec![
            (format!("{prefix}.w_q"), &mut self.w_q),
            (format!("{prefix}.w_k"), &mut self.w_k),
            (format!("{prefix}.w_v"), &mut self.w_v),
        ]
    }
}

/// Self-attention wrapped in a residual connection.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attention: SelfAttention,
}

impl TransformerBlock {
    /// A block attending over `embed_size`-wide embeddings.
    pub fn new<R: Rng + ?Sized>(rng: &mut R, embed_size: usize) -> Self {
        Self {
            attention: SelfAttention::new(rng, embed_size),
        }
    }

    /// The wrapped attention layer.
    #[must_use]
    pub fn attention(&self) -> &SelfAttention {
        &self.attention
    }

    /// `attention(x) + x`.
    ///
    /// # Errors
    /// As for [`SelfAttention::forward`].
    pub fn forward(&self, x: &Value) -> Result<Value, GraphError> {
        self.attention.forward(x)?.add(x)
    }

    /// Parameters of the attention layer.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        self.attention.parameters()
    }

    /// Attention parameters under `"{prefix}.attention"`.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Value)> {
        self.attention
            .named_parameters(&format!("{prefix}.attention"))
    }

    pub(crate) fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Value)> {
        self.attention
            .named_parameters_mut(&format!("{prefix}.attention"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn linear_initialization() {
        let layer = Linear::new(&mut rng(), 4, 3);
        assert_eq!(layer.in_features(), 4);
        assert_eq!(layer.out_features(), 3);
        let params = layer.parameters();
        assert_eq!(params[0].shape(), &[4, 3]);
        assert_eq!(params[1].data(), &Tensor::zeros(&[3]));
        assert!(params[0].data().blob().iter().any(|&w| w != 0.0));
    }

    #[test]
    fn linear_is_reproducible_for_a_seed() {
        let a = Linear::new(&mut rng(), 3, 3);
        let b = Linear::new(&mut rng(), 3, 3);
        assert_eq!(a.parameters()[0].data(), b.parameters()[0].data());
    }

    #[test]
    fn linear_forward_vector_and_batch() {
        let w = Tensor::raw(&[2, 3], vec![1.0, 0.0, 2.0, 0.0, 1.0, -1.0]).unwrap();
        let b = Tensor::vector(vec![0.5, 0.5, 0.5]);
        let layer = Linear::from_tensors(w, b).unwrap();

        let y = layer.forward(&Value::new(Tensor::vector(vec![1.0, 2.0]))).unwrap();
        assert_eq!(y.data().blob(), &[1.5, 2.5, 0.5]);

        let batch = Tensor::raw(&[2, 2], vec![1.0, 2.0, 0.0, 1.0]).unwrap();
        let y = layer.forward(&Value::new(batch)).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.data().blob(), &[1.5, 2.5, 0.5, 0.5, 1.5, -0.5]);
    }

    #[test]
    fn linear_rejects_wrong_width() {
        let layer = Linear::new(&mut rng(), 4, 2);
        let err = layer
            .forward(&Value::new(Tensor::zeros(&[3])))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Tensor(TensorError::ShapeMismatch { op: "Linear", .. })
        ));
    }

    #[test]
    fn linear_gradients_reach_weights_and_bias() {
        let layer = Linear::new(&mut rng(), 2, 2);
        let x = Value::new(Tensor::raw(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap());
        layer.forward(&x).unwrap().backward().unwrap();
        let params = layer.parameters();
        // dW = xᵀ · ones, db = column sums of ones
        assert_eq!(params[0].grad().unwrap().blob(), &[9.0, 9.0, 12.0, 12.0]);
        assert_eq!(params[1].grad().unwrap().blob(), &[3.0, 3.0]);
    }

    #[test]
    fn embedding_lookup_returns_exact_row() {
        let table = Embedding::new(&mut rng(), 10, 4);
        let row = table.lookup(5).unwrap();
        assert_eq!(row.shape(), &[4]);
        assert_eq!(
            row.data(),
            &table.parameters()[0].data().row(5).unwrap()
        );
    }

    #[test]
    fn embedding_lookup_out_of_range() {
        let table = Embedding::new(&mut rng(), 10, 4);
        assert_eq!(
            table.lookup(10).unwrap_err(),
            GraphError::Tensor(TensorError::IndexOutOfRange { index: 10, len: 10 })
        );
    }

    #[test]
    fn embedding_forward_rejects_fractional_ids() {
        let table = Embedding::new(&mut rng(), 10, 4);
        let ids = Value::new(Tensor::vector(vec![1.0, 2.5]));
        assert!(matches!(
            table.forward(&ids),
            Err(GraphError::Tensor(TensorError::TypeMismatch(_)))
        ));
        let ids = Value::new(Tensor::vector(vec![-1.0]));
        assert!(matches!(
            table.forward(&ids),
            Err(GraphError::Tensor(TensorError::TypeMismatch(_)))
        ));
        let ids = Value::new(Tensor::vector(vec![3.0, 0.0]));
        assert_eq!(table.forward(&ids).unwrap().shape(), &[2, 4]);
    }

    #[test]
    fn attention_preserves_shape_and_normalizes_rows() {
        let attention = SelfAttention::new(&mut rng(), 4);
        let x = Value::new(Tensor::randn(&mut rng(), &[3, 4], 1.0));
        let Attention { output, weights } = attention.attend(&x).unwrap();
        assert_eq!(output.shape(), &[3, 4]);
        assert_eq!(weights.shape(), &[3, 3]);
        for r in 0..3 {
            let total = weights.data().row(r).unwrap().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn attention_rejects_bad_input() {
        let attention = SelfAttention::new(&mut rng(), 4);
        for shape in [&[4][..], &[3, 5][..]] {
            let x = Value::new(Tensor::zeros(shape));
            assert!(matches!(
                attention.forward(&x),
                Err(GraphError::Tensor(TensorError::ShapeMismatch { .. }))
            ));
        }
    }

    #[test]
    fn attention_backward_reaches_all_projections() {
        let attention = SelfAttention::new(&mut rng(), 3);
        let x = Value::new(Tensor::randn(&mut rng(), &[2, 3], 1.0));
        attention.forward(&x).unwrap().backward().unwrap();
        for p in attention.parameters() {
            let grad = p.grad().unwrap();
            assert_eq!(grad.shape(), &[3, 3]);
        }
    }

    #[test]
    fn transformer_block_adds_residual() {
        let block = TransformerBlock::new(&mut rng(), 4);
        let x = Value::new(Tensor::randn(&mut rng(), &[3, 4], 1.0));
        let attended = block.attention().forward(&x).unwrap();
        let out = block.forward(&x).unwrap();
        let expected = attended.data().add(x.data()).unwrap();
        assert_eq!(out.data(), &expected);
    }
}
