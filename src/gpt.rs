use crate::graph::{GraphError, Value};
use crate::layers::{Embedding, Linear, TransformerBlock};
use crate::tensor::{Tensor, TensorError};

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

// --- Custom Error Type ---
/// Errors raised while building, running or persisting a [`MiniGPT`].
#[derive(Debug, Error)]
pub enum GptError {
    /// Autograd failure.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    /// Tensor failure outside a graph operation.
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    /// Invalid model hyper-parameters or input.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Reading or writing a state file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A state file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

type GptResult<T> = Result<T, GptError>;

// --- Model State ---
/// Snapshot of every named parameter of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelState {
    /// Parameter name -> weights.
    pub tensors: BTreeMap<String, Tensor>,
}

impl ModelState {
    /// Writes the state with bincode to `<path>.tmp`, then renames it onto `path`.
    ///
    /// # Errors
    /// [`GptError::Io`] or [`GptError::Serialization`].
    pub fn save(&self, path: &Path) -> GptResult<()> {
        let bytes = bincode::serialize(self)?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, &bytes)?;
        fs::rename(&temp_path, path)?;
        info!(path = %path.display(), tensors = self.tensors.len(), "saved model state");
        Ok(())
    }

    /// Reads a state written by [`ModelState::save`].
    ///
    /// # Errors
    /// [`GptError::Io`] or [`GptError::Serialization`].
    pub fn load(path: &Path) -> GptResult<Self> {
        let bytes = fs::read(path)?;
        let state: Self = bincode::deserialize(&bytes)?;
        info!(path = %path.display(), tensors = state.tensors.len(), "loaded model state");
        Ok(state)
    }
}

// --- MiniGPT Model ---
/// Token embedding, a stack of attention blocks and an output projection.
///
/// No causal mask is applied: every position attends over the whole sequence.
#[derive(Debug, Clone)]
pub struct MiniGPT {
    embedding: Embedding,
    blocks: Vec<TransformerBlock>,
    head: Linear,
}

impl MiniGPT {
    /// Creates a model with freshly initialized weights drawn from `rng`.
    ///
    /// # Errors
    /// [`GptError::Configuration`] if `vocab_size` or `embed_size` is zero.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        vocab_size: usize,
        embed_size: usize,
        num_layers: usize,
    ) -> GptResult<Self> {
        if vocab_size == 0 || embed_size == 0 {
            return Err(GptError::Configuration(format!(
                "vocab_size ({vocab_size}) and embed_size ({embed_size}) must be non-zero"
            )));
        }
        let embedding = Embedding::new(rng, vocab_size, embed_size);
        let blocks = (0..num_layers)
            .map(|_| TransformerBlock::new(&mut *rng, embed_size))
            .collect();
        let head = Linear::new(rng, embed_size, vocab_size);
        debug!(vocab_size, embed_size, num_layers, "built MiniGPT");
        Ok(Self {
            embedding,
            blocks,
            head,
        })
    }

    /// Vocabulary size (width of the logits).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    /// Embedding width.
    #[must_use]
    pub fn embed_size(&self) -> usize {
        self.embedding.embed_size()
    }

    /// Number of transformer blocks.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Logits for every position: `[tokens.len(), vocab_size]`.
    ///
    /// # Errors
    /// [`GptError::Configuration`] for an empty sequence, [`GptError::Graph`]
    /// with `IndexOutOfRange` for a token id outside the vocabulary.
    pub fn forward(&self, tokens: &[usize]) -> GptResult<Value> {
        if tokens.is_empty() {
            return Err(GptError::Configuration(
                "cannot run a forward pass over an empty sequence".into(),
            ));
        }
        let mut x = self.embedding.embed(tokens)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(self.head.forward(&x)?)
    }

    /// Logits for the position after the last token, a 1-D tensor of length `vocab_size`.
    ///
    /// # Errors
    /// As for [`MiniGPT::forward`].
    pub fn next_token_logits(&self, tokens: &[usize]) -> GptResult<Tensor> {
        let logits = self.forward(tokens)?;
        Ok(logits.data().row(tokens.len() - 1)?)
    }

    /// Extends `prompt` by `count` tokens, sampling each from the next-token
    /// distribution. A `temperature` of zero or below picks the argmax.
    ///
    /// # Errors
    /// As for [`MiniGPT::forward`].
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        prompt: &[usize],
        count: usize,
        temperature: f64,
    ) -> GptResult<Vec<usize>> {
        let mut sequence = prompt.to_vec();
        for _ in 0..count {
            let logits = self.next_token_logits(&sequence)?;
            let next = select_next_token(rng, &logits, temperature)?;
            sequence.push(next);
        }
        Ok(sequence)
    }

    /// Every trainable parameter, embedding first and head last.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        let mut params = self.embedding.parameters();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    /// Total number of scalar weights.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.parameters().iter().map(|p| p.data().size()).sum()
    }

    /// Every parameter with a stable, dotted name (`embedding.weights`,
    /// `blocks.0.attention.w_q`, ..., `head.bias`).
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, Value)> {
        let mut params = self.embedding.named_parameters("embedding");
        for (l, block) in self.blocks.iter().enumerate() {
            params.extend(block.named_parameters(&format!("blocks.{l}")));
        }
        params.extend(self.head.named_parameters("head"));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Value)> {
        let mut params = self.embedding.named_parameters_mut("embedding");
        for (l, block) in self.blocks.iter_mut().enumerate() {
            params.extend(block.named_parameters_mut(&format!("blocks.{l}")));
        }
        params.extend(self.head.named_parameters_mut("head"));
        params
    }

    /// Copies the current weights into a [`ModelState`].
    #[must_use]
    pub fn state(&self) -> ModelState {
        let tensors = self
            .named_parameters()
            .into_iter()
            .map(|(name, value)| (name, value.data().clone()))
            .collect();
        ModelState { tensors }
    }

    /// Replaces the weights with those in `state`.
    ///
    /// Either every parameter is replaced or none is.
    ///
    /// # Errors
    /// [`GptError::Configuration`] if a parameter is missing from `state` or has the wrong shape.
    pub fn load_state(&mut self, state: &ModelState) -> GptResult<()> {
        let mut params = self.named_parameters_mut();
        let mut replacements = Vec::with_capacity(params.len());
        for (name, value) in &params {
            let tensor = state.tensors.get(name).ok_or_else(|| {
                GptError::Configuration(format!("parameter '{name}' missing from model state"))
            })?;
            if tensor.shape() != value.shape() {
                return Err(GptError::Configuration(format!(
                    "parameter '{name}' has shape {:?} in model state, expected {:?}",
                    tensor.shape(),
                    value.shape()
                )));
            }
            replacements.push(Value::param(tensor.clone()));
        }
        for ((_, slot), replacement) in params.iter_mut().zip(replacements) {
            **slot = replacement;
        }
        Ok(())
    }
}

/// Picks the next token from a 1-D logits tensor.
fn select_next_token<R: Rng + ?Sized>(
    rng: &mut R,
    logits: &Tensor,
    temperature: f64,
) -> GptResult<usize> {
    if temperature <= 0.0 {
        return logits
            .argmax()
            .ok_or_else(|| GptError::Configuration("cannot sample from empty logits".into()));
    }
    let probabilities = logits.map_values(|x| x / temperature).softmax()?;
    let dist = WeightedIndex::new(probabilities.blob()).map_err(|e| {
        GptError::Configuration(format!("failed to create sampling distribution: {e}"))
    })?;
    Ok(dist.sample(rng))
}
