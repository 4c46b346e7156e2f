//! The assistant's reply policy.
//!
//! [`ResponseGenerator`] is a deterministic placeholder: the message is hashed
//! to a token id, pushed one-hot through an untrained [`Linear`] layer and a
//! softmax, and the most probable index picks one of a fixed set of replies.
//! Weights never change after construction, so the same message always gets
//! the same reply.
//!
//! Hosts talk to it through the [`Responder`] trait, which lets a remote,
//! API-backed responder sit in front of it via [`FallbackResponder`].

use crate::chatlog::ChatLogger;
use crate::config::AssistantConfig;
use crate::gpt::GptError;
use crate::graph::{GraphError, Value};
use crate::layers::Linear;
use crate::tensor::Tensor;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::{debug, warn};

/// The built-in reply vocabulary.
pub const DEFAULT_RESPONSES: [&str; 10] = [
    "Hello!",
    "How are you?",
    "Tell me more.",
    "That is interesting.",
    "Why?",
    "I am learning.",
    "TermChat is cool.",
    "Data is power.",
    "Computing...",
    "Error.",
];

const DEFAULT_VOCAB: NonZeroUsize = match NonZeroUsize::new(DEFAULT_RESPONSES.len()) {
    Some(n) => n,
    None => panic!("default reply vocabulary is empty"),
};

/// Errors surfaced by the chat layer.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Inconsistent settings, e.g. a reply vocabulary whose length differs from `vocab_size`.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The numeric core failed.
    #[error("model error: {0}")]
    Model(#[from] GptError),
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A JSON document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A line of the interaction log is not a valid record.
    #[error("malformed interaction log record on line {line}: {source}")]
    LogRecord {
        /// 1-based line number.
        line: usize,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// A remote responder failed.
    #[error("remote responder failed: {0}")]
    Remote(String),
}

impl From<GraphError> for ChatError {
    fn from(e: GraphError) -> Self {
        Self::Model(GptError::Graph(e))
    }
}

/// Anything that can answer a chat message.
pub trait Responder: Send + Sync {
    /// Produces a reply to `text`.
    ///
    /// # Errors
    /// Implementation specific; [`ResponseGenerator`] never fails.
    fn respond(&self, text: &str) -> Result<String, ChatError>;
}

/// Maps text to a token id in `[0, vocab_size)`.
///
/// Uses the first eight bytes of the SHA-256 digest, so ids are stable across
/// runs and machines.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hash_token(text: &str, vocab_size: NonZeroUsize) -> usize {
    let digest = Sha256::digest(text.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    // the remainder is below vocab_size, so it fits in usize
    (u64::from_be_bytes(prefix) % vocab_size.get() as u64) as usize
}

/// One-hot -> linear -> softmax -> argmax over a fixed reply vocabulary.
#[derive(Debug, Clone)]
pub struct ResponseGenerator {
    layer: Linear,
    responses: Vec<String>,
    vocab: NonZeroUsize,
}

impl ResponseGenerator {
    /// Builds a generator with a `vocab_size x vocab_size` layer drawn from `rng`.
    ///
    /// # Errors
    /// [`ChatError::Configuration`] if `vocab_size` is zero or `responses.len() != vocab_size`.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        vocab_size: usize,
        responses: Vec<String>,
    ) -> Result<Self, ChatError> {
        let vocab = NonZeroUsize::new(vocab_size)
            .ok_or_else(|| ChatError::Configuration("vocab_size must be positive".into()))?;
        if responses.len() != vocab_size {
            return Err(ChatError::Configuration(format!(
                "response vocabulary has {} entries but vocab_size is {vocab_size}",
                responses.len()
            )));
        }
        Ok(Self {
            layer: Linear::new(rng, vocab_size, vocab_size),
            responses,
            vocab,
        })
    }

    /// A generator over [`DEFAULT_RESPONSES`].
    pub fn with_default_responses<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            layer: Linear::new(rng, DEFAULT_VOCAB.get(), DEFAULT_VOCAB.get()),
            responses: DEFAULT_RESPONSES.iter().map(|s| (*s).to_string()).collect(),
            vocab: DEFAULT_VOCAB,
        }
    }

    /// Builds the generator described by `config`.
    ///
    /// # Errors
    /// [`ChatError::Configuration`] if the config is invalid.
    pub fn from_config(config: &AssistantConfig) -> Result<Self, ChatError> {
        config.validate()?;
        Self::new(&mut config.rng(), config.vocab_size, config.responses.clone())
    }

    /// Size of the token space.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.get()
    }

    /// The reply vocabulary, indexed by token id.
    #[must_use]
    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    /// The projection's `[weights, bias]`.
    #[must_use]
    pub fn parameters(&self) -> Vec<Value> {
        self.layer.parameters()
    }

    /// Token id of `text`.
    #[must_use]
    pub fn token_id(&self, text: &str) -> usize {
        hash_token(text, self.vocab)
    }

    /// Reply distribution for `text`, length `vocab_size`.
    ///
    /// # Errors
    /// Only on an internal shape inconsistency, which construction rules out.
    pub fn probabilities(&self, text: &str) -> Result<Tensor, GraphError> {
        let token_id = self.token_id(text);
        let input = Value::new(Tensor::one_hot(self.vocab_size(), token_id)?);
        let logits = self.layer.forward(&input)?;
        let probabilities = logits.softmax()?;
        debug!(token_id, "scored message");
        Ok(probabilities.data().clone())
    }

    /// Index of the chosen reply; ties go to the lowest index.
    ///
    /// # Errors
    /// As for [`ResponseGenerator::probabilities`].
    pub fn predict(&self, text: &str) -> Result<usize, GraphError> {
        let probabilities = self.probabilities(text)?;
        Ok(probabilities.argmax().unwrap_or(0))
    }

    /// Reply to `text`. Total: every string, including the empty one, maps to a
    /// vocabulary entry.
    #[must_use]
    pub fn generate(&self, text: &str) -> String {
        let index = self.predict(text).unwrap_or_else(|e| {
            warn!(error = %e, "forward pass failed, replying by token id");
            self.token_id(text)
        });
        self.responses[index].clone()
    }
}

impl Responder for ResponseGenerator {
    fn respond(&self, text: &str) -> Result<String, ChatError> {
        Ok(self.generate(text))
    }
}

/// Tries an optional primary responder and falls back to a local one on error.
///
/// Every answered turn is appended to the interaction log when one is configured.
pub struct FallbackResponder<P, L> {
    primary: Option<P>,
    local: L,
    logger: Option<ChatLogger>,
}

impl<L: Responder> FallbackResponder<L, L> {
    /// Local-only responder.
    pub fn local(local: L) -> Self {
        Self {
            primary: None,
            local,
            logger: None,
        }
    }
}

impl<P: Responder, L: Responder> FallbackResponder<P, L> {
    /// `primary` first, `local` when it fails.
    pub fn new(primary: P, local: L) -> Self {
        Self {
            primary: Some(primary),
            local,
            logger: None,
        }
    }

    /// Records every answered turn with `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: ChatLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    fn record(&self, input: &str, output: &str) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_interaction(input, output) {
                warn!(error = %e, path = %logger.path().display(), "failed to log interaction");
            }
        }
    }
}

impl<P: Responder, L: Responder> Responder for FallbackResponder<P, L> {
    fn respond(&self, text: &str) -> Result<String, ChatError> {
        let primary = self.primary.as_ref().map(|p| p.respond(text));
        let reply = match primary {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                warn!(error = %e, "primary responder failed, using local generator");
                self.local.respond(text)?
            }
            None => self.local.respond(text)?,
        };
        self.record(text, &reply);
        Ok(reply)
    }
}
