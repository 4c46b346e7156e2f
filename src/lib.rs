#![warn(missing_docs)] // Enforce documentation coverage at the warning level

//! # termai
//!
//! `termai` is the numeric core behind the TermChat assistant: a small tensor
//! and reverse-mode autograd engine, a handful of transformer layers, and the
//! deterministic toy reply policy the chat front-ends call into.
//!
//! ## Key Components:
//!
//! *   [`Tensor`]: dense row-major `f64` arrays with shape-checked operations.
//! *   [`Value`]: a tensor node in the autograd graph; [`Value::backward`]
//!     accumulates gradients into every parameter it reaches.
//! *   [`funcs`]: the differentiable operations (add, multiply, matmul,
//!     softmax, ...) behind the [`Function`] trait.
//! *   [`Linear`], [`Embedding`], [`SelfAttention`], [`TransformerBlock`] and
//!     [`MiniGPT`]: layers and a miniature transformer built from them.
//! *   [`ResponseGenerator`]: hashes a message, runs it through a linear layer
//!     and a softmax, and picks one of a fixed set of replies.
//! *   [`Relay`], [`ChatLogger`], [`AssistantConfig`]: the pieces a chat host
//!     wires around the generator.
//!
//! ## Example
//!
//! ```
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use termai::ResponseGenerator;
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let bot = ResponseGenerator::with_default_responses(&mut rng);
//!
//! let reply = bot.generate("hello");
//! assert_eq!(reply, bot.generate("hello"));
//! assert!(bot.responses().contains(&reply));
//! ```

// --- Module Declarations ---

/// Reply policy, the `Responder` seam and the fallback wrapper.
pub mod chatbot;
/// Append-only JSON-lines interaction log.
pub mod chatlog;
/// Assistant configuration object.
pub mod config;
/// Differentiable operations used as backward steps of graph nodes.
pub mod funcs;
/// The miniature transformer and model state persistence.
pub mod gpt;
/// Autograd nodes and the backward pass.
pub mod graph;
/// Linear, embedding, attention and transformer-block layers.
pub mod layers;
/// Message-bus relay logic (payload filtering and reply construction).
pub mod relay;
/// Dense tensor storage and math.
pub mod tensor;
/// Chat-message text helpers.
pub mod text;

// --- Public API Re-exports ---

pub use chatbot::{ChatError, FallbackResponder, Responder, ResponseGenerator, DEFAULT_RESPONSES};
pub use chatlog::{ChatLogger, Interaction};
pub use config::AssistantConfig;
pub use funcs::{Function, Softmax};
pub use gpt::{GptError, MiniGPT, ModelState};
pub use graph::{GraphError, Value};
pub use layers::{Attention, Embedding, Linear, SelfAttention, TransformerBlock};
pub use relay::{ChatMessage, Relay};
pub use tensor::{Tensor, TensorError};
