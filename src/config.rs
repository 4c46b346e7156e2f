//! Assistant configuration.
//!
//! One [`AssistantConfig`] value is built at startup (defaults, optionally a
//! JSON file, then command-line overrides) and handed to whatever owns the
//! request loop. Nothing in the crate keeps a process-wide instance.

use crate::chatbot::{ChatError, DEFAULT_RESPONSES};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for the response generator, the relay identity and the optional interaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Size of the generator's token space; must equal `responses.len()`.
    pub vocab_size: usize,
    /// Seed for weight initialization. `None` draws from OS entropy.
    pub seed: Option<u64>,
    /// Display name, also matched as a mention by the relay.
    pub bot_name: String,
    /// Sender id stamped on relay replies.
    pub bot_id: String,
    /// Where answered turns are appended, if anywhere.
    pub log_path: Option<PathBuf>,
    /// Fixed reply vocabulary.
    pub responses: Vec<String>,
    /// Embedding width of the demo MiniGPT.
    pub embed_size: usize,
    /// Transformer blocks in the demo MiniGPT.
    pub num_layers: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            vocab_size: DEFAULT_RESPONSES.len(),
            seed: None,
            bot_name: "TermAi".into(),
            bot_id: "TERMAI".into(),
            log_path: None,
            responses: DEFAULT_RESPONSES.iter().map(|s| (*s).to_string()).collect(),
            embed_size: 16,
            num_layers: 2,
        }
    }
}

impl AssistantConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    ///
    /// # Errors
    /// [`ChatError::Io`] if the file cannot be read, [`ChatError::Json`] if it does not parse.
    pub fn from_json_file(path: &Path) -> Result<Self, ChatError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Checks what the MiniGPT demo needs: a non-empty token space and embedding.
    ///
    /// # Errors
    /// [`ChatError::Configuration`] describing the first violated rule.
    pub fn validate_model(&self) -> Result<(), ChatError> {
        if self.vocab_size == 0 {
            return Err(ChatError::Configuration("vocab_size must be positive".into()));
        }
        if self.embed_size == 0 {
            return Err(ChatError::Configuration("embed_size must be positive".into()));
        }
        Ok(())
    }

    /// Checks the invariants the generator and relay rely on.
    ///
    /// # Errors
    /// [`ChatError::Configuration`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ChatError> {
        self.validate_model()?;
        if self.responses.len() != self.vocab_size {
            return Err(ChatError::Configuration(format!(
                "vocab_size is {} but the reply vocabulary has {} entries; \
                 list {} `responses` in the config file or drop the vocab_size override",
                self.vocab_size,
                self.responses.len(),
                self.vocab_size
            )));
        }
        if self.bot_id.is_empty() {
            return Err(ChatError::Configuration("bot_id must not be empty".into()));
        }
        Ok(())
    }

    /// Random source for weight initialization, seeded when a seed is configured.
    #[must_use]
    pub fn rng(&self) -> StdRng {
        self.seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
    }
}
