//! Message-bus relay logic.
//!
//! The relay sees every JSON payload published on the shared chat topic and
//! answers the ones addressed to the assistant: chat messages from someone
//! else that ask a question or mention the assistant. Replies are published
//! back on the same topic under the assistant's sender id. Broker connection
//! handling lives with the caller; this module only maps payloads to replies.

use crate::chatbot::{ChatError, Responder};
use crate::config::AssistantConfig;
use crate::text::is_question;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Message type carried by user and assistant chat lines.
pub const CHAT_KIND: &str = "chat";

fn unknown_sender() -> String {
    "unknown".into()
}

/// Payload published on the chat topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message type; only `"chat"` is answered.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Sender id.
    #[serde(default = "unknown_sender")]
    pub id: String,
    /// Message text.
    #[serde(default)]
    pub msg: String,
}

impl ChatMessage {
    /// A chat line from `id`.
    pub fn chat(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: CHAT_KIND.into(),
            id: id.into(),
            msg: msg.into(),
        }
    }
}

/// Answers chat payloads addressed to the assistant.
pub struct Relay<R> {
    responder: R,
    bot_id: String,
    mention: String,
}

impl<R: Responder> Relay<R> {
    /// A relay replying as `bot_id` and treating `bot_name` (any case) as a mention.
    pub fn new(responder: R, bot_id: impl Into<String>, bot_name: &str) -> Self {
        Self {
            responder,
            bot_id: bot_id.into(),
            mention: bot_name.to_lowercase(),
        }
    }

    /// A relay using the identity in `config`.
    pub fn from_config(responder: R, config: &AssistantConfig) -> Self {
        Self::new(responder, config.bot_id.clone(), &config.bot_name)
    }

    /// Sender id stamped on replies.
    #[must_use]
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Whether `message` should get a reply.
    ///
    /// The assistant's own messages are never answered, which keeps it from
    /// talking to itself on the shared topic.
    #[must_use]
    pub fn should_respond(&self, message: &ChatMessage) -> bool {
        if message.kind != CHAT_KIND || message.id == self.bot_id {
            return false;
        }
        let lower = message.msg.to_lowercase();
        is_question(&message.msg)
            || lower.contains("ai")
            || (!self.mention.is_empty() && lower.contains(&self.mention))
    }

    /// Produces the reply message for `message`, if it deserves one.
    ///
    /// # Errors
    /// Whatever the responder returns.
    pub fn reply_to(&self, message: &ChatMessage) -> Result<Option<ChatMessage>, ChatError> {
        if !self.should_respond(message) {
            debug!(sender = %message.id, "ignoring message");
            return Ok(None);
        }
        info!(sender = %message.id, "answering message");
        let reply = self.responder.respond(&message.msg)?;
        Ok(Some(ChatMessage::chat(self.bot_id.clone(), reply)))
    }

    /// Decodes a raw payload and encodes the reply, if any.
    ///
    /// # Errors
    /// [`ChatError::Json`] if the payload is not a JSON object, plus any responder error.
    pub fn handle(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, ChatError> {
        let message: ChatMessage = serde_json::from_slice(payload)?;
        self.reply_to(&message)?
            .map(|reply| serde_json::to_vec(&reply).map_err(ChatError::from))
            .transpose()
    }
}
