//! Message types
//!
//! Defines chat message structures and roles.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Caller errors raised while inspecting a conversation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("messages must not be empty")]
    EmptyConversation,

    #[error("At least one user message is required.")]
    NoUserMessage,
}

/// Finds the most recent message authored by the user.
///
/// The search runs from the end of the conversation backwards. An empty
/// conversation and a conversation without any user turn are both caller
/// errors; neither falls back to another message.
pub fn last_user_message(messages: &[Message]) -> Result<&Message, ChatError> {
    if messages.is_empty() {
        return Err(ChatError::EmptyConversation);
    }
    messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .ok_or(ChatError::NoUserMessage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(Role::User, "Hello, world!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, world!");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("be brief")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"be brief"}"#);

        let parsed: Message = serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(parsed.role, Role::Assistant);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let parsed = serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_last_user_message_searches_backwards() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::assistant("another reply"),
        ];
        assert_eq!(last_user_message(&messages).unwrap().content, "second");
    }

    #[test]
    fn test_last_user_message_empty_conversation() {
        assert_eq!(last_user_message(&[]), Err(ChatError::EmptyConversation));
    }

    #[test]
    fn test_last_user_message_without_user_turn() {
        let messages = vec![Message::system("rules"), Message::assistant("hello")];
        assert_eq!(last_user_message(&messages), Err(ChatError::NoUserMessage));
    }
}
