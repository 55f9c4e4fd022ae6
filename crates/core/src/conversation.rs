use serde::{Deserialize, Serialize};
use std::fmt;

/// Opening user message that asks the character to speak first.
pub const OPENING_MESSAGE: &str = "Hello, let's start chatting.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Role-tagged history of one role-play dialogue.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Starts a dialogue with the given character, already holding the
    /// opening user message.
    pub fn new(character_setting: &str) -> Self {
        let mut conversation = Self::default();
        conversation.push(Role::System, system_prompt(character_setting));
        conversation.push(Role::User, OPENING_MESSAGE);
        conversation
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content);
    }

    /// Records a reply. Empty replies are not kept.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        let content = content.into();
        if !content.trim().is_empty() {
            self.push(Role::Assistant, content);
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn system_prompt(character_setting: &str) -> String {
    format!(
        "You are playing a character in an emotional role-play conversation. \
         Stay in character at all times.\n\
         Character setting: {character_setting}\n\
         Reply the way this character would speak aloud: natural, emotional, \
         and brief. Use no more than three sentences and no markdown, lists \
         or stage directions."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation_is_seeded() {
        let conversation = Conversation::new("A grumpy lighthouse keeper");

        assert_eq!(conversation.len(), 2);
        let messages = conversation.messages();
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("A grumpy lighthouse keeper"));
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, OPENING_MESSAGE);
    }

    #[test]
    fn test_blank_assistant_reply_is_dropped() {
        let mut conversation = Conversation::new("x");
        conversation.push_assistant("  ");
        conversation.push_user("How are you?");
        conversation.push_assistant("Tired.");

        let roles: Vec<_> = conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::User, Role::Assistant]
        );
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage {
            role: Role::Assistant,
            content: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
