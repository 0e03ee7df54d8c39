//! Conversation transcripts as handed over by the host assistant.

use serde::{Deserialize, Serialize};

/// Speaker of a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// An ordered conversation transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Flatten to `role: text` lines for prompt templates.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            out.push_str(turn.role.as_str());
            out.push_str(": ");
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_labels_roles() {
        let transcript = Transcript::new(vec![
            Turn::user("fix the retry logic"),
            Turn::assistant("added exponential backoff"),
        ]);
        assert_eq!(
            transcript.rendered(),
            "user: fix the retry logic\nassistant: added exponential backoff\n"
        );
    }

    #[test]
    fn test_role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"assistant\"").unwrap(),
            Role::Assistant
        );
    }
}
