use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Agent,
    #[default]
    Caller,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Agent => "agent",
            Sender::Caller => "caller",
        }
    }
}

/// One chat line in a session's `messages` child collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_code: String,
    pub sender: Sender,
    pub text: String,
    pub translated_text: Option<String>,
    pub target_lang: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn translated(
        session_code: &str,
        sender: Sender,
        text: &str,
        translated: &str,
        target_lang: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_code: session_code.to_string(),
            sender,
            text: text.to_string(),
            translated_text: Some(translated.to_string()),
            target_lang: Some(target_lang.to_string()),
            created_at: now,
        }
    }
}
