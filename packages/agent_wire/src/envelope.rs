//! The logical message unit reconstructed from the frame stream.

use serde::{Deserialize, Serialize};

use crate::clob::Clob;
use crate::wire::StartTag;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("invalid role: {}", s)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// What kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Error,
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            "error" => Ok(ContentKind::Error),
            _ => Err(format!("invalid content type: {}", s)),
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Text => write!(f, "text"),
            ContentKind::Image => write!(f, "image"),
            ContentKind::Error => write!(f, "error"),
        }
    }
}

/// One logical reply unit, bounded on the wire by an open and a close
/// tag and carrying zero or more content fragments.
///
/// Created when a producer opens a message; once the close tag is
/// observed the content is immutable. `is_done` marks the end of an
/// entire turn, not just of this envelope. Clones share the content
/// buffer, so every subscriber holding the envelope observes fragments
/// in the same order as they arrive.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: String,
    pub thread_id: String,
    pub agent_id: Option<String>,
    pub role: Role,
    pub kind: ContentKind,
    pub is_error: bool,
    pub is_done: bool,
    pub content: Clob,
}

impl Envelope {
    /// A fresh envelope for a just-opened message, content OPEN.
    pub fn from_tag(tag: StartTag) -> Self {
        Self {
            message_id: tag.id,
            thread_id: tag.thread_id,
            agent_id: tag.agent_id,
            role: tag.role,
            kind: tag.kind,
            is_error: tag.is_error,
            is_done: tag.is_done,
            content: Clob::new(),
        }
    }

    /// A serializable rendering for display layers, waiting for the
    /// content to close if it has not yet.
    pub async fn snapshot(&self) -> EnvelopeSnapshot {
        EnvelopeSnapshot {
            message_id: self.message_id.clone(),
            thread_id: self.thread_id.clone(),
            agent_id: self.agent_id.clone(),
            role: self.role,
            kind: self.kind,
            is_error: self.is_error,
            is_done: self.is_done,
            content: self.content.get_content().await,
        }
    }
}

/// Fully materialized form of an [`Envelope`].
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeSnapshot {
    pub message_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub is_error: bool,
    pub is_done: bool,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn content_kind_round_trips_through_strings() {
        for kind in [ContentKind::Text, ContentKind::Image, ContentKind::Error] {
            assert_eq!(kind.to_string().parse::<ContentKind>().unwrap(), kind);
        }
        assert!("video".parse::<ContentKind>().is_err());
    }

    #[test]
    fn from_tag_carries_attributes() {
        let mut tag = StartTag::new("t1");
        tag.agent_id = Some("agent-7".to_string());
        tag.role = Role::User;
        let envelope = Envelope::from_tag(tag.clone());
        assert_eq!(envelope.message_id, tag.id);
        assert_eq!(envelope.thread_id, "t1");
        assert_eq!(envelope.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(envelope.role, Role::User);
        assert!(!envelope.is_done);
    }

    #[tokio::test]
    async fn snapshot_serializes_with_materialized_content() {
        let mut tag = StartTag::new("t1");
        tag.id = "m1".to_string();
        let envelope = Envelope::from_tag(tag);
        envelope.content.append("hi").await.unwrap();
        envelope.content.close().await;

        let snapshot = envelope.snapshot().await;
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["type"], "text");
        assert_eq!(json["content"], "hi");
        assert!(json.get("agent_id").is_none());
    }
}
