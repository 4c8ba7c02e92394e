//! Textual frame grammar for the relay transport.
//!
//! Three frame kinds travel over the broadcast transport: an open tag
//! (`<message ...>`) carrying the envelope attributes, the close tag
//! `</message>`, and bare content strings that belong to whichever
//! message is currently open on the receiving side.
//!
//! Classification is purely textual: a frame that opens like a start
//! tag but cannot be parsed is a protocol error, not content, so a
//! half-written tag never leaks into a message body.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{ContentKind, Role};
use crate::error::WireError;

/// The close tag. Matched exactly.
pub const END_TAG: &str = "</message>";

const TAG_NAME: &str = "<message";

/// Attribute set carried by an open tag.
///
/// `id` and `thread_id` are required on the wire; everything else has a
/// default. Unknown attributes are ignored when parsing so newer
/// producers can talk to older relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTag {
    pub id: String,
    pub thread_id: String,
    pub agent_id: Option<String>,
    pub role: Role,
    pub kind: ContentKind,
    pub is_error: bool,
    pub is_done: bool,
}

impl StartTag {
    /// A tag for a new message in `thread_id` with a minted v4 id and
    /// default attributes (`role=assistant`, `type=text`).
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            agent_id: None,
            role: Role::Assistant,
            kind: ContentKind::Text,
            is_error: false,
            is_done: false,
        }
    }

    /// Encode to wire text.
    ///
    /// Attribute values may not contain double quotes; any present are
    /// stripped rather than escaped.
    pub fn encode(&self) -> String {
        let mut attrs = vec![
            attr("id", &self.id),
            attr("thread_id", &self.thread_id),
        ];
        if let Some(agent_id) = &self.agent_id {
            attrs.push(attr("agent_id", agent_id));
        }
        attrs.push(attr("role", &self.role.to_string()));
        attrs.push(attr("type", &self.kind.to_string()));
        attrs.push(attr("is_error", bool_str(self.is_error)));
        attrs.push(attr("is_done", bool_str(self.is_done)));
        format!("{} {}>", TAG_NAME, attrs.join(" "))
    }
}

fn attr(key: &str, value: &str) -> String {
    format!("{}=\"{}\"", key, value.replace('"', ""))
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// One classified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Open tag: a new message begins.
    Start(StartTag),
    /// Close tag: the currently open message ends.
    End,
    /// Anything else: a fragment of the currently open message.
    Content(String),
}

impl Frame {
    /// Classify one frame of wire text.
    ///
    /// Errors only on a malformed open tag; every other string is
    /// either the close tag or content.
    pub fn classify(text: &str) -> Result<Frame, WireError> {
        if text == END_TAG {
            return Ok(Frame::End);
        }
        if let Some(rest) = text.strip_prefix(TAG_NAME) {
            // Only a real tag name: the next byte must delimit it.
            if (rest.starts_with(' ') || rest == ">") && text.ends_with('>') {
                return parse_start(text).map(Frame::Start);
            }
        }
        Ok(Frame::Content(text.to_string()))
    }
}

fn parse_start(text: &str) -> Result<StartTag, WireError> {
    let body = text
        .strip_prefix(TAG_NAME)
        .and_then(|rest| rest.strip_suffix('>'))
        .ok_or_else(|| WireError::MalformedTag(text.to_string()))?;

    let mut id = None;
    let mut thread_id = None;
    let mut agent_id = None;
    let mut role = Role::Assistant;
    let mut kind = ContentKind::Text;
    let mut is_error = false;
    let mut is_done = false;

    for (key, value) in parse_attrs(body)? {
        match key {
            "id" => id = Some(value.to_string()),
            "thread_id" => thread_id = Some(value.to_string()),
            "agent_id" => agent_id = Some(value.to_string()),
            "role" => role = value.parse().map_err(WireError::MalformedTag)?,
            "type" => kind = value.parse().map_err(WireError::MalformedTag)?,
            "is_error" => is_error = value == "true",
            "is_done" => is_done = value == "true",
            // Unknown attributes are ignored for forward compatibility.
            _ => {}
        }
    }

    let id = id.ok_or_else(|| WireError::MalformedTag(format!("missing id: {}", text)))?;
    let thread_id =
        thread_id.ok_or_else(|| WireError::MalformedTag(format!("missing thread_id: {}", text)))?;

    Ok(StartTag {
        id,
        thread_id,
        agent_id,
        role,
        kind,
        is_error,
        is_done,
    })
}

/// Scan `key="value"` pairs out of a tag body.
fn parse_attrs(body: &str) -> Result<Vec<(&str, &str)>, WireError> {
    let malformed = |at: &str| WireError::MalformedTag(at.to_string());
    let mut attrs = Vec::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(|| malformed(rest))?;
        let key = rest[..eq].trim_end();
        let after = rest[eq + 1..]
            .strip_prefix('"')
            .ok_or_else(|| malformed(rest))?;
        let end = after.find('"').ok_or_else(|| malformed(rest))?;
        attrs.push((key, &after[..end]));
        rest = after[end + 1..].trim_start();
    }
    Ok(attrs)
}
