//! Log record parser.
//!
//! Parses one line of a Claude Code session log into a typed [`Record`].
//! The parser is pure and stateless; the tailer owns all read positions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest excerpt of a rejected line carried in a schema error.
const EXCERPT_LEN: usize = 120;

/// Who produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Operator input.
    User,
    /// Agent output.
    Assistant,
}

impl Role {
    /// Parse a role string from the log schema.
    fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One parsed entry of a session log. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Session identifier carried by the entry.
    pub session_id: String,
    /// Author of the entry.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Uuid of the parent entry; empty when absent.
    pub parent_id: String,
    /// Entry timestamp.
    pub created_at: DateTime<Utc>,
    /// Working directory of the agent; empty when absent.
    pub cwd: String,
}

impl Record {
    /// Render the record back into its on-disk log line shape.
    ///
    /// Used by tests to author fixture logs; `parse` of the result yields
    /// the record unchanged.
    #[must_use]
    pub fn to_log_line(&self) -> String {
        serde_json::json!({
            "sessionId": self.session_id,
            "type": self.role.as_str(),
            "message": { "role": self.role.as_str(), "content": self.content },
            "parentUuid": self.parent_id,
            "timestamp": self.created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "cwd": self.cwd,
        })
        .to_string()
    }
}

/// Why a line failed to parse.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line was not valid JSON.
    #[error("Malformed JSON: {0}")]
    Syntax(String),

    /// The line was JSON but did not match the log schema.
    #[error("Schema violation ({reason}): {excerpt}")]
    Schema {
        /// What was missing or mistyped.
        reason: String,
        /// Bounded prefix of the offending line.
        excerpt: String,
    },
}

impl ParseError {
    fn schema(reason: impl Into<String>, line: &str) -> Self {
        ParseError::Schema {
            reason: reason.into(),
            excerpt: excerpt(line),
        }
    }
}

fn excerpt(line: &str) -> String {
    if line.len() <= EXCERPT_LEN {
        line.to_string()
    } else {
        let mut end = EXCERPT_LEN;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    }
}

/// Parse a single log line.
///
/// Trailing newlines are trimmed; empty or whitespace-only input yields
/// `Ok(None)`. Unknown top-level keys are ignored. Only `user` and
/// `assistant` entries with a string `message.content` are records; any
/// other shape is a schema violation.
///
/// # Errors
///
/// [`ParseError::Syntax`] for invalid JSON, [`ParseError::Schema`] for a
/// valid JSON object that does not match the log schema.
pub fn parse(line: &str) -> Result<Option<Record>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(line).map_err(|e| ParseError::Syntax(e.to_string()))?;

    let Value::Object(entry) = value else {
        return Err(ParseError::schema("entry is not an object", line));
    };

    let session_id = match entry.get("sessionId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(ParseError::schema("missing sessionId", line)),
    };

    if entry
        .get("type")
        .and_then(Value::as_str)
        .and_then(Role::from_str)
        .is_none()
    {
        return Err(ParseError::schema("type is not user/assistant", line));
    }

    let message = entry
        .get("message")
        .and_then(Value::as_object)
        .ok_or_else(|| ParseError::schema("missing message object", line))?;

    let role = message
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::from_str)
        .ok_or_else(|| ParseError::schema("message.role is not user/assistant", line))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::schema("message.content is not a string", line))?
        .to_string();

    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::schema("missing timestamp", line))?;
    let created_at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| ParseError::schema("timestamp is not RFC 3339", line))?
        .with_timezone(&Utc);

    let parent_id = entry
        .get("parentUuid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cwd = entry
        .get("cwd")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Some(Record {
        session_id,
        role,
        content,
        parent_id,
        created_at,
        cwd,
    }))
}
