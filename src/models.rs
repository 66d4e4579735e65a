use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backup records for a thread that has not been created yet are keyed by
/// this sentinel instead of a thread id.
pub const PENDING_THREAD_KEY: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Explicit completion state for a message, so partially streamed content is
/// distinguishable from a finished turn without inspecting the text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompletionState {
    #[default]
    Complete,
    Streaming,
    Cancelled,
    Failed,
}

/// Citation attached to an assistant message by web-search-capable models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
}

/// One turn in a conversation. The id is a client-generated temporary token
/// (`temp-<uuid>`) until the backend assigns a durable identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completion: CompletionState,
}

impl Message {
    fn temp_id() -> String {
        format!("temp-{}", Uuid::new_v4())
    }

    pub fn new_user(content: impl Into<String>) -> Self {
        Self {
            id: Self::temp_id(),
            role: MessageRole::User,
            content: content.into(),
            model: None,
            annotations: Vec::new(),
            created_at: Utc::now(),
            completion: CompletionState::Complete,
        }
    }

    /// Empty assistant placeholder, created on stream open and mutated
    /// incrementally until the stream finishes.
    pub fn new_assistant_placeholder(model: impl Into<String>) -> Self {
        Self {
            id: Self::temp_id(),
            role: MessageRole::Assistant,
            content: String::new(),
            model: Some(model.into()),
            annotations: Vec::new(),
            created_at: Utc::now(),
            completion: CompletionState::Streaming,
        }
    }

    pub fn has_temp_id(&self) -> bool {
        self.id.starts_with("temp-")
    }
}

/// A conversation: a server-issued id (absent until created) plus its
/// messages in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Thread {
    pub id: Option<String>,
    pub title: Option<String>,
    pub messages: Vec<Message>,
}

/// Derives a thread title from the first user message, trimmed to 60 chars.
pub fn derive_title(first_message: &str) -> String {
    let t = first_message.trim();
    if t.chars().count() > 60 {
        format!("{}…", t.chars().take(60).collect::<String>())
    } else {
        t.to_string()
    }
}

// ── Wire types: chat proxy ────────────────────────────────────────────────────

/// Request body for `POST /api/chat`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub messages: Vec<WireMessage>,
    pub model: String,
    pub thread_id: Option<String>,
    pub stream: bool,
    pub enable_web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self { role: m.role, content: m.content.clone() }
    }
}

/// One `data: `-framed JSON event from the chat stream. The upstream proxy
/// sends message ids as either JSON strings or numbers.
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "messageId", default)]
    message_id: Option<IdRepr>,
}

impl StreamEnvelope {
    pub fn message_id(&self) -> Option<String> {
        self.message_id.as_ref().map(IdRepr::to_string)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Str(String),
    Num(i64),
}

impl std::fmt::Display for IdRepr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdRepr::Str(s) => f.write_str(s),
            IdRepr::Num(n) => write!(f, "{n}"),
        }
    }
}

// ── Wire types: thread endpoints ──────────────────────────────────────────────

/// Response of `POST /api/threads`.
#[derive(Debug, Deserialize)]
pub struct CreatedThread {
    id: IdRepr,
}

impl CreatedThread {
    pub fn id(&self) -> String {
        self.id.to_string()
    }
}

/// One row of `GET /api/messages/:thread_id`.
#[derive(Debug, Deserialize)]
pub struct MessageRow {
    id: IdRepr,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id.to_string(),
            role: self.role,
            content: self.content,
            model: self.model,
            annotations: self.annotations,
            created_at: self.created_at,
            completion: CompletionState::Complete,
        }
    }
}

/// Body of `POST /api/messages/:thread_id` (append a new message). The
/// idempotency key lets the backend deduplicate backup-sweep replays.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageBody {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub idempotency_key: String,
}

/// Body of `PUT /api/messages/:thread_id` (update by durable id).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessageBody {
    pub message_id: String,
    pub content: String,
    pub idempotency_key: String,
}

// ── Local backup records ──────────────────────────────────────────────────────

/// One message awaiting replay, with the idempotency key minted for its
/// original write so a replay cannot double-persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub message: Message,
    #[serde(default)]
    pub durable_id: Option<String>,
    pub idempotency_key: String,
}

/// Local-only recovery record for messages that failed to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub thread_key: String,
    pub entries: Vec<BackupEntry>,
    pub saved_at: DateTime<Utc>,
}
