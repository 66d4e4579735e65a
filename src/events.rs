use crate::models::CompletionState;

/// Typed events pushed from the chat service to whatever front end is
/// attached. Injected at the composition root; there is no ambient global
/// listener.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A thread id became known (created or resumed).
    ThreadReady { thread_id: String },
    /// Incremental content for the in-flight assistant message.
    StreamDelta { temp_id: String, delta: String, content: String },
    /// The backend issued a durable id for a message.
    MessageIdAssigned { temp_id: String, durable_id: String },
    /// The assistant turn finished (complete, cancelled, or failed).
    AssistantFinished { id: String, content: String, completion: CompletionState },
    /// A message could not be persisted and was saved to a local backup.
    MessageBackedUp { thread_key: String },
    /// A backup record was successfully replayed and removed.
    BackupRecovered { thread_key: String },
    /// Quota exhausted; route to the upgrade notice, not the generic error.
    PlanLimit { message: String },
    /// Generic non-blocking error notice.
    Error { message: String },
}

pub type UiSender = tokio::sync::mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = tokio::sync::mpsc::UnboundedReceiver<UiEvent>;

pub fn channel() -> (UiSender, UiReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
