//! Orchestrates one chat turn end to end: validate, ensure thread, persist
//! the user message, stream the assistant reply, reconcile, final-persist.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::BackendClient;
use crate::db::cache_repository::CacheRepository;
use crate::errors::AppError;
use crate::events::{UiEvent, UiSender};
use crate::models::{
    derive_title, ChatPayload, CompletionState, Message, MessageRole, MessageRow, Thread,
    UpdateMessageBody, WireMessage, PENDING_THREAD_KEY,
};
use crate::registry::{self, PlanTier};
use crate::service::persistence::{Persisted, PersistenceLayer};
use crate::service::thread_lifecycle::ThreadLifecycle;
use crate::store::MessageStore;
use crate::stream::{reconcile, StreamOutcome, StreamSink, STREAM_TIMEOUT};

pub const MAX_MESSAGE_LENGTH: usize = 8000;

pub struct ChatService {
    api: BackendClient,
    cache: CacheRepository,
    persistence: PersistenceLayer,
    lifecycle: ThreadLifecycle,
    store: MessageStore,
    events: UiSender,
    plan: PlanTier,
    model: String,
    /// Cooperative single-flight guard: one stream per service at a time.
    in_flight: bool,
    abort: Arc<watch::Sender<bool>>,
    stream_timeout: Duration,
}

impl ChatService {
    pub fn new(
        api: BackendClient,
        cache: CacheRepository,
        persistence: PersistenceLayer,
        lifecycle: ThreadLifecycle,
        events: UiSender,
        plan: PlanTier,
        default_model: &str,
    ) -> Self {
        let model = if registry::is_available(default_model, plan) {
            default_model.to_string()
        } else {
            let fallback = registry::models_for_plan(plan)
                .first()
                .copied()
                .unwrap_or(default_model)
                .to_string();
            warn!("Model {default_model} not on plan {plan}; using {fallback}");
            fallback
        };

        let (abort, _) = watch::channel(false);
        Self {
            api,
            cache,
            persistence,
            lifecycle,
            store: MessageStore::new(),
            events,
            plan,
            model,
            in_flight: false,
            abort: Arc::new(abort),
            stream_timeout: STREAM_TIMEOUT,
        }
    }

    /// Overrides the stream deadline; tests shorten it.
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn plan(&self) -> PlanTier {
        self.plan
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.lifecycle.thread_id()
    }

    /// Snapshot of the active conversation: server id (if created), a title
    /// derived from the first user message, and the messages in order.
    pub fn thread(&self) -> Thread {
        Thread {
            id: self.lifecycle.thread_id().map(str::to_string),
            title: self
                .store
                .messages()
                .iter()
                .find(|m| m.role == MessageRole::User)
                .map(|m| derive_title(&m.content)),
            messages: self.store.messages().to_vec(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight
    }

    /// Switches the model for subsequent turns only; history is untouched.
    pub fn set_model(&mut self, model_id: &str) -> Result<(), AppError> {
        if !registry::is_available(model_id, self.plan) {
            return Err(AppError::ModelNotInPlan {
                model_id: model_id.to_string(),
                plan: self.plan.to_string(),
            });
        }
        self.model = model_id.to_string();
        Ok(())
    }

    /// Handle for aborting the in-flight stream from another task. `send`
    /// borrows the service for the whole stream, so a front end grabs this
    /// beforehand and cancels through it.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { abort: Arc::clone(&self.abort) }
    }

    /// Resumes the thread recorded in the current-thread pointer, if any.
    pub async fn resume(&mut self) -> Result<(), AppError> {
        match self.cache.current_thread().await? {
            Some(id) => self.load_thread(&id).await,
            None => Ok(()),
        }
    }

    /// Loads a thread's messages from the backend, falling back to the local
    /// cache when the backend is unreachable. Restores the model selection
    /// from the most recent tagged assistant message; with no tag the prior
    /// selection stays.
    pub async fn load_thread(&mut self, thread_id: &str) -> Result<(), AppError> {
        match self.api.fetch_messages(thread_id).await {
            Ok(rows) => {
                let messages: Vec<Message> =
                    rows.into_iter().map(MessageRow::into_message).collect();
                self.store = MessageStore::from_messages(messages);
                self.snapshot(thread_id).await;
            }
            Err(e) if e.is_not_found() => {
                if let Err(e) = self.cache.clear_current_thread().await {
                    warn!("Failed to clear current thread pointer: {e}");
                }
                if let Err(e) = self.cache.delete_snapshot(thread_id).await {
                    warn!("Failed to drop stale snapshot for {thread_id}: {e}");
                }
                return Err(e);
            }
            Err(e) => {
                warn!("Backend unreachable, loading thread {thread_id} from cache: {e}");
                let cached = self.cache.load_snapshot(thread_id).await?.unwrap_or_default();
                self.store = MessageStore::from_messages(cached);
            }
        }

        self.lifecycle.activate(thread_id);
        if let Err(e) = self.cache.set_current_thread(thread_id).await {
            warn!("Failed to record current thread pointer: {e}");
        }

        if let Some(model) = self.store.last_assistant_model() {
            if registry::is_available(model, self.plan) {
                self.model = model.to_string();
            }
        }

        let _ = self.events.send(UiEvent::ThreadReady { thread_id: thread_id.to_string() });
        Ok(())
    }

    /// Starts a fresh conversation: clears in-memory state and the resume
    /// pointer. The old thread stays on the backend.
    pub async fn start_new_thread(&mut self) -> Result<(), AppError> {
        if self.in_flight {
            return Err(AppError::SendInProgress);
        }
        self.store = MessageStore::new();
        self.lifecycle.reset();
        self.cache.clear_current_thread().await
    }

    /// Sends one user message and streams the assistant reply. Rejected
    /// while a previous send is still streaming.
    pub async fn send(&mut self, text: &str) -> Result<(), AppError> {
        if self.in_flight {
            return Err(AppError::SendInProgress);
        }
        Self::validate(text)?;

        self.in_flight = true;
        self.abort.send_replace(false);
        let result = self.send_inner(text).await;
        self.in_flight = false;

        if let Err(e) = &result {
            let event = if e.is_plan_limit() {
                UiEvent::PlanLimit { message: e.to_string() }
            } else {
                UiEvent::Error { message: e.to_string() }
            };
            let _ = self.events.send(event);
        }
        result
    }

    fn validate(text: &str) -> Result<(), AppError> {
        if text.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if text.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: text.len(),
            });
        }
        Ok(())
    }

    async fn send_inner(&mut self, text: &str) -> Result<(), AppError> {
        // ── Thread ───────────────────────────────────────────────────────────
        let known = self.lifecycle.thread_id().map(str::to_string);
        let thread_id = match self.lifecycle.ensure_thread().await {
            Ok(id) => id,
            Err(e) => {
                // No thread to write to; keep the text under the pending key
                // so the next successful send adopts and replays it.
                let stranded = Message::new_user(text);
                match self.persistence.backup_pending(&stranded).await {
                    Ok(()) => {
                        let _ = self.events.send(UiEvent::MessageBackedUp {
                            thread_key: PENDING_THREAD_KEY.to_string(),
                        });
                    }
                    Err(be) => warn!("Failed to back up unsent message: {be}"),
                }
                return Err(e);
            }
        };
        if known.as_deref() != Some(thread_id.as_str()) {
            let _ = self
                .events
                .send(UiEvent::ThreadReady { thread_id: thread_id.clone() });
        }
        if let Err(e) = self.persistence.adopt_pending(&thread_id).await {
            warn!("Failed to adopt pending backups: {e}");
        }

        // ── User message ─────────────────────────────────────────────────────
        let user = Message::new_user(text);
        let user_temp_id = user.id.clone();
        self.store.push(user.clone());
        self.snapshot(&thread_id).await;

        match self.persistence.persist_message(&thread_id, &user, None).await {
            Ok(Persisted::Stored { durable_id }) => {
                self.store.assign_durable_id(&user_temp_id, &durable_id);
            }
            Ok(Persisted::Backup) => {
                let _ = self
                    .events
                    .send(UiEvent::MessageBackedUp { thread_key: thread_id.clone() });
            }
            Err(e) => warn!("User message persistence failed locally: {e}"),
        }

        // ── Assistant placeholder & stream ───────────────────────────────────
        let payload = ChatPayload {
            messages: self.store.messages().iter().map(WireMessage::from).collect(),
            model: self.model.clone(),
            thread_id: Some(thread_id.clone()),
            stream: true,
            enable_web_search: registry::supports_web_search(&self.model),
        };

        let placeholder = Message::new_assistant_placeholder(&self.model);
        let temp_id = placeholder.id.clone();
        self.store.push(placeholder);

        let byte_stream = match self.api.open_chat_stream(&payload).await {
            Ok(s) => s,
            Err(e) => {
                self.store.remove(&temp_id);
                self.snapshot(&thread_id).await;
                return Err(e);
            }
        };

        let mut abort_rx = self.abort.subscribe();
        let result = {
            let mut sink = LiveSink {
                store: &mut self.store,
                events: &self.events,
                api: &self.api,
                thread_id: &thread_id,
            };
            reconcile(byte_stream, &temp_id, &mut sink, &mut abort_rx, self.stream_timeout).await
        };

        // ── Finalize ─────────────────────────────────────────────────────────
        match result {
            Ok(res) => {
                let current_id = res
                    .durable_id
                    .clone()
                    .unwrap_or_else(|| temp_id.clone());

                match res.outcome {
                    StreamOutcome::Complete => {
                        self.store.replace_content(&current_id, &res.content);
                        self.store.set_completion(&current_id, CompletionState::Complete);

                        let mut assistant = Message::new_assistant_placeholder(&self.model);
                        assistant.content = res.content.clone();
                        assistant.completion = CompletionState::Complete;

                        let final_id = match self
                            .persistence
                            .persist_message(&thread_id, &assistant, res.durable_id.as_deref())
                            .await
                        {
                            Ok(Persisted::Stored { durable_id }) => {
                                if self.store.assign_durable_id(&current_id, &durable_id) {
                                    let _ = self.events.send(UiEvent::MessageIdAssigned {
                                        temp_id: current_id.clone(),
                                        durable_id: durable_id.clone(),
                                    });
                                }
                                durable_id
                            }
                            Ok(Persisted::Backup) => {
                                let _ = self.events.send(UiEvent::MessageBackedUp {
                                    thread_key: thread_id.clone(),
                                });
                                let _ = self.events.send(UiEvent::Error {
                                    message: "Reply could not be saved; kept locally for retry"
                                        .to_string(),
                                });
                                current_id.clone()
                            }
                            Err(e) => {
                                warn!("Final persistence failed locally: {e}");
                                current_id.clone()
                            }
                        };

                        let _ = self.events.send(UiEvent::AssistantFinished {
                            id: final_id,
                            content: res.content,
                            completion: CompletionState::Complete,
                        });
                    }
                    StreamOutcome::Cancelled => {
                        self.store.set_completion(&current_id, CompletionState::Cancelled);
                        let _ = self.events.send(UiEvent::AssistantFinished {
                            id: current_id,
                            content: res.content,
                            completion: CompletionState::Cancelled,
                        });
                    }
                }
                self.snapshot(&thread_id).await;
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                // Hung provider: drop the placeholder entirely.
                if let Some(id) = self.store.last_streaming_id() {
                    self.store.remove(&id);
                }
                self.snapshot(&thread_id).await;
                Err(e)
            }
            Err(e) => {
                // Mid-stream transport failure: keep surfaced partial content
                // but tag it, or drop the placeholder if nothing arrived.
                if let Some(id) = self.store.last_streaming_id() {
                    let empty = self.store.get(&id).is_none_or(|m| m.content.is_empty());
                    if empty {
                        self.store.remove(&id);
                    } else {
                        self.store.set_completion(&id, CompletionState::Failed);
                        let _ = self.events.send(UiEvent::AssistantFinished {
                            id,
                            content: String::new(),
                            completion: CompletionState::Failed,
                        });
                    }
                }
                self.snapshot(&thread_id).await;
                Err(e)
            }
        }
    }

    async fn snapshot(&self, thread_id: &str) {
        if let Err(e) = self
            .cache
            .save_snapshot(thread_id, self.store.messages(), Utc::now())
            .await
        {
            warn!("Write-through cache update failed: {e}");
        }
    }
}

/// Cancels the stream a [`ChatService`] is draining. Partial content already
/// shown stays; the message is tagged cancelled.
#[derive(Clone)]
pub struct CancelHandle {
    abort: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.abort.send(true);
    }
}

/// Live sink: mirrors stream effects into the message store and the UI
/// channel, and spawns fire-and-forget checkpoint writes. The final persist
/// retries; a lost checkpoint only widens the recovery window.
struct LiveSink<'a> {
    store: &'a mut MessageStore,
    events: &'a UiSender,
    api: &'a BackendClient,
    thread_id: &'a str,
}

impl StreamSink for LiveSink<'_> {
    fn on_delta(&mut self, temp_id: &str, delta: &str, content: &str) {
        let id = self
            .store
            .last_streaming_id()
            .unwrap_or_else(|| temp_id.to_string());
        self.store.replace_content(&id, content);
        let _ = self.events.send(UiEvent::StreamDelta {
            temp_id: id,
            delta: delta.to_string(),
            content: content.to_string(),
        });
    }

    fn on_durable_id(&mut self, temp_id: &str, durable_id: &str) {
        if self.store.assign_durable_id(temp_id, durable_id) {
            let _ = self.events.send(UiEvent::MessageIdAssigned {
                temp_id: temp_id.to_string(),
                durable_id: durable_id.to_string(),
            });
        }
    }

    fn checkpoint(&mut self, durable_id: Option<&str>, content: &str) {
        // Nothing to update until the backend has issued an id.
        let Some(id) = durable_id else { return };
        let api = self.api.clone();
        let thread_id = self.thread_id.to_string();
        let body = UpdateMessageBody {
            message_id: id.to_string(),
            content: content.to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = api.put_message(&thread_id, &body).await {
                debug!("Checkpoint write failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_and_oversized_messages() {
        assert!(matches!(
            ChatService::validate("   "),
            Err(AppError::EmptyField { .. })
        ));
        let oversized = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(
            ChatService::validate(&oversized),
            Err(AppError::FieldTooLong { .. })
        ));
        assert!(ChatService::validate("hello").is_ok());
    }
}
