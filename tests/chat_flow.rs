//! End-to-end tests of the send pipeline against an in-process mock of the
//! hosted backend: thread endpoints plus the SSE chat proxy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};

use polychat::api::BackendClient;
use polychat::db;
use polychat::db::backup_repository::BackupRepository;
use polychat::db::cache_repository::CacheRepository;
use polychat::errors::AppError;
use polychat::events::{self, UiEvent, UiReceiver};
use polychat::models::{CompletionState, PENDING_THREAD_KEY};
use polychat::registry::PlanTier;
use polychat::service::chat_service::ChatService;
use polychat::service::persistence::PersistenceLayer;
use polychat::service::thread_lifecycle::ThreadLifecycle;

// ── Mock backend ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    threads: Vec<String>,
    messages: HashMap<String, Vec<Value>>,
    next_thread: u64,
    next_message: u64,
    fail_thread_creates: u32,
    fail_posts: u32,
    fail_puts: u32,
    sse_body: String,
    chat_status: Option<(u16, String)>,
    /// Send `sse_body` as one chunk, then hold the connection open forever.
    stall_after_body: bool,
}

type Shared = Arc<Mutex<MockState>>;

async fn create_thread(State(state): State<Shared>) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    if s.fail_thread_creates > 0 {
        s.fail_thread_creates -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    s.next_thread += 1;
    let id = format!("T{}", s.next_thread);
    s.threads.push(id.clone());
    s.messages.insert(id.clone(), Vec::new());
    (StatusCode::OK, Json(json!({ "id": id })))
}

async fn get_messages(
    Path(thread_id): Path<String>,
    State(state): State<Shared>,
) -> impl IntoResponse {
    let s = state.lock().unwrap();
    match s.messages.get(&thread_id) {
        Some(rows) => (StatusCode::OK, Json(json!(rows))),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "no such thread"}))),
    }
}

async fn post_message(
    Path(thread_id): Path<String>,
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    if s.fail_posts > 0 {
        s.fail_posts -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    if !s.messages.contains_key(&thread_id) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such thread"})));
    }
    s.next_message += 1;
    let id = format!("M{}", s.next_message);
    let row = json!({
        "id": id,
        "role": body["role"],
        "content": body["content"],
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "created_at": Utc::now().to_rfc3339(),
    });
    s.messages.get_mut(&thread_id).unwrap().push(row);
    (StatusCode::OK, Json(json!({ "id": id })))
}

async fn put_message(
    Path(thread_id): Path<String>,
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = state.lock().unwrap();
    if s.fail_puts > 0 {
        s.fail_puts -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    let Some(rows) = s.messages.get_mut(&thread_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such thread"})));
    };
    let message_id = body["messageId"].clone();
    match rows.iter_mut().find(|r| r["id"] == message_id) {
        Some(row) => row["content"] = body["content"].clone(),
        // Upsert: checkpoint/final writes may reference an id issued by the
        // streaming pipeline before any POST.
        None => rows.push(json!({
            "id": message_id,
            "role": "assistant",
            "content": body["content"],
            "model": Value::Null,
            "created_at": Utc::now().to_rfc3339(),
        })),
    }
    (StatusCode::OK, Json(json!({})))
}

async fn chat(State(state): State<Shared>) -> Response {
    let s = state.lock().unwrap();
    if let Some((status, body)) = &s.chat_status {
        return (
            StatusCode::from_u16(*status).unwrap(),
            [(header::CONTENT_TYPE, "application/json")],
            body.clone(),
        )
            .into_response();
    }
    if s.stall_after_body {
        let first = Bytes::from(s.sse_body.clone());
        let stream = futures_util::stream::iter([Ok::<_, std::io::Error>(first)])
            .chain(futures_util::stream::pending());
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(stream),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        s.sse_body.clone(),
    )
        .into_response()
}

async fn spawn_mock(state: Shared) -> String {
    let app = Router::new()
        .route("/api/threads", post(create_thread))
        .route(
            "/api/messages/{id}",
            get(get_messages).post(post_message).put(put_message),
        )
        .route("/api/chat", post(chat))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    service: ChatService,
    events: UiReceiver,
    persistence: PersistenceLayer,
    backups: BackupRepository,
    cache: CacheRepository,
}

async fn harness(base_url: &str) -> Harness {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let cache = CacheRepository::new(pool.clone());
    let backups = BackupRepository::new(pool);
    let api = BackendClient::new(base_url, None);
    let persistence = PersistenceLayer::with_policy(
        api.clone(),
        backups.clone(),
        3,
        Duration::from_millis(10),
    );
    let lifecycle = ThreadLifecycle::with_backoffs(
        api.clone(),
        cache.clone(),
        vec![Duration::from_millis(10), Duration::from_millis(10)],
    );
    let (tx, rx) = events::channel();
    let service = ChatService::new(
        api,
        cache.clone(),
        persistence.clone(),
        lifecycle,
        tx,
        PlanTier::Pro,
        "openai/gpt-4o",
    );
    Harness { service, events: rx, persistence, backups, cache }
}

fn drain(rx: &mut UiReceiver) -> Vec<UiEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn sse(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|l| format!("data: {l}\n\n"))
        .collect::<String>()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_send_flow_reconciles_stream_and_ids() {
    let state = Shared::default();
    state.lock().unwrap().sse_body = sse(&[
        r#"{"content":"Hi"}"#,
        r#"{"content":" there"}"#,
        r#"{"messageId":"M9"}"#,
        "[DONE]",
    ]);
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    h.service.send("Hello").await.unwrap();

    let messages = h.service.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Hello");
    assert!(!messages[0].has_temp_id());
    assert_eq!(messages[1].id, "M9");
    assert_eq!(messages[1].content, "Hi there");
    assert_eq!(messages[1].completion, CompletionState::Complete);
    assert_eq!(messages[1].model.as_deref(), Some("openai/gpt-4o"));

    let thread_id = h.service.thread_id().unwrap().to_string();
    assert_eq!(thread_id, "T1");

    // The backend holds the user message and the finalized assistant reply.
    let s = state.lock().unwrap();
    let rows = &s.messages[&thread_id];
    assert!(rows.iter().any(|r| r["content"] == "Hello"));
    assert!(rows
        .iter()
        .any(|r| r["id"] == "M9" && r["content"] == "Hi there"));
    drop(s);

    let deltas: Vec<String> = drain(&mut h.events)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::StreamDelta { delta, .. } => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hi", " there"]);

    // The current-thread pointer allows reload recovery.
    assert_eq!(h.cache.current_thread().await.unwrap(), Some(thread_id));
}

#[tokio::test]
async fn thread_create_failure_aborts_send_without_messages() {
    let state = Shared::default();
    state.lock().unwrap().fail_thread_creates = 10;
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    let err = h.service.send("Hello").await.unwrap_err();
    assert!(matches!(err, AppError::ThreadCreateFailed { attempts: 3 }));

    assert!(h.service.messages().is_empty());
    assert!(state.lock().unwrap().threads.is_empty());
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, UiEvent::Error { .. })));
}

#[tokio::test]
async fn deleted_thread_is_silently_recreated_before_next_send() {
    let state = Shared::default();
    state.lock().unwrap().sse_body = sse(&[r#"{"content":"ok"}"#, "[DONE]"]);
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    h.service.send("first").await.unwrap();
    assert_eq!(h.service.thread_id(), Some("T1"));

    // Server-side deletion racing client state.
    {
        let mut s = state.lock().unwrap();
        s.threads.retain(|t| t != "T1");
        s.messages.remove("T1");
    }

    h.service.send("second").await.unwrap();
    assert_eq!(h.service.thread_id(), Some("T2"));

    let s = state.lock().unwrap();
    assert!(s.messages["T2"].iter().any(|r| r["content"] == "second"));
}

#[tokio::test]
async fn exhausted_final_persist_becomes_backup_then_sweep_recovers() {
    let state = Shared::default();
    state.lock().unwrap().sse_body = sse(&[
        r#"{"messageId":"M9"}"#,
        r#"{"content":"Hi"}"#,
        r#"{"content":" there"}"#,
        "[DONE]",
    ]);
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    // Every PUT (checkpoint, final persist, retries) fails for now.
    state.lock().unwrap().fail_puts = 1000;

    h.service.send("Hello").await.unwrap();
    let thread_id = h.service.thread_id().unwrap().to_string();

    let record = h.backups.find(&thread_id).await.unwrap().unwrap();
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].message.content, "Hi there");
    assert_eq!(record.entries[0].durable_id.as_deref(), Some("M9"));
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, UiEvent::MessageBackedUp { .. })));

    // Backend recovers; the sweep replays and clears the record.
    state.lock().unwrap().fail_puts = 0;
    let recovered = h.persistence.replay_backups().await.unwrap();
    assert_eq!(recovered, vec![thread_id.clone()]);
    assert!(h.backups.find(&thread_id).await.unwrap().is_none());

    let s = state.lock().unwrap();
    assert!(s.messages[&thread_id]
        .iter()
        .any(|r| r["id"] == "M9" && r["content"] == "Hi there"));
    drop(s);

    // Second sweep on the already-recovered record is a no-op.
    let again = h.persistence.replay_backups().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn quota_refusal_routes_to_plan_limit_and_rolls_back_placeholder() {
    let state = Shared::default();
    state.lock().unwrap().chat_status =
        Some((429, "Daily limit exceeded for free models".to_string()));
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    let err = h.service.send("Hello").await.unwrap_err();
    assert!(err.is_plan_limit());

    // Only the user message remains visible; the placeholder rolled back.
    let messages = h.service.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello");

    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, UiEvent::PlanLimit { .. })));
}

#[tokio::test]
async fn resume_restores_messages_and_model_from_last_assistant_turn() {
    let state = Shared::default();
    let base = spawn_mock(state.clone()).await;

    {
        let mut s = state.lock().unwrap();
        s.threads.push("T7".to_string());
        s.messages.insert(
            "T7".to_string(),
            vec![
                json!({
                    "id": "M1", "role": "user", "content": "q",
                    "model": Value::Null, "created_at": Utc::now().to_rfc3339(),
                }),
                json!({
                    "id": "M2", "role": "assistant", "content": "a",
                    "model": "anthropic/claude-3.5-sonnet",
                    "created_at": Utc::now().to_rfc3339(),
                }),
            ],
        );
    }

    let mut h = harness(&base).await;
    h.cache.set_current_thread("T7").await.unwrap();

    h.service.resume().await.unwrap();
    assert_eq!(h.service.thread_id(), Some("T7"));
    assert_eq!(h.service.messages().len(), 2);
    assert_eq!(h.service.model(), "anthropic/claude-3.5-sonnet");
}

#[tokio::test]
async fn cancel_handle_stops_stream_and_tags_partial_reply_cancelled() {
    let state = Shared::default();
    {
        let mut s = state.lock().unwrap();
        s.sse_body = sse(&[r#"{"content":"par"}"#]);
        s.stall_after_body = true;
    }
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    // Grabbed before the send; `send` borrows the service for the whole
    // stream, so cancellation has to come from another task.
    let cancel = h.service.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    h.service.send("Hello").await.unwrap();

    let messages = h.service.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "par");
    assert_eq!(messages[1].completion, CompletionState::Cancelled);

    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        UiEvent::AssistantFinished { completion: CompletionState::Cancelled, .. }
    )));
}

#[tokio::test]
async fn stalled_stream_times_out_and_removes_placeholder() {
    let state = Shared::default();
    {
        let mut s = state.lock().unwrap();
        s.sse_body = sse(&[r#"{"content":"par"}"#]);
        s.stall_after_body = true;
    }
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;
    h.service = h.service.with_stream_timeout(Duration::from_millis(200));

    let err = h.service.send("Hello").await.unwrap_err();
    assert!(err.is_timeout());

    // The half-streamed placeholder is gone; only the user message remains.
    let messages = h.service.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello");

    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, UiEvent::Error { .. })));
}

#[tokio::test]
async fn message_stranded_without_thread_is_adopted_and_replayed() {
    let state = Shared::default();
    {
        let mut s = state.lock().unwrap();
        s.sse_body = sse(&[r#"{"content":"ok"}"#, "[DONE]"]);
        // Exactly the first send's three attempts fail.
        s.fail_thread_creates = 3;
    }
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    let err = h.service.send("Hello").await.unwrap_err();
    assert!(matches!(err, AppError::ThreadCreateFailed { .. }));

    let pending = h.backups.find(PENDING_THREAD_KEY).await.unwrap().unwrap();
    assert_eq!(pending.entries.len(), 1);
    assert_eq!(pending.entries[0].message.content, "Hello");
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, UiEvent::MessageBackedUp { .. })));

    // The next send gets a thread and adopts the stranded message.
    h.service.send("again").await.unwrap();
    let thread_id = h.service.thread_id().unwrap().to_string();

    assert!(h.backups.find(PENDING_THREAD_KEY).await.unwrap().is_none());
    let adopted = h.backups.find(&thread_id).await.unwrap().unwrap();
    assert_eq!(adopted.entries[0].message.content, "Hello");

    h.persistence.replay_backups().await.unwrap();
    assert!(h.backups.find(&thread_id).await.unwrap().is_none());

    let s = state.lock().unwrap();
    assert!(s.messages[&thread_id].iter().any(|r| r["content"] == "Hello"));
}

#[tokio::test]
async fn user_message_outlives_failed_persist_via_backup() {
    let state = Shared::default();
    state.lock().unwrap().sse_body = sse(&[r#"{"content":"ok"}"#, "[DONE]"]);
    let base = spawn_mock(state.clone()).await;
    let mut h = harness(&base).await;

    // All POSTs fail: the user message write and the final assistant write
    // both demote to backup records.
    state.lock().unwrap().fail_posts = 1000;

    h.service.send("Hello").await.unwrap();
    let thread_id = h.service.thread_id().unwrap().to_string();

    let record = h.backups.find(&thread_id).await.unwrap().unwrap();
    assert_eq!(record.entries.len(), 2);
    assert_eq!(record.entries[0].message.content, "Hello");
    assert_eq!(record.entries[1].message.content, "ok");

    state.lock().unwrap().fail_posts = 0;
    h.persistence.replay_backups().await.unwrap();

    let s = state.lock().unwrap();
    let rows = &s.messages[&thread_id];
    assert!(rows.iter().any(|r| r["content"] == "Hello"));
    assert!(rows.iter().any(|r| r["content"] == "ok"));
}
