use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use polychat::api::BackendClient;
use polychat::config::Config;
use polychat::db;
use polychat::db::backup_repository::BackupRepository;
use polychat::db::cache_repository::CacheRepository;
use polychat::events::{self, UiEvent};
use polychat::registry;
use polychat::service::chat_service::ChatService;
use polychat::service::persistence::{PersistenceLayer, SWEEP_INTERVAL};
use polychat::service::thread_lifecycle::ThreadLifecycle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polychat=info".into()),
        )
        .init();

    let config = Config::from_env();

    // ── Local storage ─────────────────────────────────────────────────────────
    let pool = db::connect(&config.db_path).await?;
    let cache = CacheRepository::new(pool.clone());
    let backups = BackupRepository::new(pool);

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let api = BackendClient::new(&config.api_base_url, config.api_key.clone());
    let persistence = PersistenceLayer::new(api.clone(), backups);
    let lifecycle = ThreadLifecycle::new(api.clone(), cache.clone());

    let (ui_tx, mut ui_rx) = events::channel();
    persistence.clone().spawn_sweeper(SWEEP_INTERVAL, ui_tx.clone());

    let mut service = ChatService::new(
        api,
        cache,
        persistence,
        lifecycle,
        ui_tx,
        config.plan,
        &config.default_model,
    );

    if let Err(e) = service.resume().await {
        info!("No thread to resume: {e}");
    }

    // Ctrl-C aborts the in-flight stream instead of killing the process.
    let cancel = service.cancel_handle();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            cancel.cancel();
        }
    });

    // ── Event printer ─────────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match event {
                UiEvent::StreamDelta { delta, .. } => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
                UiEvent::AssistantFinished { completion, .. } => {
                    println!();
                    if completion != polychat::models::CompletionState::Complete {
                        println!("[reply {completion:?}]");
                    }
                }
                UiEvent::ThreadReady { thread_id } => {
                    println!("(thread {thread_id})");
                }
                UiEvent::PlanLimit { message } => {
                    println!("! {message} — upgrade your plan to continue");
                }
                UiEvent::Error { message } => println!("! {message}"),
                UiEvent::MessageBackedUp { .. } => {
                    println!("! message saved locally; will retry in the background");
                }
                UiEvent::BackupRecovered { thread_key } => {
                    println!("(recovered unsaved messages for {thread_key})");
                }
                UiEvent::MessageIdAssigned { .. } => {}
            }
        }
    });

    // ── REPL ──────────────────────────────────────────────────────────────────
    println!(
        "polychat — {} ({} plan). /models to list, /model <id> to switch, /new, /quit",
        registry::display_alias(service.model()),
        service.plan()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim().to_string();

        match line.as_str() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                if let Err(e) = service.start_new_thread().await {
                    println!("! {e}");
                }
            }
            "/thread" => {
                let thread = service.thread();
                match thread.id {
                    Some(id) => println!(
                        "thread: {id} \"{}\" ({} messages)",
                        thread.title.as_deref().unwrap_or("untitled"),
                        thread.messages.len()
                    ),
                    None => println!("no active thread"),
                }
            }
            "/models" => {
                for id in registry::models_for_plan(service.plan()) {
                    let mut caps = Vec::new();
                    if registry::supports_web_search(id) {
                        caps.push("web");
                    }
                    if registry::supports_vision(id) {
                        caps.push("vision");
                    }
                    if registry::supports_wiki_grounding(id) {
                        caps.push("wiki");
                    }
                    let marker = if id == service.model() { "*" } else { " " };
                    println!(
                        "{marker} {id} — {} [{}]",
                        registry::display_alias(id),
                        caps.join(", ")
                    );
                }
            }
            other if other.starts_with("/model ") => {
                let id = other.trim_start_matches("/model ").trim();
                match service.set_model(id) {
                    Ok(()) => println!("model: {}", registry::display_alias(id)),
                    Err(e) => println!("! {e}"),
                }
            }
            _ => {
                // Errors already surfaced through the event channel.
                let _ = service.send(&line).await;
            }
        }
    }

    Ok(())
}
