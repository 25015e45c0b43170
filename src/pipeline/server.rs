use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::ai::{LlmAdapter, LlmBackend};
use super::api::{self, AppState, SharedState};
use super::artifacts::FsArtifactStore;
use super::browser::PlaywrightDriver;
use super::crawler::Crawler;
use super::db::{DbHandle, RunDb};
use super::phase::PhaseController;
use super::progress::ProgressHub;
use super::runner::{PipelineRunner, recover_interrupted_runs, spawn_instance_heartbeat};
use crate::config::{AiBackendKind, Config};

/// Build the full application router: API, progress socket and request tracing.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Construct the LLM backend selected by the `[ai]` table.
pub fn llm_backend(config: &Config) -> Result<LlmBackend> {
    match config.ai.backend {
        AiBackendKind::Claude => backend_for_model(config, config.ai.claude_model.as_deref()),
        AiBackendKind::Ollama => backend_for_model(config, Some(&config.ai.ollama_model)),
    }
}

/// One backend per `ai.fallback_models` entry, in order.
pub fn fallback_backends(config: &Config) -> Result<Vec<LlmBackend>> {
    config
        .ai
        .fallback_models
        .iter()
        .map(|model| backend_for_model(config, Some(model)))
        .collect()
}

fn backend_for_model(config: &Config, model: Option<&str>) -> Result<LlmBackend> {
    match config.ai.backend {
        AiBackendKind::Claude => Ok(LlmBackend::ClaudeCli {
            command: config.ai.claude_cmd.clone(),
            model: model.map(str::to_string),
        }),
        AiBackendKind::Ollama => LlmBackend::ollama(
            &config.ai.ollama_url,
            model.unwrap_or(&config.ai.ollama_model),
            std::time::Duration::from_secs(config.ai.request_timeout_secs),
        ),
    }
}

/// Wire the production executors, artifact store and progress hub around
/// an open database.
pub fn build_runner(config: &Config, db: DbHandle) -> Result<PipelineRunner> {
    let crawler = Crawler::new(std::time::Duration::from_secs(config.timeouts.request_secs))?;
    let browser = PlaywrightDriver::new(
        &config.browser.workspace_dir,
        &config.browser.python_cmd,
        &config.browser.playwright_cmd,
        crawler,
    );
    let ai = LlmAdapter::new(llm_backend(config)?).with_fallbacks(fallback_backends(config)?);
    let artifacts = FsArtifactStore::new(&config.server.artifacts_dir);
    let controller = PhaseController::new(
        Arc::new(browser),
        Arc::new(ai),
        Arc::new(artifacts),
        config.phase_timeouts(),
    );
    Ok(PipelineRunner::new(
        db,
        Arc::new(ProgressHub::new(config.progress.channel_capacity)),
        Arc::new(controller),
        config.runner_settings(),
    ))
}

/// Open the run database as a new instance. Other instances' runs are left
/// alone; only the server sweeps interrupted runs.
pub fn open_database(config: &Config) -> Result<DbHandle> {
    let db = RunDb::new(&config.server.db_path).with_context(|| {
        format!(
            "Failed to open run database at {}",
            config.server.db_path.display()
        )
    })?;
    Ok(DbHandle::new(db))
}

/// Start the HTTP/WebSocket server and serve until Ctrl+C.
pub async fn start_server(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let lease = config.runner_settings().lease;
    recover_interrupted_runs(&*db.lock_sync()?, lease)?;
    let heartbeat = spawn_instance_heartbeat(db.clone(), lease, true);
    let runner = build_runner(config, db)?;
    let state = Arc::new(AppState {
        runner,
        keepalive: config.keepalive(),
    });
    let app = build_router(Arc::clone(&state), config.server.dev);

    let host = if config.server.dev { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %config.server.db_path.display(), "TestForge server listening");
    println!("TestForge running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.runner.shutdown().await;
    heartbeat.abort();
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::{self, FakeAi, FakeBrowser, TestStack, page, request};
    use crate::pipeline::models::{RunMode, RunStatus};
    use crate::pipeline::ws::Keepalive;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_router(dev: bool) -> Router {
        let stack = TestStack::new(FakeBrowser::default(), FakeAi::default());
        let state = Arc::new(AppState {
            runner: stack.runner,
            keepalive: Keepalive::default(),
        });
        build_router(state, dev)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router(false).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let req = Request::builder().uri("/api/runs").body(Body::empty()).unwrap();
        let resp = test_router(true).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_progress_socket_unknown_run_is_404() {
        let req = Request::builder()
            .uri(format!("/api/runs/{}/progress", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = test_router(false).oneshot(req).await.unwrap();
        // Without upgrade headers the extractor rejects first; either way no socket.
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_llm_backend_selection() {
        let mut config = Config::default();
        assert!(matches!(
            llm_backend(&config).unwrap(),
            LlmBackend::ClaudeCli { .. }
        ));
        config.ai.backend = AiBackendKind::Ollama;
        let backend = llm_backend(&config).unwrap();
        assert_eq!(backend.model_name(), config.ai.ollama_model);
    }

    #[test]
    fn test_fallback_backends_follow_primary_kind() {
        let mut config = Config::default();
        assert!(fallback_backends(&config).unwrap().is_empty());

        config.ai.fallback_models = vec!["llama3.2:latest".into(), "mistral:latest".into()];
        let claude = fallback_backends(&config).unwrap();
        assert!(matches!(
            &claude[0],
            LlmBackend::ClaudeCli { model: Some(m), .. } if m == "llama3.2:latest"
        ));

        config.ai.backend = AiBackendKind::Ollama;
        let adapter = LlmAdapter::new(llm_backend(&config).unwrap())
            .with_fallbacks(fallback_backends(&config).unwrap());
        assert_eq!(
            adapter.models(),
            vec![config.ai.ollama_model.clone(), "llama3.2:latest".into(), "mistral:latest".into()]
        );
    }

    #[tokio::test]
    async fn test_open_database_leaves_live_runs_alone() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.server.db_path = dir.path().join("nested").join("runs.db");

        let stack = TestStack::on_database(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_delay(std::time::Duration::from_millis(200)),
            FakeAi::default(),
            RunDb::new(&config.server.db_path).unwrap(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // A second process opening the same file, then a server-style sweep.
        let second = open_database(&config).unwrap();
        let lease = config.runner_settings().lease;
        let swept = recover_interrupted_runs(&second.lock_sync().unwrap(), lease).unwrap();
        assert_eq!(swept, 0);

        let run = stack.runner.wait(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_startup_sweep_fails_orphaned_runs() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.server.db_path = dir.path().join("nested").join("runs.db");
        {
            let db = RunDb::new(&config.server.db_path).unwrap();
            db.create_run(&fakes::config(RunMode::Ai)).unwrap();
        }
        let handle = open_database(&config).unwrap();
        let lease = config.runner_settings().lease;
        assert_eq!(
            recover_interrupted_runs(&handle.lock_sync().unwrap(), lease).unwrap(),
            1
        );
        let runs = handle.call(|db| db.list_runs(10)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    mod progress_socket {
        use super::*;
        use crate::pipeline::ws::{KEEPALIVE_REPLY, ProgressFrame, WsMessage};
        use futures_util::{SinkExt, StreamExt};
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::Message;
        use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

        type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

        async fn serve(state: SharedState) -> std::net::SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = build_router(state, false);
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            addr
        }

        async fn next_frame(socket: &mut Client) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .expect("progress socket stalled")
                .map(|frame| frame.unwrap())
        }

        fn update(text: &str) -> WsMessage {
            match ProgressFrame::parse(text) {
                ProgressFrame::Update(msg) => *msg,
                ProgressFrame::Keepalive => panic!("expected a progress update, got {:?}", text),
            }
        }

        #[tokio::test]
        async fn test_socket_streams_run_until_finished() {
            let stack = TestStack::new(
                FakeBrowser::default()
                    .with_pages(vec![page("https://example.com/")])
                    .with_delay(Duration::from_millis(400)),
                FakeAi::default(),
            );
            let state = Arc::new(AppState {
                runner: stack.runner,
                keepalive: Keepalive::default(),
            });
            let run = state.runner.start(&request("ai", None)).await.unwrap();
            let addr = serve(Arc::clone(&state)).await;

            let (mut socket, _) = connect_async(format!("ws://{}/api/runs/{}/progress", addr, run.id))
                .await
                .unwrap();

            let Some(Message::Text(first)) = next_frame(&mut socket).await else {
                panic!("expected a text snapshot first");
            };
            assert!(matches!(update(&first), WsMessage::Snapshot { run: ref r } if r.id == run.id));

            socket.send(Message::Text("hello".into())).await.unwrap();
            socket.send(Message::Text("ping".into())).await.unwrap();

            let mut replies = 0;
            let mut finished = None;
            let mut closed = false;
            while let Some(frame) = next_frame(&mut socket).await {
                match frame {
                    Message::Text(text) if text == KEEPALIVE_REPLY => replies += 1,
                    Message::Text(text) => {
                        assert!(finished.is_none(), "update after run_finished: {}", text);
                        if let WsMessage::RunFinished { run } = update(&text) {
                            finished = Some(run);
                        }
                    }
                    Message::Close(_) => {
                        closed = true;
                        break;
                    }
                    _ => {}
                }
            }

            // Only "ping" is answered; other text is ignored.
            assert_eq!(replies, 1);
            let finished = finished.expect("run_finished frame");
            assert_eq!(finished.status, RunStatus::Completed);
            assert_eq!(finished.progress, 100);
            assert!(closed);
        }

        #[tokio::test]
        async fn test_socket_for_finished_run_sends_snapshot_then_closes() {
            let stack = TestStack::new(
                FakeBrowser::default().with_pages(vec![page("https://example.com/")]),
                FakeAi::default(),
            );
            let state = Arc::new(AppState {
                runner: stack.runner,
                keepalive: Keepalive::default(),
            });
            let run = state.runner.start(&request("ai", None)).await.unwrap();
            state.runner.wait(run.id).await.unwrap();
            let addr = serve(Arc::clone(&state)).await;

            let (mut socket, _) = connect_async(format!("ws://{}/api/runs/{}/progress", addr, run.id))
                .await
                .unwrap();
            let Some(Message::Text(first)) = next_frame(&mut socket).await else {
                panic!("expected a text snapshot first");
            };
            assert!(matches!(
                update(&first),
                WsMessage::Snapshot { run: ref r } if r.status == RunStatus::Completed
            ));
            assert!(matches!(next_frame(&mut socket).await, Some(Message::Close(_)) | None));
        }
    }
}
