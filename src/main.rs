use clap::Parser;
use dotenvy::dotenv;
use page_intake::config::IntakeConfig;
use page_intake::infrastructure::storage;
use page_intake::services::authorizer::AllowAllAuthorizer;
use page_intake::services::intake::IntakeService;
use page_intake::services::verdict_sink::TracingVerdictSink;
use page_intake::services::worker::{AnalysisWorker, ExpiryWorker};
use page_intake::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "page_intake=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let run_api = matches!(args.mode.as_str(), "api" | "all");
    let run_workers = matches!(args.mode.as_str(), "worker" | "all");
    if !run_api && !run_workers {
        anyhow::bail!("unknown mode '{}' (expected api, worker or all)", args.mode);
    }

    info!("🚀 Starting page intake [Mode: {}]...", args.mode);

    let config = IntakeConfig::from_env();
    info!(
        "🛡️  Intake Config: Max File={}MB, Session={}MB/{} files, Chunk={}KB, Analysis x{}",
        config.max_file_size / 1024 / 1024,
        config.max_session_bytes / 1024 / 1024,
        config.max_session_files,
        config.chunk_size / 1024,
        config.analysis_concurrency
    );

    let blobs = storage::setup_blob_store(&config).await?;
    let (intake, assembled) = IntakeService::new(
        config.clone(),
        blobs,
        Arc::new(AllowAllAuthorizer),
        Arc::new(TracingVerdictSink),
    );
    let intake = Arc::new(intake);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    if run_workers {
        let analysis = AnalysisWorker::new(intake.clone(), assembled, shutdown_rx.clone());
        handles.push(tokio::spawn(analysis.run()));

        let expiry = ExpiryWorker::new(intake.clone(), shutdown_rx.clone());
        handles.push(tokio::spawn(expiry.run()));
        info!("👷 Analysis and expiry workers initialized.");
    } else {
        // Files are still analyzed when their session is finalized
        drop(assembled);
    }

    if run_api {
        let state = AppState {
            intake: intake.clone(),
            config: config.clone(),
        };

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    info!("🛑 Shutting down intake services...");

    for handle in handles {
        let _ = handle.await;
    }

    info!("👋 Page intake exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("❌ Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
