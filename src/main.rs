//! # Voice Relay Backend - Main Application Entry Point
//!
//! Real-time multi-party voice/text relay. Participants join rooms over
//! WebSocket, each with their own language preferences; messages are
//! transcribed/translated per recipient and delivered as text plus
//! synthesized audio.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML + environment variables)
//! - **state**: shared state, metrics, and the injected relay services
//! - **relay**: rooms, connections, multiparty sessions, translation fan-out
//! - **audio**: chunk reordering, validation, streaming session lifecycle
//! - **engines**: collaborator traits (STT/translation/TTS/persistence)
//! - **websocket**: per-connection actor speaking the relay protocol
//! - **handlers / health / middleware / error**: the HTTP surface

mod audio;
mod config;
mod engines;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::buffer::ReorderBufferConfig;
use audio::session::StreamingSessionManager;
use config::AppConfig;
use engines::local::{LocalSpeechToText, LocalSynthesizer, LocalTranslator, LogOnlyStore};
use relay::connection::ConnectionRegistry;
use relay::fanout::TranslationFanoutRouter;
use relay::multiparty::MultipartyManager;
use relay::room::RoomRegistry;
use state::{AppMetrics, AppState, RelayServices};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // Construct the relay services once; everything downstream gets handles.
    // The metrics table is shared between the HTTP state and the session
    // manager, which owns the stream-session gauge.
    let metrics = Arc::new(RwLock::new(AppMetrics::default()));
    let services = build_services(&config, Arc::clone(&metrics));
    let app_state = AppState::new(config.clone(), metrics, services.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_idle_sweeper(services, config.relay.sweep_interval_secs);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/rooms", web::get().to(handlers::list_rooms))
                    .route("/rooms/{code}/users", web::get().to(handlers::room_users))
                    .route("/rooms/{code}/leave", web::post().to(handlers::leave_room))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::session_info))
                    .route("/sessions/{id}/join", web::post().to(handlers::join_session))
                    .route("/sessions/{id}/leave", web::post().to(handlers::leave_session))
                    .route(
                        "/sessions/{id}/message",
                        web::post().to(handlers::post_session_message),
                    )
                    .route("/streams", web::get().to(handlers::list_streams))
                    .route("/streams/{id}/end", web::post().to(handlers::end_stream)),
            )
            .route("/ws/{user_id}", web::get().to(websocket::relay_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Wire up the relay's service graph from the configuration.
///
/// The local loopback engines keep the binary runnable with no network
/// access; production deployments swap them for real collaborators behind
/// the same traits.
fn build_services(config: &AppConfig, metrics: Arc<RwLock<AppMetrics>>) -> RelayServices {
    let registry = Arc::new(ConnectionRegistry::new());
    let rooms = Arc::new(RoomRegistry::new());
    let multiparty = Arc::new(MultipartyManager::new(
        config.relay.max_session_participants,
    ));

    let transcriber: Arc<dyn engines::SpeechToText> = Arc::new(LocalSpeechToText);
    let translator: Arc<dyn engines::Translator> = Arc::new(LocalTranslator);
    let synthesizer: Arc<dyn engines::SpeechSynthesizer> =
        Arc::new(LocalSynthesizer::new(config.audio.sample_rate));
    let store: Arc<dyn engines::MessageStore> = Arc::new(LogOnlyStore);

    let router = Arc::new(TranslationFanoutRouter::new(
        translator.clone(),
        synthesizer.clone(),
        store.clone(),
    ));

    let buffer_config = ReorderBufferConfig {
        capacity: config.audio.reorder_capacity,
        vad_threshold: config.audio.vad_threshold,
    };
    let sessions = Arc::new(StreamingSessionManager::new(
        Arc::clone(&rooms),
        Arc::clone(&registry),
        Arc::clone(&router),
        transcriber.clone(),
        translator,
        synthesizer,
        store,
        metrics,
        buffer_config,
        config.relay.idle_timeout_secs,
    ));

    RelayServices {
        registry,
        rooms,
        multiparty,
        sessions,
        router,
        transcriber,
    }
}

/// Background task closing stream sessions that have gone idle.
fn spawn_idle_sweeper(services: RelayServices, sweep_interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval_secs));
        loop {
            interval.tick().await;
            let closed = services.sessions.sweep_idle();
            if !closed.is_empty() {
                info!(count = closed.len(), "idle sweep closed stream sessions");
            }
        }
    });
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` overrides the default filter of
/// `voice_relay_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag; returns once shutdown has been requested.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
