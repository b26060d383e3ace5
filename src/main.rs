mod application;
mod config;
mod domain;
mod infrastructure;
mod presentation;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use presentation::{app_router, AppState};

/// Exit code for a fatal configuration problem at startup.
const EXIT_CONFIG_ERROR: i32 = 2;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facebridge=info,warn".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("facebridge - migrate face labels from Windows Photos Legacy to Immich");
        println!("Usage: facebridge [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --config <path>   Path to a facebridge.toml configuration file");
        println!("  --port <port>     Listen port (default 3000, or FACEBRIDGE_PORT)");
        println!("  --help, -h        Show this help message");
        return Ok(());
    }

    let mut config_path: Option<PathBuf> = None;
    let mut port: u16 = std::env::var("FACEBRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    for i in 0..args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            config_path = Some(PathBuf::from(&args[i + 1]));
        }
        if args[i] == "--port" && i + 1 < args.len() {
            match args[i + 1].parse() {
                Ok(p) => port = p,
                Err(_) => {
                    eprintln!("Invalid --port value '{}'", args[i + 1]);
                    std::process::exit(EXIT_CONFIG_ERROR);
                }
            }
        }
    }

    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal configuration error: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let state = AppState::new(config);
    state.connect_configured().await;

    let app = axum::Router::new()
        .nest("/api", app_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("facebridge listening on http://0.0.0.0:{}", port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
