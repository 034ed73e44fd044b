use clap::Parser;
use parley::auth::{HeaderIdentity, IdentityProvider, RemoteVerifier};
use parley::db::init_db;
use parley::upstream::UpstreamClient;
use parley::{AppState, Args};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "parley=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "parley.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    parley::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let upstream_url = match std::env::var("PARLEY_UPSTREAM_URL") {
        Ok(u) if !u.is_empty() => u,
        _ => {
            eprintln!("Error: PARLEY_UPSTREAM_URL environment variable is missing or empty.");
            eprintln!("Point it at the upstream AI service base URL.");
            std::process::exit(1);
        }
    };

    // The credential stays server-side; streaming turns fail per-request with
    // an explicit error when it is absent.
    let api_key = std::env::var("PARLEY_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        tracing::warn!(
            "PARLEY_API_KEY is not set; turn requests will fail until it is configured."
        );
    }

    let client = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let identity: Arc<dyn IdentityProvider> = match std::env::var("PARLEY_AUTH_URL") {
        Ok(url) if !url.is_empty() => Arc::new(RemoteVerifier::new(client.clone(), url)),
        _ => match &args.trusted_identity_header {
            Some(header) => {
                tracing::warn!(
                    "Trusting identity header '{}'; do not use this outside development.",
                    header
                );
                Arc::new(HeaderIdentity::new(header.clone()))
            }
            None => {
                eprintln!(
                    "Error: no identity provider configured. Set PARLEY_AUTH_URL or pass \
                     --trusted-identity-header for development."
                );
                std::process::exit(1);
            }
        },
    };

    let state = Arc::new(AppState {
        db,
        upstream: UpstreamClient::new(client, upstream_url, api_key),
        identity,
        args: args.clone(),
    });

    let app = parley::routes::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Parley listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
