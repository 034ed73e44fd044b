use crate::auth::IdentityProvider;
use crate::db::DbPool;
use crate::upstream::UpstreamClient;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "parley.db")]
    pub database: String,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Development only: trust this request header as the caller's user id
    /// instead of verifying a session against the auth provider.
    #[arg(long)]
    pub trusted_identity_header: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub upstream: UpstreamClient,
    pub identity: Arc<dyn IdentityProvider>,
    pub args: Arc<Args>,
}
