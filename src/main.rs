// src/main.rs
use kv_poll_backend::{config::Config, start_server};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        eprintln!("No .env file found, using environment variables");
    }

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load()?;
    start_server(config).await
}
