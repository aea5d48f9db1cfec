use tracing_subscriber::EnvFilter;

mod advisor;
mod app;
mod broadcast;
mod channel;
mod engine;
mod error;
mod presence;
mod prompting;
mod store;
mod types;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    app::run().await;
}
