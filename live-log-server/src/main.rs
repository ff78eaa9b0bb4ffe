mod config;
mod registry;
mod routes;

use registry::Registry;
use routes::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("live_log_server=info")),
        )
        .init();

    let cwd = std::env::current_dir().unwrap_or_default();
    let cfg = config::load_config(&cwd);

    let state = AppState {
        registry: Registry::new(cfg.process.log_channel_capacity),
    };
    let app = routes::router(state);

    let addr = format!("{}:{}", cfg.listen.bind, cfg.listen.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    match listener.local_addr() {
        Ok(local_addr) => tracing::info!("live-log-server listening on {local_addr}"),
        Err(_) => tracing::info!("live-log-server listening on {addr}"),
    }

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
