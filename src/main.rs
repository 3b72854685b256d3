//! Process entrypoint: init logging, build `AppState`, run the control
//! surface until the process is killed or `/shutdown` is hit.

use std::sync::Arc;

use loadforge_core::app::AppState;
use loadforge_core::server;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let db_path = std::env::var("LOADFORGE_DB_PATH").unwrap_or_else(|_| "loadforge.db".to_string());

    let state = match AppState::build(&db_path).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize application state");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(state).await {
        tracing::error!(error = %e, "control surface exited with an error");
        std::process::exit(1);
    }
}
