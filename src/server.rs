//! Hyper 0.14 control surface, bound to `127.0.0.1:<server.port>`.
//!
//! Same `make_service_fn`/`service_fn` shape the teacher used for its
//! Prometheus scrape endpoint in `main.rs`, generalized from one hardcoded
//! handler into `routes::dispatch` over the full route table.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tracing::info;

use crate::app::AppState;
use crate::routes;

pub async fn run(state: Arc<AppState>) -> Result<(), hyper::Error> {
    let port = state.config.get_u64("server.port") as u16;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { routes::dispatch(req, state).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "control surface listening");
    server.await
}
