//! Axum app: router and WebSocket upgrade handler.
//!
//! Plugin HTTP routes are mounted from the bus service registry: a plugin
//! registers an `axum::Router` under `http_router:<prefix>` (and announces it
//! with a `core.register_router` event), and [`router`] nests every such
//! entry when the app is built. Plugins never hold a reference to the app.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};

use super::connection::handle_socket;
use super::state::GatewayState;

/// Service-registry prefix for plugin-provided routers.
pub const ROUTER_SERVICE_PREFIX: &str = "http_router:";

pub fn router(state: Arc<GatewayState>) -> Router {
    let mut app = Router::new()
        .route("/lumina/gateway/ws", get(ws_handler))
        .with_state(Arc::clone(&state));

    for name in state.bus().list_services() {
        let Some(prefix) = name.strip_prefix(ROUTER_SERVICE_PREFIX) else {
            continue;
        };
        match state.bus().service_of::<Router>(&name) {
            Some(plugin_router) => {
                app = app.nest(prefix, (*plugin_router).clone());
                tracing::info!(prefix, "mounted plugin router");
            }
            None => {
                tracing::warn!(service = %name, "router service has unexpected type; not mounted");
            }
        }
    }
    app
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Binds and serves the gateway until the task is dropped.
pub async fn serve(state: Arc<GatewayState>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "gateway listening");
    axum::serve(listener, router(state)).await
}
