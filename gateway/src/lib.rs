//! WebSocket gateway: a bidirectional bridge between external clients and
//! the event bus.
//!
//! Inbound packets of the input/control vocabulary are normalized and
//! republished on the bus with source `frontend`; outbound events on the
//! whitelist are forwarded to every open socket. The gateway keeps no
//! per-session state beyond the monotonic session counter that drives
//! interrupt semantics.

mod app;
mod connection;
mod state;

pub use app::{router, serve, ROUTER_SERVICE_PREFIX};
pub use state::GatewayState;
