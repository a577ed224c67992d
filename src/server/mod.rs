//! Authenticated local HTTP API.

mod filters;
pub mod http_layers;
mod media_routes;
#[allow(clippy::module_inception)]
mod server;
pub mod session;
pub mod state;

pub use filters::{media_filter_from_query, normalize_filter_time, normalize_kind_filter_value};
pub use server::{build_router, run_server};
pub use state::ServerState;
