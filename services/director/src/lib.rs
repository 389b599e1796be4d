pub mod config;
pub mod events;
pub mod history;
pub mod hub;
pub mod registry;
pub mod state;
mod ws;

pub use config::{DirectorConfig, HubConfig};
pub use events::DirectorEvent;
pub use hub::{Director, HubError};
pub use registry::MonitorUpdate;
pub use state::{ClientInfo, DisconnectReason, Lifecycle, ServerStatus};

use axum::Router;
use axum::routing::get;

pub(crate) fn build_router(state: state::HubState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
