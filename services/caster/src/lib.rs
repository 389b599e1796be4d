pub mod backoff;
pub mod bridge;
pub mod config;
pub mod events;
pub mod filter;
pub mod session;
pub mod state;

pub use bridge::{BridgeError, BridgeRequest, BridgeResponse};
pub use config::{BridgeConfig, CasterConfig, SessionConfig};
pub use events::CasterEvent;
pub use session::{Caster, ReconnectPolicy, SessionError};
pub use state::{ClientStatus, SessionState};
