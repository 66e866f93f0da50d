pub use app_error::{AppError, AppResult, FrameField};
pub use config::{CodecConfig, DialConfig, NetworkConfig, ProbeConfig, WireConfig};
pub use scope::{CancelScope, ScopeReason};
pub use server::Server;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod scope;
mod server;
mod tracing_config;
