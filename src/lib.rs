pub mod network;
pub mod protocol;
pub mod service;
mod utils;

pub use network::{
    channel_writer, ChannelWriter, Connection, Dialer, FanOut, FanOutReport, LivenessProbe,
    ProbeTimer, TcpDialer, TlvCodec, Winner, DEFAULT_PROBE_INTERVAL, PING,
};
pub use protocol::{Binary, Message, Payload, Text, BINARY_TYPE, MAX_PAYLOAD_SIZE, TEXT_TYPE};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CancelScope, ScopeReason, Server,
    WireConfig,
};
pub use utils::TaskGroup;
