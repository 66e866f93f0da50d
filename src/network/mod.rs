//! Network Module Implementation
//!
//! Connection level building blocks on top of tokio byte streams.
//!
//! # Components
//!
//! - `Connection`: a TCP stream speaking TLV messages, with deadlines
//! - `TlvCodec`: the same framing as a `tokio_util` codec for `Framed`
//! - `LivenessProbe`: periodic `ping` writes with a resettable timer
//! - `FanOut`: races connection attempts and keeps the first success
//! - `ChannelWriter`: lets several tasks share one socket writer

pub use channel_writer::{channel_writer, ChannelWriter};
pub use connection::Connection;
pub use fanout::{Dialer, FanOut, FanOutReport, TcpDialer, Winner};
pub use frame::TlvCodec;
pub use probe::{LivenessProbe, ProbeTimer, DEFAULT_PROBE_INTERVAL, PING};

mod channel_writer;
mod connection;
mod fanout;
mod frame;
mod probe;
