// packages/telemetry/src/live/mod.rs
//! Live event streaming
//!
//! - **Bus**: In-process broadcast of every captured event
//! - **Connection**: Duplex NDJSON connections to the push endpoint
//! - **Channel**: Reconnect state machine and inbound message handlers

pub mod bus;
pub mod channel;
pub mod connection;

pub use bus::EventBus;
pub use channel::{ChannelState, DisconnectReason, LivePushChannel, MessageHandler, ReconnectPolicy};
pub use connection::{FrameCodec, InboundFrame, PushConnection, PushConnector, TcpConnector};
