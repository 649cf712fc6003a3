// packages/telemetry/src/live/connection.rs
//! Duplex push connections
//!
//! Frames are newline-delimited JSON over a TCP stream. The channel only
//! sees the [`PushConnector`]/[`PushConnection`] pair, so tests can script
//! connects, drops and inbound traffic.
//!
//! A bad frame (oversized, or not UTF-8) is surfaced as
//! [`InboundFrame::Malformed`] and the stream carries on with the next line.
//! Only socket errors end a connection.

use crate::utils::errors::{Result, TelemetryError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder, Framed};
use tracing::debug;

/// Longest accepted inbound frame
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// One inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),

    /// Line that could not be decoded; carries the reason
    Malformed(String),
}

/// Newline framing that reports undecodable lines instead of failing
#[derive(Debug)]
pub struct FrameCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
        }
    }

    fn classify(
        &self,
        decoded: std::result::Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> io::Result<Option<InboundFrame>> {
        match decoded {
            Ok(Some(chunk)) => Ok(Some(text_frame(chunk))),
            Ok(None) => Ok(None),
            // The inner codec skips the rest of the line on the next call.
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(InboundFrame::Malformed(
                format!("frame longer than {} bytes", self.max_length),
            ))),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

fn text_frame(chunk: Bytes) -> InboundFrame {
    let line = chunk.strip_suffix(b"\r").unwrap_or(&chunk[..]);
    match std::str::from_utf8(line) {
        Ok(text) => InboundFrame::Text(text.to_string()),
        Err(e) => InboundFrame::Malformed(format!("invalid UTF-8: {}", e)),
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundFrame>> {
        let decoded = self.inner.decode(buf);
        self.classify(decoded)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundFrame>> {
        let decoded = self.inner.decode_eof(buf);
        self.classify(decoded)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: String, dst: &mut BytesMut) -> io::Result<()> {
        self.inner.encode(frame, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        })
    }
}

/// Opens connections to the push endpoint
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>>;
}

/// One established duplex connection
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound frame; `None` once the peer has closed.
    ///
    /// `Some(Err(_))` means the connection itself failed.
    async fn recv(&mut self) -> Option<Result<InboundFrame>>;
}

/// TCP connector speaking newline-delimited JSON
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl PushConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TelemetryError::Timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| TelemetryError::Channel(format!("Connect to {} failed: {}", self.addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TelemetryError::Channel(format!("Socket setup failed: {}", e)))?;

        debug!("Push connection established to {}", self.addr);
        Ok(Box::new(LinesConnection {
            framed: Framed::new(stream, FrameCodec::new(MAX_FRAME_BYTES)),
        }))
    }
}

struct LinesConnection {
    framed: Framed<TcpStream, FrameCodec>,
}

#[async_trait]
impl PushConnection for LinesConnection {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| TelemetryError::Channel(format!("Write failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame>> {
        self.framed
            .next()
            .await
            .map(|frame| frame.map_err(|e| TelemetryError::Channel(format!("Read failed: {}", e))))
    }
}
