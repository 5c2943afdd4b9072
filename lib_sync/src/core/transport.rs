//! # Push Transport Seam
//!
//! The connection manager never touches a socket type directly. It asks a
//! [`Connector`] for a fresh stream of [`Inbound`] messages on every
//! (re)connect attempt. [`WsConnector`] is the production implementation over
//! tokio-tungstenite; tests plug in channel-backed connectors.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// One message as delivered by the transport, stripped of socket details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Ping/pong or any other keep-alive; only refreshes the inactivity watchdog.
    Heartbeat,
    /// The remote side closed the connection.
    Close,
}

pub type InboundStream = BoxStream<'static, Result<Inbound, TransportError>>;

/// Opens one physical connection per call.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>>;

    /// Human-readable endpoint for log lines.
    fn describe(&self) -> String {
        "push transport".to_string()
    }
}

#[cfg(feature = "ws")]
pub use ws::WsConnector;

#[cfg(feature = "ws")]
mod ws {
    use futures_util::future::BoxFuture;
    use futures_util::StreamExt;
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

    use super::{Connector, Inbound, InboundStream, TransportError};

    /// WebSocket connector. Text and binary messages are forwarded as-is;
    /// tungstenite answers pings on its own while the stream is polled.
    #[derive(Debug, Clone)]
    pub struct WsConnector {
        url: String,
    }

    impl WsConnector {
        pub fn new(url: impl Into<String>) -> Self {
            Self { url: url.into() }
        }
    }

    impl Connector for WsConnector {
        fn connect(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
            Box::pin(async move {
                let (ws_stream, _response) = connect_async(self.url.as_str())
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;

                let inbound = ws_stream.map(|msg| match msg {
                    Ok(Message::Text(text)) => Ok(Inbound::Text(text.to_string())),
                    Ok(Message::Binary(bin)) => Ok(Inbound::Binary(bin.to_vec())),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Ok(Inbound::Heartbeat),
                    Ok(Message::Close(_)) => Ok(Inbound::Close),
                    Err(e) => Err(TransportError::Read(e.to_string())),
                });
                Ok(inbound.boxed())
            })
        }

        fn describe(&self) -> String {
            self.url.clone()
        }
    }
}
