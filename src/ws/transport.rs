//! The transport seam between the connection task and the network.
//!
//! The connection task only ever talks to a [`Transport`]: text frames out,
//! [`TransportEvent`]s in. The default implementation sits on
//! `tokio-tungstenite`; tests plug in a channel-backed mock.

use crate::error::Result;
use async_trait::async_trait;
use url::Url;

/// What a transport reports back to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the server.
    Frame(String),
    /// The connection closed. A drop without a close frame reports 1006.
    Closed { code: u16, reason: String },
    /// The connection failed while open.
    Error(String),
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Performs the handshake. Fails with [`Error::Unauthorized`] when the
    /// server refuses the credential, [`Error::Transport`] otherwise.
    ///
    /// [`Error::Unauthorized`]: crate::Error::Unauthorized
    /// [`Error::Transport`]: crate::Error::Transport
    async fn connect(&self, url: &Url) -> Result<Self::Transport>;
}

/// An open, message-oriented connection.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Waits for the next event. Must be cancel-safe: the connection task
    /// polls it inside `select!`.
    async fn next_event(&mut self) -> TransportEvent;

    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

#[cfg(feature = "tungstenite")]
pub use self::tungstenite::{TungsteniteConnector, TungsteniteTransport};

#[cfg(feature = "tungstenite")]
mod tungstenite {
    use super::{Connector, Transport, TransportEvent};
    use crate::error::{Error, Result};
    use crate::ws::types::ABNORMAL_CLOSURE;
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tracing::{debug, trace};
    use url::Url;

    /// Connects with `tokio_tungstenite::connect_async`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TungsteniteConnector;

    #[async_trait]
    impl Connector for TungsteniteConnector {
        type Transport = TungsteniteTransport;

        async fn connect(&self, url: &Url) -> Result<TungsteniteTransport> {
            let request = url
                .as_str()
                .into_client_request()
                .map_err(|e| Error::Transport(e.to_string()))?;

            match connect_async(request).await {
                Ok((stream, response)) => {
                    debug!(status = %response.status(), "WebSocket handshake complete");
                    Ok(TungsteniteTransport { stream })
                }
                Err(WsError::Http(response)) => {
                    let status = response.status();
                    match status.as_u16() {
                        401 | 403 => Err(Error::Unauthorized(format!(
                            "server refused the credential ({status})"
                        ))),
                        _ => Err(Error::Transport(format!("handshake failed ({status})"))),
                    }
                }
                Err(e) => Err(Error::Transport(e.to_string())),
            }
        }
    }

    pub struct TungsteniteTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl std::fmt::Debug for TungsteniteTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TungsteniteTransport").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl Transport for TungsteniteTransport {
        async fn send(&mut self, text: String) -> Result<()> {
            self.stream
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        }

        async fn next_event(&mut self) -> TransportEvent {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return TransportEvent::Frame(text.as_str().to_owned());
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => return TransportEvent::Frame(text),
                        Err(_) => debug!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (ABNORMAL_CLOSURE, String::new()),
                        };
                        return TransportEvent::Closed { code, reason };
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        trace!("Control frame");
                    }
                    Some(Err(e)) => return TransportEvent::Error(e.to_string()),
                    None => {
                        return TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".into(),
                        };
                    }
                }
            }
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            };
            match self.stream.close(Some(frame)).await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(Error::Transport(e.to_string())),
            }
        }
    }
}
