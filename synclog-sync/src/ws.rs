//! WebSocket links to a relay. Every binary message carries exactly one
//! [`SyncFrame`], so no length prefix is needed.

use crate::protocol::SyncFrame;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials a relay's WebSocket endpoint, sending the given headers with the
/// upgrade request.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Adds a header to every upgrade request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connect(&self) -> io::Result<WsStream> {
        let mut request = self.url.as_str().into_client_request().map_err(ws_to_io_err)?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(invalid_input)?;
            let value = HeaderValue::from_str(value).map_err(invalid_input)?;
            request.headers_mut().insert(name, value);
        }
        let (stream, response) = connect_async(request).await.map_err(ws_to_io_err)?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");
        Ok(stream)
    }
}

/// Reads the next frame. Returns `None` once the peer closes.
pub(crate) async fn read_frame(
    stream: &mut SplitStream<WsStream>,
) -> io::Result<Option<SyncFrame>> {
    loop {
        match stream.next().await {
            None | Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Binary(bytes))) => {
                return SyncFrame::decode(&bytes)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
            }
            Some(Ok(other)) => trace!(?other, "skipping non-binary websocket message"),
            Some(Err(e)) => return Err(ws_to_io_err(e)),
        }
    }
}

/// Sends one frame as a binary message.
pub(crate) async fn write_frame(
    sink: &mut SplitSink<WsStream, Message>,
    frame: &SyncFrame,
) -> io::Result<()> {
    let data = frame
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    sink.send(Message::binary(data)).await.map_err(ws_to_io_err)
}

fn ws_to_io_err(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

fn invalid_input(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}
