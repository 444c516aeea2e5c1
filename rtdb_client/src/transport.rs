//! The duplex transport underneath a connection: a `Send`able trait object
//! so the connection actor (spec §3 "connection runtime") can drive either a
//! real WebSocket or, in tests, a plain framed byte stream without knowing
//! the difference. Grounded on the `connect_stream`/`connect`/`connect_tls`
//! split in `examples/Protryon-klickhouse/klickhouse/src/client.rs`, which
//! likewise lets callers supply arbitrary `AsyncRead + AsyncWrite` pairs and
//! reserves a `connect_tls` for rustls.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::MaybeTlsStream;
use url::Url;

use crate::codec::io::{WireRead, WireWrite, DEFAULT_MAX_PAYLOAD};
use crate::error::{Result, TransportError};

/// A single binary message frame exchanged with the server.
#[async_trait]
pub trait Transport: Send {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()>;

    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>>;

    async fn close(&mut self) -> Result<()>;
}

/// Production transport: a WebSocket connection, optionally over TLS.
pub struct WebSocketTransport {
    stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &Url, subprotocol: &str) -> Result<Self> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let header_value = subprotocol
            .parse()
            .map_err(|_| TransportError::ProtocolViolation("invalid subprotocol".into()))?;
        request
            .headers_mut()
            .insert(http::header::SEC_WEBSOCKET_PROTOCOL, header_value);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self { stream })
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        self.stream
            .send(WsMessage::Binary(payload.to_vec()))
            .await
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()).into())
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(TransportError::ProtocolViolation("unexpected text frame".into()).into())
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(e)) => return Err(TransportError::ProtocolViolation(e.to_string()).into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()).into())
    }
}

/// Test/loopback transport: u32-length-prefixed frames over any
/// `AsyncRead + AsyncWrite` pair (e.g. `tokio::io::duplex`), using the same
/// framing primitives as the value codec (`codec::io`).
pub struct FramedTransport<S> {
    stream: S,
    max_payload: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, max_payload: DEFAULT_MAX_PAYLOAD }
    }

    pub fn with_max_payload(stream: S, max_payload: usize) -> Self {
        Self { stream, max_payload }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for FramedTransport<S> {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        let mut header = bytes::BytesMut::with_capacity(4);
        header.write_u32_le(payload.len() as u32);
        self.stream
            .write_all(&header)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        self.stream
            .write_all(&payload)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()).into())
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        let mut len_bytes = [0u8; 4];
        match self.stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(TransportError::Unreachable(e.to_string()).into()),
        }
        let mut cursor = &len_bytes[..];
        let len = cursor.read_u32_le()? as usize;
        if len > self.max_payload {
            return Err(TransportError::ProtocolViolation(format!(
                "frame of {len} bytes exceeds maximum {}",
                self.max_payload
            ))
            .into());
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Some(Bytes::from(payload)))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()).into())
    }
}
