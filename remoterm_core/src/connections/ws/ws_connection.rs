use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::connections::errors::ConnectionError;
use crate::connections::transport::{Connection, Connector, Credentials, Endpoint, Inbound};
use crate::protocol::PROTOCOL_VERSION;

/// Handshake header announcing the envelope version this client speaks.
pub const PROTOCOL_HEADER: &str = "x-remoterm-protocol";

/// Opens WebSocket links to the terminal backend.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut request = endpoint.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(PROTOCOL_HEADER, HeaderValue::from(PROTOCOL_VERSION));
        if let Some(token) = &credentials.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                ConnectionError::configuration(format!("token is not a valid header: {e}"))
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        info!("Opening WebSocket to {}", endpoint.url);
        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!("WebSocket handshake answered with {}", response.status());
        Ok(Box::new(WsConnection { stream }))
    }
}

/// One envelope per text frame; pings are WebSocket control frames.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| ConnectionError::protocol(format!("frame is not UTF-8: {e}")))?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, ConnectionError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Frame(text.into_bytes()))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Inbound::Frame(data))),
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket close frame: {:?}", frame);
                    return Ok(None);
                }
                // tungstenite queues the pong itself
                Some(Ok(Message::Ping(data))) => trace!("WS Ping received ({} bytes)", data.len()),
                Some(Ok(Message::Frame(_))) => {}
            }
        }
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
