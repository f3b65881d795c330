// WebSocket transport: tokio-tungstenite sessions for the client engine

use super::abstraction::{CloseReason, EventSink, Transport, TransportError, TransportSession};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over `ws://` / `wss://`
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        protocol: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let protocol_header = HeaderValue::from_str(protocol)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol_header);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("WebSocket session {} open", sink.session_id());

        let (writer, mut reader) = stream.split();

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => sink.frame(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => sink.frame(text),
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = match frame {
                            Some(frame) => {
                                CloseReason::from_close_code(u16::from(frame.code), frame.reason)
                            }
                            None => CloseReason::transient("closed without status"),
                        };
                        sink.closed(reason);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        sink.closed(CloseReason::transient(e.to_string()));
                        return;
                    }
                }
            }
            sink.closed(CloseReason::transient("stream ended"));
        });

        Ok(Arc::new(WebSocketSession {
            writer: Mutex::new(writer),
        }))
    }
}

/// Write half of an open WebSocket
struct WebSocketSession {
    writer: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.writer.lock().await.send(Message::Close(Some(frame))).await {
            debug!("Close frame not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WebSocketTransport::new()
            .connect("https://example.com/client", "json.webpubsub.azure.v1", EventSink::new(1, tx))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_session_over_local_server() {
        use crate::transport::abstraction::{CloseKind, SessionEvent};
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |request: &Request, mut response: Response| {
                if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                    response
                        .headers_mut()
                        .insert("Sec-WebSocket-Protocol", protocol.clone());
                }
                Ok::<Response, ErrorResponse>(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"ack","ackId":1,"success":true}"#.to_string()))
                .await
                .unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("Unexpected: {:?}", other),
                }
            };
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Borrowed("bye"),
            }))
            .await
            .unwrap();
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = WebSocketTransport::new()
            .connect(
                &format!("ws://{}/client", addr),
                "json.webpubsub.azure.v1",
                EventSink::new(3, tx),
            )
            .await
            .unwrap();

        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id, 3);
        assert!(matches!(event, SessionEvent::Frame(ref f) if f.contains("\"ack\"")));

        session.send(r#"{"type":"joinGroup","group":"g"}"#.to_string()).await.unwrap();
        assert_eq!(server.await.unwrap(), r#"{"type":"joinGroup","group":"g"}"#);

        match rx.recv().await.unwrap() {
            (3, SessionEvent::Closed(reason)) => {
                assert_eq!(reason.kind, CloseKind::Stop);
                assert_eq!(reason.code, Some(1008));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WebSocketTransport::new()
            .connect(
                &format!("ws://{}/client", addr),
                "json.webpubsub.azure.v1",
                EventSink::new(1, tx),
            )
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
