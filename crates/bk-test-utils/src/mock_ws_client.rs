use bk_protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A bare WebSocket client for driving a real hub from tests.
///
/// Unlike the caster's session, this client performs no handshake on its
/// own; tests send exactly the frames they want to exercise.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = envelope.encode()?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send raw text (for malformed-frame tests).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Receive the next protocol envelope, skipping WS control frames.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Envelope::decode(&text)?);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive the next text frame without decoding (control-API payloads).
    pub async fn recv_text(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Wait for the server's close frame, returning `(code, reason)`.
    ///
    /// Protocol envelopes arriving before the close are discarded.
    pub async fn recv_close(&mut self) -> Result<(u16, String), Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(match frame {
                        Some(f) => (f.code.into(), f.reason.to_string()),
                        None => (1005, String::new()),
                    });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended without close frame".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
