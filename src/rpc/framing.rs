//! Envelope framing over WebSocket messages.
//!
//! Each JSON-RPC envelope travels as one WebSocket text message. Control
//! frames are handled here so the correlator only ever sees envelope text.
//!
//! # Wire Format
//!
//! ```text
//! Text frame   -> one envelope
//! Binary frame -> one envelope, if valid UTF-8
//! Ping/Pong    -> skipped (tungstenite answers pings itself)
//! Close        -> end of stream
//! ```

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{trace, warn};

/// Read the next envelope text from the stream.
///
/// Returns `Ok(None)` once the peer closed the connection.
///
/// # Errors
///
/// Returns the underlying WebSocket error if the read fails.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<String>, WsError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let message = match stream.next().await {
            None => return Ok(None),
            Some(Err(WsError::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(e),
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => return Ok(Some(text)),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => return Ok(Some(text)),
                Err(e) => warn!("Skipping binary frame that is not UTF-8: {}", e),
            },
            Message::Close(frame) => {
                trace!("Received close frame: {:?}", frame);
                return Ok(None);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

/// Write one envelope as a text frame and flush it.
///
/// # Errors
///
/// Returns the underlying WebSocket error if the write or flush fails.
pub async fn write_message<S>(sink: &mut S, body: String) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(body)).await
}
