//! # WebSocket Transport
//!
//! Carries one speech-translation stream per WebSocket connection.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends a JSON `start` frame with the correlation id and config
//! 2. **Audio**: client sends raw audio as binary frames
//! 3. **Half-close**: client sends a JSON `audio_end` frame and keeps reading
//! 4. **Results**: server sends JSON `result` frames and binary synthesized speech
//! 5. **End**: server sends a JSON `end` frame (or closes); `error` frames fail the stream

use crate::error::{AppError, AppResult};
use crate::session::CorrelationId;
use crate::transport::{
    DuplexStream, Inbound, RequestSink, ResponseSource, SpeechTransport, StreamingConfig,
    StreamingRequest, StreamingResponse, TranslationResult,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control messages sent by the client as text frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "start")]
    Start {
        correlation_id: u64,
        config: StreamingConfig,
    },

    /// No more audio follows on this stream
    #[serde(rename = "audio_end")]
    AudioEnd,
}

/// Messages sent by the server as text frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "result")]
    Result { result: TranslationResult },

    /// Sentence completed; carries no data
    #[serde(rename = "sentence_end")]
    SentenceEnd,

    #[serde(rename = "end")]
    End,

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Opens a fresh WebSocket connection for every stream.
pub struct WebSocketTransport {
    uri: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(uri: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl SpeechTransport for WebSocketTransport {
    async fn open_stream(&self, correlation_id: CorrelationId) -> AppResult<DuplexStream> {
        let connect = tokio_tungstenite::connect_async(self.uri.as_str());
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                AppError::StreamEstablishment(format!(
                    "timed out after {}ms connecting to {}",
                    self.connect_timeout.as_millis(),
                    self.uri
                ))
            })?
            .map_err(|e| AppError::StreamEstablishment(format!("{}: {}", self.uri, e)))?;

        info!(correlation_id = %correlation_id, uri = %self.uri, "WebSocket stream opened");

        let (write, read) = socket.split();
        Ok(DuplexStream {
            sink: Box::new(WsRequestSink {
                write,
                correlation_id,
                closed: false,
            }),
            responses: Box::new(WsResponseSource { read, ended: false }),
        })
    }
}

struct WsRequestSink {
    write: SplitSink<WsStream, Message>,
    correlation_id: CorrelationId,
    closed: bool,
}

impl WsRequestSink {
    async fn send_frame(&mut self, message: Message) -> AppResult<()> {
        self.write
            .send(message)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RequestSink for WsRequestSink {
    async fn send(&mut self, request: StreamingRequest) -> AppResult<()> {
        if self.closed {
            return Err(AppError::Transport("send after half-close".to_string()));
        }

        if let Some(config) = request.config {
            let start = ClientFrame::Start {
                correlation_id: self.correlation_id.value(),
                config,
            };
            let text = serde_json::to_string(&start)
                .map_err(|e| AppError::Internal(format!("encoding start frame: {}", e)))?;
            self.send_frame(Message::Text(text)).await?;
        }

        if !request.audio.is_empty() {
            self.send_frame(Message::Binary(request.audio)).await?;
        }

        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let text = serde_json::to_string(&ClientFrame::AudioEnd)
            .map_err(|e| AppError::Internal(format!("encoding audio_end frame: {}", e)))?;
        self.send_frame(Message::Text(text)).await
    }
}

struct WsResponseSource {
    read: SplitStream<WsStream>,
    ended: bool,
}

#[async_trait]
impl ResponseSource for WsResponseSource {
    async fn next(&mut self) -> Option<AppResult<Inbound>> {
        if self.ended {
            return None;
        }

        loop {
            let message = match self.read.next().await {
                None => {
                    self.ended = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.ended = true;
                    return Some(Err(AppError::Transport(e.to_string())));
                }
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => match decode_server_frame(&text) {
                    Ok(ServerFrame::Result { result }) => {
                        return Some(Ok(Inbound::Response(StreamingResponse {
                            result: Some(result),
                            speech: Vec::new(),
                        })));
                    }
                    Ok(ServerFrame::SentenceEnd) => {
                        return Some(Ok(Inbound::Response(StreamingResponse::default())));
                    }
                    Ok(ServerFrame::End) => {
                        self.ended = true;
                        return None;
                    }
                    Ok(ServerFrame::Error { code, message }) => {
                        self.ended = true;
                        return Some(Err(AppError::Transport(format!("{}: {}", code, message))));
                    }
                    Err(e) => return Some(Ok(Inbound::Malformed(e.to_string()))),
                },
                Message::Binary(speech) => {
                    return Some(Ok(Inbound::Response(StreamingResponse {
                        result: None,
                        speech,
                    })));
                }
                Message::Close(frame) => {
                    debug!(?frame, "Server closed the WebSocket");
                    self.ended = true;
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                _ => continue,
            }
        }
    }
}

fn decode_server_frame(text: &str) -> AppResult<ServerFrame> {
    Ok(serde_json::from_str(text)?)
}
