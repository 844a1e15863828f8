//! Realtime JSON event protocol over a websocket.
//!
//! Outbound requests are serialized to protocol events and written directly.
//! A reader task parses inbound events, translates the ones the session acts
//! on, and forwards everything to the [`EventSink`].

use crate::audio::{pcm16_to_le_bytes, samples_to_ms};
use crate::config::RealtimeSettings;
use crate::conversation::{ItemDelta, ItemKind, ItemRole, ItemStatus, TextPatch};
use crate::error::{RealtimeError, RealtimeResult};
use crate::session::{SessionConfig, TurnDetection};
use crate::transport::{ContentPart, EventSink, RealtimeTransport, TransportEvent};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketTransport {
    url: String,
    api_key: String,
    sample_rate: u32,
    writer: Option<WsWriter>,
    reader: Option<JoinHandle<()>>,
    turn_detection: TurnDetection,
    /// Audio appended since the last commit
    input_pending: bool,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            sample_rate,
            writer: None,
            reader: None,
            turn_detection: TurnDetection::Manual,
            input_pending: false,
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> RealtimeResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| RealtimeError::Config("no API key configured (set OPENAI_API_KEY)".to_string()))?;
        Ok(Self::new(settings.websocket_url(), api_key, settings.sample_rate))
    }

    async fn send_event(&mut self, event: Value) -> RealtimeResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RealtimeError::Connection("websocket is not connected".to_string()))?;
        writer
            .send(Message::Text(event.to_string()))
            .await
            .map_err(|e| RealtimeError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&mut self, events: EventSink) -> RealtimeResult<()> {
        if self.writer.is_some() {
            return Err(RealtimeError::Connection("websocket already connected".to_string()));
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| RealtimeError::Config(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        info!(url = %self.url, "🌐 Opening realtime websocket");
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        let (writer, mut reader) = stream.split();

        self.writer = Some(writer);
        self.input_pending = false;
        self.reader = Some(tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let event: Value = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("Unparseable server event: {}", e);
                                continue;
                            }
                        };
                        for translated in translate_server_event(&event) {
                            if events.emit(translated).await.is_err() {
                                debug!("Session gone, stopping websocket reader");
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        let _ = events.emit(TransportEvent::Closed { reason }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events
                            .emit(TransportEvent::Closed {
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = events
                .emit(TransportEvent::Closed {
                    reason: "stream ended".to_string(),
                })
                .await;
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> RealtimeResult<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!("Close frame not sent: {}", e);
            }
            let _ = writer.close().await;
            info!("🌐 Realtime websocket closed");
        }
        self.input_pending = false;
        Ok(())
    }

    async fn update_session(&mut self, config: &SessionConfig, tools: &[Value]) -> RealtimeResult<()> {
        self.turn_detection = config.turn_detection;
        self.send_event(session_update_event(config, tools)).await
    }

    async fn send_user_message_content(&mut self, parts: &[ContentPart]) -> RealtimeResult<()> {
        let content: Vec<Value> = parts
            .iter()
            .map(|part| match part {
                ContentPart::InputText(text) => json!({ "type": "input_text", "text": text }),
                ContentPart::InputAudio(samples) => json!({
                    "type": "input_audio",
                    "audio": BASE64.encode(pcm16_to_le_bytes(samples)),
                }),
            })
            .collect();
        self.send_event(json!({
            "type": "conversation.item.create",
            "item": { "type": "message", "role": "user", "content": content },
        }))
        .await
    }

    async fn append_input_audio(&mut self, samples: &[i16]) -> RealtimeResult<()> {
        self.send_event(json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(pcm16_to_le_bytes(samples)),
        }))
        .await?;
        self.input_pending = true;
        Ok(())
    }

    async fn create_response(&mut self) -> RealtimeResult<()> {
        if self.turn_detection == TurnDetection::Manual && self.input_pending {
            self.send_event(json!({ "type": "input_audio_buffer.commit" }))
                .await?;
            self.input_pending = false;
        }
        self.send_event(json!({ "type": "response.create" })).await
    }

    async fn cancel_response(&mut self, track_id: &str, sample_offset: u64) -> RealtimeResult<()> {
        self.send_event(json!({ "type": "response.cancel" })).await?;
        self.send_event(json!({
            "type": "conversation.item.truncate",
            "item_id": track_id,
            "content_index": 0,
            "audio_end_ms": samples_to_ms(sample_offset, self.sample_rate),
        }))
        .await
    }

    async fn delete_item(&mut self, item_id: &str) -> RealtimeResult<()> {
        self.send_event(json!({ "type": "conversation.item.delete", "item_id": item_id }))
            .await
    }

    async fn send_function_call_output(&mut self, call_id: &str, output: &str) -> RealtimeResult<()> {
        self.send_event(json!({
            "type": "conversation.item.create",
            "item": { "type": "function_call_output", "call_id": call_id, "output": output },
        }))
        .await
    }
}

/// `session.update` event for `config` and the registered tool schemas.
pub fn session_update_event(config: &SessionConfig, tools: &[Value]) -> Value {
    let turn_detection = match config.turn_detection {
        TurnDetection::Manual => Value::Null,
        TurnDetection::ServerVad => json!({ "type": "server_vad" }),
    };
    let transcription = config
        .transcription_model
        .as_ref()
        .map(|model| json!({ "model": model }))
        .unwrap_or(Value::Null);
    let tool_choice = if tools.is_empty() { "none" } else { "auto" };

    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": config.instructions,
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": transcription,
            "turn_detection": turn_detection,
            "tools": tools,
            "tool_choice": tool_choice,
        },
    })
}

/// Translate one server event. The raw event always comes first so it is
/// logged before any state change it causes.
pub fn translate_server_event(event: &Value) -> Vec<TransportEvent> {
    let mut out = vec![TransportEvent::Protocol(event.clone())];
    let kind = event["type"].as_str().unwrap_or_default();
    let item_id = || event["item_id"].as_str().map(String::from);

    match kind {
        "error" => out.push(TransportEvent::Error(event["error"].clone())),
        "conversation.item.created" | "response.output_item.done" => {
            if let Some((item_id, delta)) = item_delta(&event["item"]) {
                out.push(TransportEvent::ItemUpdated { item_id, delta });
            }
        }
        "response.audio.delta" | "response.output_audio.delta" => {
            let Some(item_id) = item_id() else {
                return out;
            };
            match BASE64.decode(event["delta"].as_str().unwrap_or_default()) {
                Ok(bytes) => out.push(TransportEvent::ItemUpdated {
                    item_id,
                    delta: ItemDelta::audio(bytes),
                }),
                Err(e) => warn!(%item_id, "Undecodable audio delta: {}", e),
            }
        }
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            if let (Some(item_id), Some(fragment)) = (item_id(), event["delta"].as_str()) {
                out.push(TransportEvent::ItemUpdated {
                    item_id,
                    delta: ItemDelta::transcript(fragment),
                });
            }
        }
        "response.text.delta" | "response.output_text.delta" => {
            if let (Some(item_id), Some(fragment)) = (item_id(), event["delta"].as_str()) {
                out.push(TransportEvent::ItemUpdated {
                    item_id,
                    delta: ItemDelta {
                        text: Some(TextPatch::Append(fragment.to_string())),
                        ..Default::default()
                    },
                });
            }
        }
        "response.function_call_arguments.delta" => {
            if let (Some(item_id), Some(fragment)) = (item_id(), event["delta"].as_str()) {
                out.push(TransportEvent::ItemUpdated {
                    item_id,
                    delta: ItemDelta {
                        arguments: Some(TextPatch::Append(fragment.to_string())),
                        ..Default::default()
                    },
                });
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let (Some(item_id), Some(transcript)) = (item_id(), event["transcript"].as_str()) {
                out.push(TransportEvent::ItemUpdated {
                    item_id,
                    delta: ItemDelta {
                        transcript: Some(TextPatch::Replace(transcript.to_string())),
                        ..Default::default()
                    },
                });
            }
        }
        "conversation.item.deleted" => {
            if let Some(item_id) = item_id() {
                out.push(TransportEvent::ItemDeleted { item_id });
            }
        }
        "input_audio_buffer.speech_started" => out.push(TransportEvent::SpeechStarted),
        _ => {}
    }
    out
}

/// Delta carrying everything a full item object says about itself.
fn item_delta(item: &Value) -> Option<(String, ItemDelta)> {
    let id = item["id"].as_str()?.to_string();
    let kind = match item["type"].as_str() {
        Some("message") => Some(ItemKind::Message),
        Some("function_call") => Some(ItemKind::FunctionCall),
        Some("function_call_output") => Some(ItemKind::FunctionCallOutput),
        _ => None,
    };
    let role = match (item["role"].as_str(), kind) {
        (Some("user"), _) => Some(ItemRole::User),
        (Some("assistant"), _) => Some(ItemRole::Assistant),
        (Some("system"), _) => Some(ItemRole::System),
        (_, Some(ItemKind::FunctionCall)) => Some(ItemRole::Assistant),
        (_, Some(ItemKind::FunctionCallOutput)) => Some(ItemRole::Tool),
        _ => None,
    };
    let status = match item["status"].as_str() {
        Some("completed") | Some("incomplete") => Some(ItemStatus::Completed),
        Some("in_progress") => Some(ItemStatus::InProgress),
        _ => None,
    };

    let mut delta = ItemDelta {
        role,
        kind,
        status,
        call_id: item["call_id"].as_str().map(String::from),
        name: item["name"].as_str().map(String::from),
        arguments: item["arguments"]
            .as_str()
            .filter(|args| !args.is_empty())
            .map(|args| TextPatch::Replace(args.to_string())),
        output: item["output"].as_str().map(String::from),
        ..Default::default()
    };

    for part in item["content"].as_array().into_iter().flatten() {
        match part["type"].as_str() {
            Some("text") | Some("input_text") | Some("output_text") => {
                if let Some(text) = part["text"].as_str() {
                    delta.text = Some(TextPatch::Replace(text.to_string()));
                }
            }
            Some("audio") | Some("input_audio") | Some("output_audio") => {
                if let Some(transcript) = part["transcript"].as_str() {
                    delta.transcript = Some(TextPatch::Replace(transcript.to_string()));
                }
            }
            _ => {}
        }
    }
    Some((id, delta))
}
