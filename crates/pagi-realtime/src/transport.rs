//! Protocol connection boundary.
//!
//! A [`RealtimeTransport`] carries outbound requests to the model service and
//! reports everything it receives through the [`EventSink`] handed to it on
//! `connect`. The sink feeds the session's single inbox, so inbound protocol
//! traffic is serialized with capture frames, tool results and user commands.

use crate::conversation::ItemDelta;
use crate::error::{RealtimeError, RealtimeResult};
use crate::session::{Inbound, SessionConfig};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Events a transport reports to the session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw inbound protocol message; logged as a remote event
    Protocol(Value),
    /// Protocol-level error; logged, the session stays connected
    Error(Value),
    /// A conversation item was created or changed
    ItemUpdated { item_id: String, delta: ItemDelta },
    /// The remote side deleted an item
    ItemDeleted { item_id: String },
    /// Remote voice activity detection heard the user start speaking
    SpeechStarted,
    /// The remote side closed the connection
    Closed { reason: String },
}

/// User message content part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    InputText(String),
    /// Mono PCM16 samples
    InputAudio(Vec<i16>),
}

/// Connection to the remote speech model. Implementations: `WebSocketTransport`, `MockTransport`.
#[async_trait]
pub trait RealtimeTransport: Send {
    /// Open the connection and report inbound traffic to `events` until `disconnect`.
    async fn connect(&mut self, events: EventSink) -> RealtimeResult<()>;

    /// Close the connection. Must be safe to call when not connected.
    async fn disconnect(&mut self) -> RealtimeResult<()>;

    /// Push session configuration together with the tool schemas.
    async fn update_session(&mut self, config: &SessionConfig, tools: &[Value]) -> RealtimeResult<()>;

    async fn send_user_message_content(&mut self, parts: &[ContentPart]) -> RealtimeResult<()>;

    async fn append_input_audio(&mut self, samples: &[i16]) -> RealtimeResult<()>;

    /// Ask the model to respond. In manual turn detection this also closes the user turn.
    async fn create_response(&mut self) -> RealtimeResult<()>;

    /// Cancel the in-flight response and truncate `track_id` at `sample_offset`.
    async fn cancel_response(&mut self, track_id: &str, sample_offset: u64) -> RealtimeResult<()>;

    async fn delete_item(&mut self, item_id: &str) -> RealtimeResult<()>;

    async fn send_function_call_output(&mut self, call_id: &str, output: &str) -> RealtimeResult<()>;
}

/// Where a transport delivers inbound events. Tagged with the session
/// generation it was issued for; events from an older generation are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<Inbound>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<Inbound>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event, waiting for inbox capacity.
    pub async fn emit(&self, event: TransportEvent) -> RealtimeResult<()> {
        self.tx
            .send(Inbound::Transport {
                generation: self.generation,
                event,
            })
            .await
            .map_err(|e| RealtimeError::ChannelSend(e.to_string()))
    }

    /// Deliver an event without waiting; fails when the inbox is full.
    pub fn try_emit(&self, event: TransportEvent) -> RealtimeResult<()> {
        self.tx
            .try_send(Inbound::Transport {
                generation: self.generation,
                event,
            })
            .map_err(|e| RealtimeError::ChannelSend(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
