//! # PAGI Realtime - Voice Session Orchestration
//!
//! Drives one realtime speech conversation with a remote model: microphone
//! frames go out, streamed assistant audio comes back and is played, the user
//! can barge in at any time, and tool calls from the model are dispatched to
//! local handlers whose results are fed back into the conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Session Controller                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │  Capture In  │ → │    Inbox     │ ← │    Transport     │   │
//! │  │ (cpal/mock)  │   │ (one queue)  │   │ (websocket/mock) │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘   │
//! │                            ↓                    ↑             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ Playback Out │ ← │ Conversation │ → │  Tool Registry   │   │
//! │  │ (track cuts) │   │ + Event Log  │   │ (spawned calls)  │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod conversation;
#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
pub mod error;
pub mod event_log;
pub mod mock;
pub mod playback;
pub mod session;
pub mod tools;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use audio::{AudioFormat, AudioFrame};
pub use capture::{AudioCaptureChannel, CaptureDevice, CaptureStatus};
pub use config::RealtimeSettings;
pub use conversation::{
    ConversationItem, ConversationStore, DeltaOutcome, ItemDelta, ItemKind, ItemRole, ItemStatus, TextPatch,
};
#[cfg(feature = "cpal-backend")]
pub use cpal_backend::{CpalCapture, CpalPlayback};
pub use error::{RealtimeError, RealtimeResult};
pub use event_log::{EventLog, EventSource, LogEntry, RealtimeEvent};
pub use playback::{AudioPlaybackChannel, PlaybackDevice, PlaybackSource, PlaybackState, TrackOffset};
pub use session::{
    CaptureState, ConnectionState, ControllerOptions, SessionConfig, SessionController, SessionHandle,
    SessionSnapshot, TurnDetection,
};
pub use tools::{FieldType, ParamSchema, ToolDefinition, ToolHandler, ToolOutput, ToolRegistry};
pub use transport::{ContentPart, EventSink, RealtimeTransport, TransportEvent};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
