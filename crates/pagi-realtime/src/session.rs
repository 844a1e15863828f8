//! Session controller: one conversation session over one connection.
//!
//! ## Flow
//!
//! ```text
//! transport events ─┐
//! capture frames ───┤                 ┌─> ConversationStore / EventLog
//! tool results ─────┼─> inbox ─> SessionController ─> AudioPlaybackChannel
//! SessionHandle ────┘                 └─> RealtimeTransport (outbound)
//! ```
//!
//! Everything that mutates session state goes through the single inbox and is
//! handled in arrival order by whoever drives the controller (`run`,
//! `process_next` or `process_pending`). Each message carries the generation
//! of the connection it belongs to; a disconnect bumps the generation so late
//! events, frames and tool results from an old connection are discarded.

use crate::audio::{pcm16_from_le_bytes, AudioFormat, AudioFrame};
use crate::capture::{AudioCaptureChannel, CaptureDevice};
use crate::conversation::{
    ConversationItem, ConversationStore, DeltaOutcome, ItemDelta, ItemKind, ItemRole, ToolCallContent,
};
use crate::error::{RealtimeError, RealtimeResult};
use crate::event_log::{EventLog, RealtimeEvent};
use crate::playback::{AudioPlaybackChannel, PlaybackDevice, PlaybackState, TrackOffset};
use crate::tools::{ToolDefinition, ToolOutput, ToolRegistry};
use crate::transport::{ContentPart, EventSink, RealtimeTransport, TransportEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How the end of a user turn is decided
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetection {
    /// Push-to-talk: the user turn ends on `end_manual_capture`
    #[default]
    Manual,
    /// The remote side detects speech start and end
    ServerVad,
}

/// Session configuration pushed to the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub turn_detection: TurnDetection,
    /// Input transcription model; `None` disables user transcripts
    pub transcription_model: Option<String>,
    pub voice: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: "You are a helpful voice assistant. Keep answers short and conversational."
                .to_string(),
            turn_detection: TurnDetection::Manual,
            transcription_model: Some("whisper-1".to_string()),
            voice: "alloy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Construction options for [`SessionController`]
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub format: AudioFormat,
    /// Configuration restored on every disconnect
    pub session: SessionConfig,
    pub inbox_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            session: SessionConfig::default(),
            inbox_capacity: 256,
        }
    }
}

/// Observable session state, for tests and status displays
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub capture: CaptureState,
    pub playback: PlaybackState,
    pub session: SessionConfig,
    pub items: Vec<ConversationItem>,
    pub log_entries: usize,
    pub generation: u64,
}

/// Everything the controller reacts to
pub(crate) enum Inbound {
    Transport { generation: u64, event: TransportEvent },
    Frame { generation: u64, frame: AudioFrame },
    ToolFinished { generation: u64, output: ToolOutput },
    Command(SessionCommand),
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum SessionCommand {
    Connect(Reply<RealtimeResult<()>>),
    Disconnect(Reply<RealtimeResult<()>>),
    SetTurnDetection(TurnDetection, Reply<RealtimeResult<()>>),
    BeginManualCapture(Reply<RealtimeResult<()>>),
    EndManualCapture(Reply<RealtimeResult<()>>),
    SendText(String, Reply<RealtimeResult<()>>),
    DeleteItem(String, Reply<bool>),
    RegisterTool(ToolDefinition, Reply<RealtimeResult<()>>),
    Interrupt(Reply<Option<TrackOffset>>),
    Snapshot(Reply<SessionSnapshot>),
    Shutdown,
}

pub struct SessionController {
    defaults: SessionConfig,
    session: SessionConfig,
    state: ConnectionState,
    capture_state: CaptureState,
    generation: u64,

    transport: Box<dyn RealtimeTransport>,
    capture: AudioCaptureChannel,
    playback: AudioPlaybackChannel,
    conversation: ConversationStore,
    log: EventLog,
    tools: ToolRegistry,
    /// Call ids dispatched on the current connection and not yet answered
    pending_tools: HashSet<String>,

    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: mpsc::Receiver<Inbound>,
    /// Messages pulled out of the inbox early, handled before the inbox
    deferred: VecDeque<Inbound>,
}

impl SessionController {
    pub fn new(
        transport: Box<dyn RealtimeTransport>,
        capture_device: Box<dyn CaptureDevice>,
        playback_device: Box<dyn PlaybackDevice>,
        options: ControllerOptions,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(options.inbox_capacity.max(1));
        Self {
            defaults: options.session.clone(),
            session: options.session,
            state: ConnectionState::Disconnected,
            capture_state: CaptureState::Idle,
            generation: 0,
            transport,
            capture: AudioCaptureChannel::new(capture_device, options.format.clone()),
            playback: AudioPlaybackChannel::new(playback_device, options.format),
            conversation: ConversationStore::new(),
            log: EventLog::new(),
            tools: ToolRegistry::new(),
            pending_tools: HashSet::new(),
            inbox_tx,
            inbox_rx,
            deferred: VecDeque::new(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open devices and the connection, then push the session configuration.
    /// In server VAD mode capture starts immediately.
    pub async fn connect(&mut self) -> RealtimeResult<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(RealtimeError::Connection(format!(
                "cannot connect while {:?}",
                self.state
            )));
        }

        info!("🚀 Connecting realtime session");
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        self.conversation.clear();
        self.log.clear();
        self.pending_tools.clear();

        if let Err(e) = self.open_session().await {
            error!("❌ Connect failed: {}", e);
            self.release_resources().await;
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }

        self.state = ConnectionState::Connected;
        info!(
            generation = self.generation,
            turn_detection = ?self.session.turn_detection,
            "✅ Realtime session connected"
        );
        Ok(())
    }

    async fn open_session(&mut self) -> RealtimeResult<()> {
        self.capture.begin()?;
        self.playback.open()?;

        let sink = EventSink::new(self.generation, self.inbox_tx.clone());
        self.transport.connect(sink).await?;
        self.push_session().await?;

        if self.session.turn_detection == TurnDetection::ServerVad {
            self.start_capture()?;
        }
        Ok(())
    }

    /// Tear everything down and restore the default configuration.
    /// Idempotent: a no-op when already disconnected.
    pub async fn disconnect(&mut self) -> RealtimeResult<()> {
        if self.state == ConnectionState::Disconnected {
            debug!("Disconnect ignored: not connected");
            return Ok(());
        }

        info!("🔌 Disconnecting realtime session");
        self.state = ConnectionState::Disconnecting;
        self.generation += 1;
        self.release_resources().await;

        self.conversation.clear();
        self.log.clear();
        self.pending_tools.clear();
        self.deferred.clear();
        self.session = self.defaults.clone();
        self.state = ConnectionState::Disconnected;
        info!("👋 Realtime session disconnected");
        Ok(())
    }

    async fn release_resources(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }
        self.capture.end();
        self.capture_state = CaptureState::Idle;
        self.playback.stop();
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// Switch turn detection. Ignored while disconnected.
    pub async fn set_turn_detection(&mut self, mode: TurnDetection) -> RealtimeResult<()> {
        if self.state != ConnectionState::Connected {
            debug!(?mode, "Turn detection change ignored while {:?}", self.state);
            return Ok(());
        }

        if self.session.turn_detection == TurnDetection::ServerVad
            && mode == TurnDetection::Manual
            && self.capture_state == CaptureState::Capturing
        {
            self.stop_capture().await?;
        }

        self.session.turn_detection = mode;
        self.push_session().await?;

        if mode == TurnDetection::ServerVad && self.capture_state == CaptureState::Idle {
            self.start_capture()?;
        }
        info!(?mode, "🔁 Turn detection changed");
        Ok(())
    }

    /// Start a push-to-talk turn. Any assistant audio still playing is cut
    /// and the remote side is told how much of it was heard.
    pub async fn begin_manual_capture(&mut self) -> RealtimeResult<()> {
        self.require_manual()?;
        if self.capture_state == CaptureState::Capturing {
            return Ok(());
        }

        self.barge_in().await;
        self.start_capture()?;
        info!("🎙️ Manual capture started");
        Ok(())
    }

    /// Finish a push-to-talk turn and request exactly one response.
    /// No-op if no capture is in progress.
    pub async fn end_manual_capture(&mut self) -> RealtimeResult<()> {
        self.require_manual()?;
        if self.capture_state != CaptureState::Capturing {
            return Ok(());
        }

        self.stop_capture().await?;
        self.request_response().await?;
        info!("🎙️ Manual capture finished, response requested");
        Ok(())
    }

    /// Send a typed user message and ask for a response.
    pub async fn send_user_text(&mut self, text: impl Into<String>) -> RealtimeResult<()> {
        self.require_connected()?;
        let text = text.into();
        self.log_local(json!({
            "type": "conversation.item.create",
            "item": { "type": "message", "role": "user", "text": text },
        }));
        self.transport
            .send_user_message_content(&[ContentPart::InputText(text)])
            .await?;
        self.request_response().await
    }

    /// Delete an item locally and, when connected, remotely.
    /// Returns whether the item existed; unknown ids change nothing.
    pub async fn delete_item(&mut self, item_id: &str) -> bool {
        if !self.conversation.remove(item_id) {
            debug!(item_id, "Delete ignored: unknown item");
            return false;
        }
        // No more audio will arrive for a deleted item.
        self.playback.finish_track(item_id);
        if self.state == ConnectionState::Connected {
            self.log_local(json!({ "type": "conversation.item.delete", "item_id": item_id }));
            if let Err(e) = self.transport.delete_item(item_id).await {
                warn!(item_id, "Remote delete failed: {}", e);
            }
        }
        true
    }

    /// Register a tool. While connected the new schema list is pushed at once.
    pub async fn register_tool(&mut self, definition: ToolDefinition) -> RealtimeResult<()> {
        self.tools.register(definition)?;
        if self.state == ConnectionState::Connected {
            self.push_session().await?;
        }
        Ok(())
    }

    /// Cut assistant playback now, as if the user had started speaking.
    pub async fn interrupt(&mut self) -> Option<TrackOffset> {
        self.barge_in().await
    }

    // ========================================================================
    // Driving the inbox
    // ========================================================================

    /// A cloneable handle for issuing commands from other tasks.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    /// Wait for and handle one inbox message.
    /// Returns `false` once a shutdown command was handled.
    pub async fn process_next(&mut self) -> bool {
        let next = match self.deferred.pop_front() {
            Some(msg) => Some(msg),
            None => self.inbox_rx.recv().await,
        };
        match next {
            Some(msg) => self.dispatch_inbound(msg).await,
            None => false,
        }
    }

    /// Handle everything already queued without waiting. Returns how many
    /// messages were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let next = match self.deferred.pop_front() {
                Some(msg) => msg,
                None => match self.inbox_rx.try_recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            handled += 1;
            if !self.dispatch_inbound(next).await {
                break;
            }
        }
        handled
    }

    /// Run until a shutdown command arrives, then disconnect.
    pub async fn run(&mut self) -> RealtimeResult<()> {
        info!("🔄 Session loop started");
        while self.process_next().await {}
        info!("Session loop stopping");
        self.disconnect().await
    }

    async fn dispatch_inbound(&mut self, msg: Inbound) -> bool {
        match msg {
            Inbound::Transport { generation, event } => {
                if self.is_stale(generation) {
                    debug!(generation, current = self.generation, "Dropping stale transport event");
                } else {
                    self.on_transport_event(event).await;
                }
            }
            Inbound::Frame { generation, frame } => {
                if self.is_stale(generation) || self.capture_state != CaptureState::Capturing {
                    debug!("Dropping captured frame outside an active capture");
                } else {
                    self.send_frame(frame).await;
                }
            }
            Inbound::ToolFinished { generation, output } => {
                if self.is_stale(generation) || !self.pending_tools.contains(&output.correlation_id) {
                    debug!(
                        call_id = %output.correlation_id,
                        tool = %output.tool_name,
                        "Discarding tool result from a closed connection"
                    );
                } else {
                    self.complete_tool_call(output).await;
                }
            }
            Inbound::Command(command) => return self.on_command(command).await,
        }
        true
    }

    async fn on_command(&mut self, command: SessionCommand) -> bool {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            SessionCommand::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            SessionCommand::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            SessionCommand::SetTurnDetection(mode, reply) => {
                let _ = reply.send(self.set_turn_detection(mode).await);
            }
            SessionCommand::BeginManualCapture(reply) => {
                let _ = reply.send(self.begin_manual_capture().await);
            }
            SessionCommand::EndManualCapture(reply) => {
                let _ = reply.send(self.end_manual_capture().await);
            }
            SessionCommand::SendText(text, reply) => {
                let _ = reply.send(self.send_user_text(text).await);
            }
            SessionCommand::DeleteItem(item_id, reply) => {
                let _ = reply.send(self.delete_item(&item_id).await);
            }
            SessionCommand::RegisterTool(definition, reply) => {
                let _ = reply.send(self.register_tool(definition).await);
            }
            SessionCommand::Interrupt(reply) => {
                let _ = reply.send(self.interrupt().await);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation || self.state != ConnectionState::Connected
    }

    // ========================================================================
    // Inbound protocol
    // ========================================================================

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Protocol(payload) => self.log.append(RealtimeEvent::remote(payload)),
            TransportEvent::Error(payload) => {
                error!(error = %payload, "⚠️ Realtime protocol error");
            }
            TransportEvent::ItemUpdated { item_id, delta } => self.on_item_updated(&item_id, delta).await,
            TransportEvent::ItemDeleted { item_id } => {
                self.conversation.remove(&item_id);
                self.playback.finish_track(&item_id);
            }
            TransportEvent::SpeechStarted => {
                debug!("🗣️ Remote detected speech start");
                self.barge_in().await;
            }
            TransportEvent::Closed { reason } => {
                warn!(%reason, "Connection closed by remote side");
                if let Err(e) = self.disconnect().await {
                    warn!("Teardown after remote close failed: {}", e);
                }
            }
        }
    }

    async fn on_item_updated(&mut self, item_id: &str, delta: ItemDelta) {
        if self.is_echo_of_local_output(item_id, &delta) {
            debug!(item_id, "Ignoring remote copy of a local tool output");
            return;
        }

        let outcome = self.conversation.apply_delta(item_id, &delta);
        if !outcome.applied() {
            return;
        }
        let Some(item) = self.conversation.get(item_id) else {
            return;
        };
        let role = item.role;
        let kind = item.kind;
        let completed = item.is_completed();
        let tool_call = item.tool_call.clone();

        if let Some(bytes) = &delta.audio {
            if role == ItemRole::Assistant {
                self.playback.add_pcm16(item_id, &pcm16_from_le_bytes(bytes));
            }
        }

        let completed_now = outcome == DeltaOutcome::Completed || (outcome == DeltaOutcome::Created && completed);
        if !completed_now {
            return;
        }
        if role == ItemRole::Assistant {
            self.playback.finish_track(item_id);
        }
        if kind == ItemKind::FunctionCall {
            match tool_call {
                Some(call) => self.start_tool_call(call).await,
                None => warn!(item_id, "Completed function call item carries no call"),
            }
        }
    }

    /// The remote side echoes the output items this session sends. The local
    /// copy is already in the store under its own id.
    fn is_echo_of_local_output(&self, item_id: &str, delta: &ItemDelta) -> bool {
        if delta.kind != Some(ItemKind::FunctionCallOutput) || self.conversation.get(item_id).is_some() {
            return false;
        }
        let Some(call_id) = delta.call_id.as_deref() else {
            return false;
        };
        self.conversation.items().iter().any(|item| {
            item.kind == ItemKind::FunctionCallOutput
                && item.tool_call.as_ref().map(|c| c.call_id.as_str()) == Some(call_id)
        })
    }

    // ========================================================================
    // Tools
    // ========================================================================

    async fn start_tool_call(&mut self, call: ToolCallContent) {
        match self.tools.prepare(&call.name, &call.arguments, &call.call_id) {
            Ok(prepared) => {
                info!(tool = %call.name, call_id = %call.call_id, "🔧 Dispatching tool call");
                self.pending_tools.insert(call.call_id);
                let tx = self.inbox_tx.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    let output = prepared.run().await;
                    if tx.send(Inbound::ToolFinished { generation, output }).await.is_err() {
                        debug!("Session gone, dropping tool result");
                    }
                });
            }
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.call_id, "Tool call rejected: {}", e);
                self.pending_tools.insert(call.call_id.clone());
                let output = ToolOutput::failed(call.call_id, call.name, &e);
                self.complete_tool_call(output).await;
            }
        }
    }

    async fn complete_tool_call(&mut self, output: ToolOutput) {
        self.pending_tools.remove(&output.correlation_id);
        let text = output.output_text();
        let item_id = format!("local_{}", Uuid::new_v4().simple());
        self.conversation.insert(output.to_item(item_id));

        if output.is_success() {
            info!(tool = %output.tool_name, call_id = %output.correlation_id, "✅ Tool call completed");
        } else {
            warn!(tool = %output.tool_name, call_id = %output.correlation_id, "Tool call failed: {}", text);
        }

        self.log_local(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": output.correlation_id,
                "output": text,
            },
        }));
        if let Err(e) = self
            .transport
            .send_function_call_output(&output.correlation_id, &text)
            .await
        {
            warn!(call_id = %output.correlation_id, "Sending tool output failed: {}", e);
            return;
        }
        if let Err(e) = self.request_response().await {
            warn!("Response request after tool output failed: {}", e);
        }
    }

    // ========================================================================
    // Capture and playback
    // ========================================================================

    fn start_capture(&mut self) -> RealtimeResult<()> {
        let tx = self.inbox_tx.clone();
        let generation = self.generation;
        self.capture.record(move |frame| {
            if let Err(e) = tx.try_send(Inbound::Frame { generation, frame }) {
                warn!("Dropping captured frame: {}", e);
            }
        })?;
        self.capture_state = CaptureState::Capturing;
        Ok(())
    }

    /// Pause the device and forward frames it already queued, so they land
    /// before whatever request closes the turn.
    async fn stop_capture(&mut self) -> RealtimeResult<()> {
        self.capture.pause()?;

        while let Ok(msg) = self.inbox_rx.try_recv() {
            self.deferred.push_back(msg);
        }
        let mut rest = VecDeque::with_capacity(self.deferred.len());
        let mut frames = Vec::new();
        for msg in self.deferred.drain(..) {
            match msg {
                Inbound::Frame { generation, frame } if generation == self.generation => frames.push(frame),
                other => rest.push_back(other),
            }
        }
        self.deferred = rest;
        for frame in frames {
            self.send_frame(frame).await;
        }

        self.capture_state = CaptureState::Idle;
        Ok(())
    }

    async fn send_frame(&mut self, frame: AudioFrame) {
        self.log_local(json!({
            "type": "input_audio_buffer.append",
            "samples": frame.samples.len(),
        }));
        if let Err(e) = self.transport.append_input_audio(&frame.samples).await {
            warn!("Sending captured audio failed: {}", e);
        }
    }

    /// Stop assistant playback and report the cut point to the remote side.
    async fn barge_in(&mut self) -> Option<TrackOffset> {
        let offset = self.playback.interrupt()?;
        self.conversation.mark_truncated(&offset.track_id, offset.sample_offset);

        if self.state == ConnectionState::Connected {
            self.log_local(json!({
                "type": "response.cancel",
                "item_id": offset.track_id,
                "sample_offset": offset.sample_offset,
            }));
            if let Err(e) = self
                .transport
                .cancel_response(&offset.track_id, offset.sample_offset)
                .await
            {
                warn!(track = %offset.track_id, "Response cancel failed: {}", e);
            }
        }
        Some(offset)
    }

    // ========================================================================
    // Outbound helpers
    // ========================================================================

    async fn push_session(&mut self) -> RealtimeResult<()> {
        let tools = self.tools.schemas();
        self.log_local(json!({
            "type": "session.update",
            "session": self.session,
            "tools": tools.len(),
        }));
        self.transport.update_session(&self.session, &tools).await
    }

    async fn request_response(&mut self) -> RealtimeResult<()> {
        self.log_local(json!({ "type": "response.create" }));
        self.transport.create_response().await
    }

    fn log_local(&mut self, payload: Value) {
        self.log.append(RealtimeEvent::local(payload));
    }

    fn require_connected(&self) -> RealtimeResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(RealtimeError::InvalidState(format!(
                "session is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn require_manual(&self) -> RealtimeResult<()> {
        self.require_connected()?;
        if self.session.turn_detection != TurnDetection::Manual {
            return Err(RealtimeError::InvalidState(
                "manual capture requires manual turn detection".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture_state
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Snapshot of the conversation in order.
    pub fn items(&self) -> Vec<ConversationItem> {
        self.conversation.items()
    }

    pub fn item(&self, item_id: &str) -> Option<&ConversationItem> {
        self.conversation.get(item_id)
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.pending_tools.len()
    }

    /// Spectrum of the latest captured frame.
    pub fn input_frequencies(&self, bins: usize) -> Vec<f32> {
        self.capture.frequencies(bins)
    }

    /// Spectrum of the latest rendered output.
    pub fn output_frequencies(&self, bins: usize) -> Vec<f32> {
        self.playback.frequencies(bins)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.state,
            capture: self.capture_state,
            playback: self.playback.state(),
            session: self.session.clone(),
            items: self.conversation.items(),
            log_entries: self.log.raw_len(),
            generation: self.generation,
        }
    }
}

/// Command handle for a controller driven by [`SessionController::run`]
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Inbound>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> RealtimeResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Inbound::Command(make(reply)))
            .await
            .map_err(|_| RealtimeError::ChannelSend("session loop has stopped".to_string()))?;
        response
            .await
            .map_err(|_| RealtimeError::ChannelSend("session loop dropped the request".to_string()))
    }

    pub async fn connect(&self) -> RealtimeResult<()> {
        self.request(SessionCommand::Connect).await?
    }

    pub async fn disconnect(&self) -> RealtimeResult<()> {
        self.request(SessionCommand::Disconnect).await?
    }

    pub async fn set_turn_detection(&self, mode: TurnDetection) -> RealtimeResult<()> {
        self.request(|reply| SessionCommand::SetTurnDetection(mode, reply))
            .await?
    }

    pub async fn begin_manual_capture(&self) -> RealtimeResult<()> {
        self.request(SessionCommand::BeginManualCapture).await?
    }

    pub async fn end_manual_capture(&self) -> RealtimeResult<()> {
        self.request(SessionCommand::EndManualCapture).await?
    }

    pub async fn send_user_text(&self, text: impl Into<String>) -> RealtimeResult<()> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendText(text, reply))
            .await?
    }

    pub async fn delete_item(&self, item_id: impl Into<String>) -> RealtimeResult<bool> {
        let item_id = item_id.into();
        self.request(|reply| SessionCommand::DeleteItem(item_id, reply))
            .await
    }

    pub async fn register_tool(&self, definition: ToolDefinition) -> RealtimeResult<()> {
        self.request(|reply| SessionCommand::RegisterTool(definition, reply))
            .await?
    }

    pub async fn interrupt(&self) -> RealtimeResult<Option<TrackOffset>> {
        self.request(SessionCommand::Interrupt).await
    }

    pub async fn snapshot(&self) -> RealtimeResult<SessionSnapshot> {
        self.request(SessionCommand::Snapshot).await
    }

    /// Ask the loop to stop. It disconnects before returning.
    pub async fn shutdown(&self) -> RealtimeResult<()> {
        self.tx
            .send(Inbound::Command(SessionCommand::Shutdown))
            .await
            .map_err(|_| RealtimeError::ChannelSend("session loop has stopped".to_string()))
    }
}
