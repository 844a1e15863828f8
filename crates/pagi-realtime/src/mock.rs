//! In-memory transport and device doubles for testing.
//!
//! Each mock is created together with a handle that stays with the test:
//! [`MockRemote`] plays the model service, [`MockMic`] speaks into the capture
//! device and [`MockSpeaker`] renders what the playback device would output.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::audio::AudioFormat;
use crate::capture::{CaptureDevice, SampleSink};
use crate::conversation::ItemDelta;
use crate::error::{RealtimeError, RealtimeResult};
use crate::playback::{PlaybackDevice, PlaybackSource};
use crate::session::SessionConfig;
use crate::transport::{ContentPart, EventSink, RealtimeTransport, TransportEvent};

/// Poisoning only means a test panicked mid-update; the state is still readable.
fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One outbound request as seen by the mock service
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    UpdateSession { config: SessionConfig, tools: Vec<String> },
    UserMessage(Vec<ContentPart>),
    /// Sample count of an appended audio chunk
    AppendAudio(usize),
    CreateResponse,
    CancelResponse { track_id: String, sample_offset: u64 },
    DeleteItem(String),
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Default)]
struct RemoteState {
    calls: Vec<TransportCall>,
    sink: Option<EventSink>,
    fail_connect: bool,
    fail_cancel: bool,
}

/// In-memory transport that records every request.
pub struct MockTransport {
    state: Arc<Mutex<RemoteState>>,
}

/// Test-side view of a [`MockTransport`]
#[derive(Clone)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockRemote) {
        let state = Arc::new(Mutex::new(RemoteState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockRemote { state },
        )
    }

    fn record(&self, call: TransportCall) {
        lock(&self.state).calls.push(call);
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn connect(&mut self, events: EventSink) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            state.fail_connect = false;
            return Err(RealtimeError::Connection("mock service refused the connection".into()));
        }
        state.sink = Some(events);
        state.calls.push(TransportCall::Connect);
        Ok(())
    }

    async fn disconnect(&mut self) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        state.sink = None;
        state.calls.push(TransportCall::Disconnect);
        Ok(())
    }

    async fn update_session(&mut self, config: &SessionConfig, tools: &[Value]) -> RealtimeResult<()> {
        let tools = tools
            .iter()
            .filter_map(|t| t["name"].as_str().map(String::from))
            .collect();
        self.record(TransportCall::UpdateSession {
            config: config.clone(),
            tools,
        });
        Ok(())
    }

    async fn send_user_message_content(&mut self, parts: &[ContentPart]) -> RealtimeResult<()> {
        self.record(TransportCall::UserMessage(parts.to_vec()));
        Ok(())
    }

    async fn append_input_audio(&mut self, samples: &[i16]) -> RealtimeResult<()> {
        self.record(TransportCall::AppendAudio(samples.len()));
        Ok(())
    }

    async fn create_response(&mut self) -> RealtimeResult<()> {
        self.record(TransportCall::CreateResponse);
        Ok(())
    }

    async fn cancel_response(&mut self, track_id: &str, sample_offset: u64) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::CancelResponse {
            track_id: track_id.to_string(),
            sample_offset,
        });
        if state.fail_cancel {
            return Err(RealtimeError::Protocol("mock service rejected the cancel".into()));
        }
        Ok(())
    }

    async fn delete_item(&mut self, item_id: &str) -> RealtimeResult<()> {
        self.record(TransportCall::DeleteItem(item_id.to_string()));
        Ok(())
    }

    async fn send_function_call_output(&mut self, call_id: &str, output: &str) -> RealtimeResult<()> {
        self.record(TransportCall::FunctionCallOutput {
            call_id: call_id.to_string(),
            output: output.to_string(),
        });
        Ok(())
    }
}

impl MockRemote {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| matches(c)).count()
    }

    pub fn response_requests(&self) -> usize {
        self.count(|c| *c == TransportCall::CreateResponse)
    }

    pub fn appended_samples(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .map(|c| match c {
                TransportCall::AppendAudio(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    /// Make the next `connect` fail.
    pub fn fail_next_connect(&self) {
        lock(&self.state).fail_connect = true;
    }

    pub fn fail_cancel(&self, fail: bool) {
        lock(&self.state).fail_cancel = fail;
    }

    /// The sink of the current connection; keep it to emit stale events later.
    pub fn sink(&self) -> Option<EventSink> {
        lock(&self.state).sink.clone()
    }

    pub async fn emit(&self, event: TransportEvent) -> RealtimeResult<()> {
        let sink = self
            .sink()
            .ok_or_else(|| RealtimeError::Connection("mock service is not connected".into()))?;
        sink.emit(event).await
    }

    pub async fn emit_item(&self, item_id: &str, delta: ItemDelta) -> RealtimeResult<()> {
        self.emit(TransportEvent::ItemUpdated {
            item_id: item_id.to_string(),
            delta,
        })
        .await
    }
}

struct MicState {
    available: bool,
    open: bool,
    sink: Option<SampleSink>,
}

/// Capture device fed by [`MockMic::speak`].
pub struct MockCapture {
    state: Arc<Mutex<MicState>>,
}

#[derive(Clone)]
pub struct MockMic {
    state: Arc<Mutex<MicState>>,
}

impl MockCapture {
    pub fn new() -> (Self, MockMic) {
        let state = Arc::new(Mutex::new(MicState {
            available: true,
            open: false,
            sink: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockMic { state },
        )
    }
}

impl CaptureDevice for MockCapture {
    fn open(&mut self, _format: &AudioFormat) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        if !state.available {
            return Err(RealtimeError::DeviceUnavailable("no mock input device".into()));
        }
        state.open = true;
        Ok(())
    }

    fn start(&mut self, sink: SampleSink) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(RealtimeError::InvalidState("mock input device is closed".into()));
        }
        state.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> RealtimeResult<()> {
        lock(&self.state).sink = None;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.sink = None;
        state.open = false;
    }
}

impl MockMic {
    /// Push samples as the hardware would. Returns whether anything was listening.
    pub fn speak(&self, samples: &[i16]) -> bool {
        let mut state = lock(&self.state);
        match state.sink.as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.state).sink.is_some()
    }
}

struct SpeakerState {
    available: bool,
    source: Option<PlaybackSource>,
}

/// Playback device that renders only when the test asks.
pub struct MockPlayback {
    state: Arc<Mutex<SpeakerState>>,
}

#[derive(Clone)]
pub struct MockSpeaker {
    state: Arc<Mutex<SpeakerState>>,
}

impl MockPlayback {
    pub fn new() -> (Self, MockSpeaker) {
        let state = Arc::new(Mutex::new(SpeakerState {
            available: true,
            source: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockSpeaker { state },
        )
    }
}

impl PlaybackDevice for MockPlayback {
    fn open(&mut self, _format: &AudioFormat, source: PlaybackSource) -> RealtimeResult<()> {
        let mut state = lock(&self.state);
        if !state.available {
            return Err(RealtimeError::DeviceUnavailable("no mock output device".into()));
        }
        state.source = Some(source);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.state).source = None;
    }
}

impl MockSpeaker {
    /// Pull `samples` samples through the device, as one render callback would.
    pub fn render(&self, samples: usize) -> Vec<i16> {
        let mut out = vec![0i16; samples];
        if let Some(source) = lock(&self.state).source.as_ref() {
            source.fill(&mut out);
        }
        out
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).source.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_readable_after_poisoned_lock() {
        let (_transport, remote) = MockTransport::new();
        let state = Arc::clone(&remote.state);
        let joined = std::thread::spawn(move || {
            let _guard = state.lock().unwrap();
            panic!("panic while holding the remote state");
        })
        .join();
        assert!(joined.is_err());

        assert!(remote.calls().is_empty());
        assert!(!remote.is_connected());
        remote.fail_cancel(true);
    }
}
