//! Server events fed through the websocket translator into the controller,
//! shaped the way a live realtime connection delivers them.

#![cfg(feature = "websocket")]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pagi_realtime::audio::pcm16_to_le_bytes;
use pagi_realtime::mock::{MockCapture, MockMic, MockPlayback, MockRemote, MockSpeaker, MockTransport};
use pagi_realtime::websocket::translate_server_event;
use pagi_realtime::{
    AudioFormat, ControllerOptions, ItemKind, ItemRole, ItemStatus, PlaybackState, SessionConfig,
    SessionController, TurnDetection,
};
use serde_json::{json, Value};
use tokio_test::assert_ok;

struct Harness {
    controller: SessionController,
    remote: MockRemote,
    _mic: MockMic,
    speaker: MockSpeaker,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (transport, remote) = MockTransport::new();
    let (capture, mic) = MockCapture::new();
    let (playback, speaker) = MockPlayback::new();
    let options = ControllerOptions {
        format: AudioFormat {
            sample_rate: 24000,
            channels: 1,
            frame_samples: 240,
        },
        session: SessionConfig {
            turn_detection: TurnDetection::Manual,
            transcription_model: Some("whisper-1".to_string()),
            ..Default::default()
        },
        inbox_capacity: 64,
    };
    let controller = SessionController::new(Box::new(transport), Box::new(capture), Box::new(playback), options);
    Harness {
        controller,
        remote,
        _mic: mic,
        speaker,
    }
}

impl Harness {
    /// Deliver one server event the way the websocket reader would.
    async fn server_event(&mut self, event: Value) {
        for translated in translate_server_event(&event) {
            assert_ok!(self.remote.emit(translated).await);
        }
        self.controller.process_pending().await;
    }
}

fn user_item_created(id: &str) -> Value {
    json!({
        "type": "conversation.item.created",
        "item": {
            "id": id,
            "type": "message",
            "role": "user",
            "status": "completed",
            "content": [{ "type": "input_audio", "transcript": null }],
        },
    })
}

fn audio_delta(item_id: &str, samples: &[i16]) -> Value {
    json!({
        "type": "response.audio.delta",
        "item_id": item_id,
        "delta": BASE64.encode(pcm16_to_le_bytes(samples)),
    })
}

#[tokio::test]
async fn test_input_transcription_lands_on_completed_user_item() {
    let mut h = harness();
    assert_ok!(h.controller.connect().await);

    h.server_event(user_item_created("u1")).await;
    let item = h.controller.item("u1").unwrap();
    assert_eq!(item.role, ItemRole::User);
    assert_eq!(item.status, ItemStatus::Completed);
    assert!(item.transcript.is_empty());

    h.server_event(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "u1",
        "content_index": 0,
        "transcript": "hello there",
    }))
    .await;

    let item = h.controller.item("u1").unwrap();
    assert_eq!(item.transcript, "hello there");
    assert_eq!(item.status, ItemStatus::Completed);
    assert!(h
        .controller
        .event_log()
        .entries()
        .any(|e| e.event.kind() == "conversation.item.input_audio_transcription.completed"));
}

#[tokio::test]
async fn test_full_turn_user_then_assistant_audio() {
    let mut h = harness();
    assert_ok!(h.controller.connect().await);

    h.server_event(user_item_created("u1")).await;
    h.server_event(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "u1",
        "transcript": "what time is it",
    }))
    .await;

    h.server_event(json!({
        "type": "conversation.item.created",
        "item": {
            "id": "a1",
            "type": "message",
            "role": "assistant",
            "status": "in_progress",
            "content": [],
        },
    }))
    .await;
    h.server_event(audio_delta("a1", &[7; 300])).await;
    h.server_event(json!({
        "type": "response.audio_transcript.delta",
        "item_id": "a1",
        "delta": "It is",
    }))
    .await;
    h.server_event(audio_delta("a1", &[8; 200])).await;
    assert_eq!(h.controller.playback_state(), PlaybackState::Playing);

    h.server_event(json!({
        "type": "response.output_item.done",
        "item": {
            "id": "a1",
            "type": "message",
            "role": "assistant",
            "status": "completed",
            "content": [{ "type": "audio", "transcript": "It is noon." }],
        },
    }))
    .await;

    // A straggling fragment after completion changes nothing
    h.server_event(json!({
        "type": "response.audio_transcript.delta",
        "item_id": "a1",
        "delta": " Really.",
    }))
    .await;

    let items = h.controller.items();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "a1"]);
    assert_eq!(items[0].transcript, "what time is it");

    let answer = &items[1];
    assert_eq!(answer.role, ItemRole::Assistant);
    assert_eq!(answer.kind, ItemKind::Message);
    assert_eq!(answer.status, ItemStatus::Completed);
    assert_eq!(answer.transcript, "It is noon.");
    let decoded = answer.decoded_audio().unwrap();
    assert_eq!(decoded.len(), 500);
    assert!(decoded[..300].iter().all(|&s| s == 7));
    assert!(decoded[300..].iter().all(|&s| s == 8));

    // The whole answer plays, then playback goes idle
    let rendered = h.speaker.render(600);
    assert!(rendered[..300].iter().all(|&s| s == 7));
    assert!(rendered[300..500].iter().all(|&s| s == 8));
    assert!(rendered[500..].iter().all(|&s| s == 0));
    assert_eq!(h.controller.playback_state(), PlaybackState::Idle);
}
