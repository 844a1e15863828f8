//! Session controller scenarios against the in-memory transport and devices.

use pagi_realtime::audio::pcm16_to_le_bytes;
use pagi_realtime::mock::{MockCapture, MockMic, MockPlayback, MockRemote, MockSpeaker, MockTransport, TransportCall};
use pagi_realtime::{
    AudioFormat, CaptureState, ConnectionState, ControllerOptions, FieldType, ItemDelta, ItemKind, ItemRole,
    ItemStatus, ParamSchema, PlaybackState, RealtimeError, SessionConfig, SessionController, TextPatch,
    ToolDefinition, TransportEvent, TurnDetection,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_test::assert_ok;

const FRAME: usize = 240;

struct Harness {
    controller: SessionController,
    remote: MockRemote,
    mic: MockMic,
    speaker: MockSpeaker,
}

fn harness(turn_detection: TurnDetection) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (transport, remote) = MockTransport::new();
    let (capture, mic) = MockCapture::new();
    let (playback, speaker) = MockPlayback::new();
    let options = ControllerOptions {
        format: AudioFormat {
            sample_rate: 24000,
            channels: 1,
            frame_samples: FRAME,
        },
        session: SessionConfig {
            turn_detection,
            ..Default::default()
        },
        inbox_capacity: 64,
    };
    let controller = SessionController::new(Box::new(transport), Box::new(capture), Box::new(playback), options);
    Harness {
        controller,
        remote,
        mic,
        speaker,
    }
}

fn echo_tool() -> ToolDefinition {
    ToolDefinition::from_fn(
        "echo",
        "Repeat the given text",
        ParamSchema::new().required("text", FieldType::String, "Text to repeat"),
        |args: Map<String, Value>| async move { Ok(json!({ "echo": args["text"] })) },
    )
}

/// A tool that answers only after `gate` is notified.
fn gated_tool(gate: Arc<Notify>) -> ToolDefinition {
    ToolDefinition::from_fn("lookup", "Slow lookup", ParamSchema::new(), move |_args: Map<String, Value>| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            Ok(json!({ "answer": 42 }))
        }
    })
}

fn function_call(call_id: &str, name: &str, arguments: &str) -> ItemDelta {
    ItemDelta {
        role: Some(ItemRole::Assistant),
        kind: Some(ItemKind::FunctionCall),
        status: Some(ItemStatus::Completed),
        call_id: Some(call_id.to_string()),
        name: Some(name.to_string()),
        arguments: Some(TextPatch::Replace(arguments.to_string())),
        ..Default::default()
    }
}

fn assistant_audio(samples: &[i16]) -> ItemDelta {
    ItemDelta {
        role: Some(ItemRole::Assistant),
        kind: Some(ItemKind::Message),
        ..ItemDelta::audio(pcm16_to_le_bytes(samples))
    }
}

fn outputs_sent(remote: &MockRemote) -> Vec<(String, String)> {
    remote
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            TransportCall::FunctionCallOutput { call_id, output } => Some((call_id, output)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut h = harness(TurnDetection::Manual);

    assert_ok!(h.controller.disconnect().await);
    assert!(h.remote.calls().is_empty());

    h.controller.connect().await.unwrap();
    h.controller
        .set_turn_detection(TurnDetection::ServerVad)
        .await
        .unwrap();

    h.controller.disconnect().await.unwrap();
    let once = h.controller.snapshot();
    let calls_once = h.remote.calls().len();

    assert_ok!(h.controller.disconnect().await);
    assert_eq!(h.controller.snapshot(), once);
    assert_eq!(h.remote.calls().len(), calls_once);

    assert_eq!(once.connection, ConnectionState::Disconnected);
    assert_eq!(once.session.turn_detection, TurnDetection::Manual);
    assert!(once.items.is_empty());
    assert_eq!(once.log_entries, 0);
    assert!(!h.mic.is_open());
    assert!(!h.speaker.is_open());
}

#[tokio::test]
async fn test_turn_mode_switch_stops_and_restarts_capture() {
    let mut h = harness(TurnDetection::ServerVad);
    h.controller.connect().await.unwrap();
    assert_eq!(h.controller.capture_state(), CaptureState::Capturing);
    assert!(h.mic.is_recording());

    h.mic.speak(&[7; FRAME * 2]);
    h.controller.process_pending().await;
    assert_eq!(h.remote.appended_samples(), FRAME * 2);

    h.controller
        .set_turn_detection(TurnDetection::Manual)
        .await
        .unwrap();
    assert_eq!(h.controller.capture_state(), CaptureState::Idle);
    assert!(!h.mic.is_recording());
    assert!(h.mic.is_open());

    h.controller
        .set_turn_detection(TurnDetection::ServerVad)
        .await
        .unwrap();
    assert_eq!(h.controller.capture_state(), CaptureState::Capturing);
    assert!(h.mic.is_recording());

    let updates = h
        .remote
        .count(|c| matches!(c, TransportCall::UpdateSession { .. }));
    assert_eq!(updates, 3);
}

#[tokio::test]
async fn test_manual_capture_requests_exactly_one_response() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();
    assert_eq!(h.controller.capture_state(), CaptureState::Idle);
    assert!(!h.mic.is_recording());

    h.controller.begin_manual_capture().await.unwrap();
    // Starting twice is a no-op
    h.controller.begin_manual_capture().await.unwrap();
    assert!(h.mic.is_recording());

    h.mic.speak(&[3; FRAME * 3]);
    h.controller.end_manual_capture().await.unwrap();

    assert_eq!(h.remote.response_requests(), 1);
    assert_eq!(h.controller.capture_state(), CaptureState::Idle);
    assert!(!h.mic.is_recording());

    // Every frame captured during the turn went out before the response request
    let calls = h.remote.calls();
    let response_at = calls
        .iter()
        .position(|c| *c == TransportCall::CreateResponse)
        .unwrap();
    let appended: usize = calls[..response_at]
        .iter()
        .map(|c| match c {
            TransportCall::AppendAudio(n) => *n,
            _ => 0,
        })
        .sum();
    assert_eq!(appended, FRAME * 3);

    h.controller.end_manual_capture().await.unwrap();
    assert_eq!(h.remote.response_requests(), 1);
}

#[tokio::test]
async fn test_manual_capture_rejected_in_server_vad_mode() {
    let mut h = harness(TurnDetection::ServerVad);
    h.controller.connect().await.unwrap();
    assert!(matches!(
        h.controller.begin_manual_capture().await,
        Err(RealtimeError::InvalidState(_))
    ));
    assert_eq!(h.controller.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_echo_tool_round_trip() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.register_tool(echo_tool()).await.unwrap();
    h.controller.connect().await.unwrap();
    assert!(h.remote.calls().iter().any(|c| matches!(
        c,
        TransportCall::UpdateSession { tools, .. } if tools == &vec!["echo".to_string()]
    )));

    h.remote
        .emit_item("fc_1", function_call("call_1", "echo", r#"{"text":"hi"}"#))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.pending_tool_calls(), 1);

    assert!(timeout(Duration::from_secs(2), h.controller.process_next())
        .await
        .unwrap());
    assert_eq!(h.controller.pending_tool_calls(), 0);

    let output = h
        .controller
        .items()
        .into_iter()
        .find(|i| i.kind == ItemKind::FunctionCallOutput)
        .unwrap();
    assert!(output.output.unwrap().contains("\"hi\""));
    let sent = outputs_sent(&h.remote);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "call_1");
    assert_eq!(h.remote.response_requests(), 1);

    // Wrong argument type: structured failure, session continues
    h.remote
        .emit_item("fc_2", function_call("call_2", "echo", r#"{"text":5}"#))
        .await
        .unwrap();
    h.controller.process_pending().await;

    let sent = outputs_sent(&h.remote);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0, "call_2");
    assert!(sent[1].1.contains("schema_validation"));
    assert_eq!(h.controller.state(), ConnectionState::Connected);
    assert_eq!(h.remote.response_requests(), 2);
}

#[tokio::test]
async fn test_unknown_tool_reported_back() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item("fc_1", function_call("call_1", "missing", "{}"))
        .await
        .unwrap();
    h.controller.process_pending().await;

    let sent = outputs_sent(&h.remote);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("unknown_tool"));
    assert_eq!(h.controller.pending_tool_calls(), 0);
}

#[tokio::test]
async fn test_register_duplicate_tool() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.register_tool(echo_tool()).await.unwrap();
    assert!(matches!(
        h.controller.register_tool(echo_tool()).await,
        Err(RealtimeError::DuplicateTool(name)) if name == "echo"
    ));
}

#[tokio::test]
async fn test_events_flow_while_tool_pending() {
    let mut h = harness(TurnDetection::Manual);
    let gate = Arc::new(Notify::new());
    h.controller
        .register_tool(gated_tool(Arc::clone(&gate)))
        .await
        .unwrap();
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item("fc_1", function_call("call_1", "lookup", "{}"))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.pending_tool_calls(), 1);

    h.remote
        .emit(TransportEvent::Protocol(json!({ "type": "response.audio_transcript.delta" })))
        .await
        .unwrap();
    h.remote
        .emit_item("msg_1", ItemDelta::transcript("still "))
        .await
        .unwrap();
    h.remote
        .emit_item("msg_1", ItemDelta::transcript("talking"))
        .await
        .unwrap();
    h.controller.process_pending().await;

    assert_eq!(h.controller.item("msg_1").unwrap().transcript, "still talking");
    assert!(h
        .controller
        .event_log()
        .raw()
        .any(|e| e.kind() == "response.audio_transcript.delta"));
    assert_eq!(h.controller.pending_tool_calls(), 1);

    gate.notify_one();
    timeout(Duration::from_secs(2), h.controller.process_next())
        .await
        .unwrap();
    assert_eq!(outputs_sent(&h.remote).len(), 1);
    assert_eq!(h.controller.pending_tool_calls(), 0);
}

#[tokio::test]
async fn test_tool_result_after_reconnect_is_discarded() {
    let mut h = harness(TurnDetection::Manual);
    let gate = Arc::new(Notify::new());
    h.controller
        .register_tool(gated_tool(Arc::clone(&gate)))
        .await
        .unwrap();
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item("fc_1", function_call("call_1", "lookup", "{}"))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.pending_tool_calls(), 1);
    let stale_sink = h.remote.sink().unwrap();

    h.controller.disconnect().await.unwrap();
    h.controller.connect().await.unwrap();
    assert_eq!(h.controller.pending_tool_calls(), 0);

    gate.notify_one();
    timeout(Duration::from_secs(2), h.controller.process_next())
        .await
        .unwrap();

    // Late transport events from the old connection are dropped as well
    stale_sink
        .emit(TransportEvent::ItemUpdated {
            item_id: "old_item".to_string(),
            delta: ItemDelta::transcript("ghost"),
        })
        .await
        .unwrap();
    h.controller.process_pending().await;

    assert!(outputs_sent(&h.remote).is_empty());
    assert!(h.controller.items().is_empty());
    assert_eq!(h.controller.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_failure_leaves_disconnected() {
    let mut h = harness(TurnDetection::ServerVad);
    h.remote.fail_next_connect();

    assert!(matches!(
        h.controller.connect().await,
        Err(RealtimeError::Connection(_))
    ));
    assert_eq!(h.controller.state(), ConnectionState::Disconnected);
    assert_eq!(h.controller.capture_state(), CaptureState::Idle);
    assert!(!h.mic.is_open());
    assert!(!h.speaker.is_open());

    // Caller may retry
    assert_ok!(h.controller.connect().await);
    assert_eq!(h.controller.state(), ConnectionState::Connected);
    assert!(h.mic.is_recording());
}

#[tokio::test]
async fn test_missing_device_aborts_connect() {
    let mut h = harness(TurnDetection::Manual);
    h.speaker.set_available(false);

    assert!(matches!(
        h.controller.connect().await,
        Err(RealtimeError::DeviceUnavailable(_))
    ));
    assert_eq!(h.controller.state(), ConnectionState::Disconnected);
    assert!(!h.remote.is_connected());
    assert!(!h.mic.is_open());
}

#[tokio::test]
async fn test_speech_started_barges_in_at_exact_offset() {
    let mut h = harness(TurnDetection::ServerVad);
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item("resp_1", assistant_audio(&[100; 1000]))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.playback_state(), PlaybackState::Playing);

    let rendered = h.speaker.render(400);
    assert!(rendered.iter().all(|&s| s == 100));

    h.remote.emit(TransportEvent::SpeechStarted).await.unwrap();
    h.controller.process_pending().await;

    assert!(h.remote.calls().contains(&TransportCall::CancelResponse {
        track_id: "resp_1".to_string(),
        sample_offset: 400,
    }));
    assert_eq!(h.controller.playback_state(), PlaybackState::Interrupted);
    let item = h.controller.item("resp_1").unwrap();
    assert_eq!(item.heard_samples(), Some(400));
    assert_eq!(item.audio_bytes().len(), 2000);

    // Audio still streaming for the cut response is not played
    h.remote
        .emit_item("resp_1", ItemDelta::audio(pcm16_to_le_bytes(&[5; 100])))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.speaker.render(10), vec![0; 10]);
}

#[tokio::test]
async fn test_failed_cancel_does_not_block_barge_in() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();
    h.remote.fail_cancel(true);

    h.remote
        .emit_item("resp_1", assistant_audio(&[1; 500]))
        .await
        .unwrap();
    h.controller.process_pending().await;
    h.speaker.render(120);

    h.controller.begin_manual_capture().await.unwrap();
    assert_eq!(h.controller.playback_state(), PlaybackState::Interrupted);
    assert_eq!(h.controller.capture_state(), CaptureState::Capturing);
    assert_eq!(h.controller.item("resp_1").unwrap().heard_samples(), Some(120));
    assert_eq!(h.controller.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_completed_assistant_item_rejects_late_deltas() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item("resp_1", assistant_audio(&[1, 2]))
        .await
        .unwrap();
    h.remote
        .emit_item("resp_1", ItemDelta::completed())
        .await
        .unwrap();
    h.remote
        .emit_item("resp_1", ItemDelta::transcript("late"))
        .await
        .unwrap();
    h.controller.process_pending().await;

    let item = h.controller.item("resp_1").unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.decoded_audio(), Some(vec![1, 2]));
    assert!(item.transcript.is_empty());
}

#[tokio::test]
async fn test_late_transcription_fills_completed_user_item() {
    let mut h = harness(TurnDetection::ServerVad);
    h.controller.connect().await.unwrap();

    h.remote
        .emit_item(
            "u1",
            ItemDelta {
                role: Some(ItemRole::User),
                kind: Some(ItemKind::Message),
                status: Some(ItemStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.remote
        .emit_item(
            "u1",
            ItemDelta {
                transcript: Some(TextPatch::Replace("hello there".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.controller.process_pending().await;

    let item = h.controller.item("u1").unwrap();
    assert_eq!(item.transcript, "hello there");
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(h.controller.playback_state(), PlaybackState::Idle);
}

#[tokio::test]
async fn test_audio_gap_keeps_item_order_until_completion() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();

    h.remote.emit_item("a1", assistant_audio(&[1, 1])).await.unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.speaker.render(2), vec![1, 1]);

    // "a1" runs dry; "a2" starts before the rest of "a1" arrives
    h.remote.emit_item("a2", assistant_audio(&[9])).await.unwrap();
    h.remote
        .emit_item("a1", ItemDelta::audio(pcm16_to_le_bytes(&[2, 2])))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.speaker.render(4), vec![2, 2, 0, 0]);

    h.remote.emit_item("a1", ItemDelta::completed()).await.unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.speaker.render(2), vec![9, 0]);
}

#[tokio::test]
async fn test_deleting_starved_item_releases_playback() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();

    h.remote.emit_item("a1", assistant_audio(&[1; 3])).await.unwrap();
    h.remote.emit_item("a2", assistant_audio(&[4; 2])).await.unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.speaker.render(5), vec![1, 1, 1, 0, 0]);

    assert!(h.controller.delete_item("a1").await);
    assert_eq!(h.speaker.render(3), vec![4, 4, 0]);
}

#[tokio::test]
async fn test_delete_item_forwards_when_connected() {
    let mut h = harness(TurnDetection::Manual);
    h.controller.connect().await.unwrap();
    h.remote
        .emit_item("msg_1", ItemDelta::transcript("hello"))
        .await
        .unwrap();
    h.controller.process_pending().await;

    assert!(h.controller.delete_item("msg_1").await);
    assert!(!h.controller.delete_item("msg_1").await);
    assert!(h.controller.items().is_empty());
    assert_eq!(
        h.remote
            .count(|c| *c == TransportCall::DeleteItem("msg_1".to_string())),
        1
    );
}

#[tokio::test]
async fn test_protocol_error_keeps_session_and_remote_close_tears_down() {
    let mut h = harness(TurnDetection::ServerVad);
    h.controller.connect().await.unwrap();

    h.remote
        .emit(TransportEvent::Error(json!({ "message": "bad event" })))
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.state(), ConnectionState::Connected);

    h.remote
        .emit(TransportEvent::Closed {
            reason: "server going away".to_string(),
        })
        .await
        .unwrap();
    h.controller.process_pending().await;
    assert_eq!(h.controller.state(), ConnectionState::Disconnected);
    assert!(!h.mic.is_open());
}

#[tokio::test]
async fn test_handle_drives_run_loop() {
    let Harness {
        mut controller,
        remote,
        ..
    } = harness(TurnDetection::Manual);
    let handle = controller.session_handle();

    let driver = async {
        handle.connect().await.unwrap();
        handle.send_user_text("hello there").await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        handle.shutdown().await.unwrap();
        snapshot
    };
    let (result, snapshot) = tokio::join!(controller.run(), driver);
    result.unwrap();

    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(remote.calls().contains(&TransportCall::UserMessage(vec![
        pagi_realtime::ContentPart::InputText("hello there".to_string())
    ])));
    assert_eq!(remote.response_requests(), 1);
}
