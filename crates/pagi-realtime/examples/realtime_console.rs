//! Realtime Console — talk to a realtime model from the terminal.
//!
//! Uses the default microphone and speaker (cpal) and the websocket transport.
//! Settings come from `config/realtime.toml` and `PAGI_REALTIME__*`; the API key
//! falls back to `OPENAI_API_KEY` (a `.env` file is loaded first).
//!
//! Commands (one per line):
//! - `talk`        start push-to-talk; `talk` again ends the turn
//! - `send <text>` send a typed message
//! - `vad`         let the server detect turns
//! - `manual`      back to push-to-talk
//! - `delete <id>` delete a conversation item
//! - `items`       print the conversation
//! - `quit`

use chrono::Utc;
use pagi_realtime::{
    CpalCapture, CpalPlayback, FieldType, ParamSchema, RealtimeSettings, SessionController, SessionHandle,
    ToolDefinition, TurnDetection, WebSocketTransport,
};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = RealtimeSettings::load()?;
    let transport = WebSocketTransport::from_settings(&settings)?;
    let mut controller = SessionController::new(
        Box::new(transport),
        Box::new(CpalCapture::new()),
        Box::new(CpalPlayback::new()),
        settings.controller_options(),
    );

    controller
        .register_tool(ToolDefinition::from_fn(
            "get_time",
            "Current UTC time, optionally with a label",
            ParamSchema::new().optional("label", FieldType::String, "Prefix for the answer"),
            |args: Map<String, Value>| async move {
                let label = args.get("label").and_then(Value::as_str).unwrap_or("UTC");
                Ok(json!({ "time": format!("{} {}", label, Utc::now().to_rfc3339()) }))
            },
        ))
        .await?;

    info!("🎧 Realtime Console — type `talk`, `send <text>`, `vad`, `manual`, `items` or `quit`");
    let handle = controller.session_handle();
    let (result, ()) = tokio::join!(controller.run(), console(handle));
    result?;
    Ok(())
}

async fn console(handle: SessionHandle) {
    if let Err(e) = handle.connect().await {
        warn!("Connect failed: {}", e);
        let _ = handle.shutdown().await;
        return;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut talking = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let outcome = match command {
            "talk" if talking => {
                talking = false;
                handle.end_manual_capture().await
            }
            "talk" => {
                talking = true;
                handle.begin_manual_capture().await
            }
            "send" => handle.send_user_text(rest).await,
            "vad" => handle.set_turn_detection(TurnDetection::ServerVad).await,
            "manual" => handle.set_turn_detection(TurnDetection::Manual).await,
            "delete" => handle.delete_item(rest).await.map(|removed| {
                if !removed {
                    info!("No item {}", rest);
                }
            }),
            "items" => handle.snapshot().await.map(|snapshot| {
                for item in snapshot.items {
                    let text = if item.transcript.is_empty() { &item.text } else { &item.transcript };
                    println!("{} [{:?}/{:?}] {}", item.id, item.role, item.status, text);
                }
            }),
            "quit" => break,
            "" => Ok(()),
            other => {
                warn!("Unknown command: {}", other);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            warn!("{} failed: {}", command, e);
            if command == "talk" {
                talking = false;
            }
        }
    }

    let _ = handle.shutdown().await;
}
