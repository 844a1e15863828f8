//! Conversation store: ordered items merged from incremental protocol deltas.
//!
//! Items are created on first reference and updated by later deltas with the same
//! id. Once an item is completed its audio and status are frozen; the only delta
//! still accepted is a final transcript ([`TextPatch::Replace`] and nothing else),
//! which is how input transcription lands on a user item the service created as
//! already completed. Anything else is reported as [`DeltaOutcome::Rejected`].
//! Truncation after barge-in is kept as metadata (`heard_samples`) so the audio
//! buffer itself is never cut.

use crate::audio::pcm16_from_le_bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    FunctionCall,
    FunctionCallOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
}

/// Update to a text-like field: streaming fragment or final value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPatch {
    Append(String),
    Replace(String),
}

impl TextPatch {
    fn apply(&self, target: &mut String) {
        match self {
            TextPatch::Append(fragment) => target.push_str(fragment),
            TextPatch::Replace(value) => value.clone_into(target),
        }
    }
}

/// Tool call carried by a `function_call` item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument text as streamed by the model
    pub arguments: String,
}

/// Incremental change to one conversation item
#[derive(Debug, Clone, Default)]
pub struct ItemDelta {
    pub role: Option<ItemRole>,
    pub kind: Option<ItemKind>,
    pub status: Option<ItemStatus>,
    /// Little-endian PCM16 bytes to append
    pub audio: Option<Vec<u8>>,
    pub text: Option<TextPatch>,
    pub transcript: Option<TextPatch>,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<TextPatch>,
    pub output: Option<String>,
}

impl ItemDelta {
    /// The final transcript carried by a delta that touches nothing else.
    fn late_transcript(&self) -> Option<&str> {
        let only_transcript = self.audio.is_none()
            && self.text.is_none()
            && self.arguments.is_none()
            && self.call_id.is_none()
            && self.name.is_none()
            && self.output.is_none()
            && self.status != Some(ItemStatus::InProgress);
        match &self.transcript {
            Some(TextPatch::Replace(transcript)) if only_transcript => Some(transcript.as_str()),
            _ => None,
        }
    }

    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            audio: Some(bytes),
            ..Default::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: Some(ItemStatus::Completed),
            ..Default::default()
        }
    }

    pub fn transcript(fragment: impl Into<String>) -> Self {
        Self {
            transcript: Some(TextPatch::Append(fragment.into())),
            ..Default::default()
        }
    }
}

/// One turn-level unit of dialogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub id: String,
    pub role: ItemRole,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub text: String,
    pub transcript: String,
    audio: Vec<u8>,
    pub tool_call: Option<ToolCallContent>,
    pub output: Option<String>,
    heard_samples: Option<u64>,
}

impl ConversationItem {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: ItemRole::Assistant,
            kind: ItemKind::Message,
            status: ItemStatus::InProgress,
            text: String::new(),
            transcript: String::new(),
            audio: Vec::new(),
            tool_call: None,
            output: None,
            heard_samples: None,
        }
    }

    /// A locally produced, already completed `function_call_output` item.
    pub fn function_call_output(id: impl Into<String>, call_id: &str, output: String) -> Self {
        let mut item = Self::new(&id.into());
        item.role = ItemRole::Tool;
        item.kind = ItemKind::FunctionCallOutput;
        item.status = ItemStatus::Completed;
        item.tool_call = Some(ToolCallContent {
            call_id: call_id.to_string(),
            ..Default::default()
        });
        item.output = Some(output);
        item
    }

    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    /// Raw PCM16 bytes received so far.
    pub fn audio_bytes(&self) -> &[u8] {
        &self.audio
    }

    /// Decoded samples; available once the item is completed with audio.
    pub fn decoded_audio(&self) -> Option<Vec<i16>> {
        if self.is_completed() && !self.audio.is_empty() {
            Some(pcm16_from_le_bytes(&self.audio))
        } else {
            None
        }
    }

    /// Samples actually heard before a barge-in, if the item was truncated.
    pub fn heard_samples(&self) -> Option<u64> {
        self.heard_samples
    }

    /// The audio prefix that was played: everything, unless truncated.
    pub fn audible_audio(&self) -> &[u8] {
        match self.heard_samples {
            Some(samples) => {
                let end = (samples as usize).saturating_mul(2).min(self.audio.len());
                &self.audio[..end]
            }
            None => &self.audio,
        }
    }

    fn apply(&mut self, delta: &ItemDelta) {
        if let Some(role) = delta.role {
            self.role = role;
        }
        if let Some(kind) = delta.kind {
            self.kind = kind;
        }
        if let Some(bytes) = &delta.audio {
            self.audio.extend_from_slice(bytes);
        }
        if let Some(patch) = &delta.text {
            patch.apply(&mut self.text);
        }
        if let Some(patch) = &delta.transcript {
            patch.apply(&mut self.transcript);
        }
        if delta.call_id.is_some() || delta.name.is_some() || delta.arguments.is_some() {
            let call = self.tool_call.get_or_insert_with(ToolCallContent::default);
            if let Some(call_id) = &delta.call_id {
                call_id.clone_into(&mut call.call_id);
            }
            if let Some(name) = &delta.name {
                name.clone_into(&mut call.name);
            }
            if let Some(patch) = &delta.arguments {
                patch.apply(&mut call.arguments);
            }
        }
        if let Some(output) = &delta.output {
            self.output = Some(output.clone());
        }
        if let Some(status) = delta.status {
            self.status = status;
        }
    }
}

/// What `apply_delta` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Item did not exist and was created from this delta
    Created,
    /// Existing in-progress item updated, or a final transcript attached to a
    /// completed one
    Updated,
    /// This delta moved the item to `completed`
    Completed,
    /// Item was already completed and the delta was more than a final
    /// transcript; nothing changed
    Rejected,
}

impl DeltaOutcome {
    pub fn applied(self) -> bool {
        self != DeltaOutcome::Rejected
    }
}

/// Ordered collection of conversation items
#[derive(Debug, Default)]
pub struct ConversationStore {
    items: Vec<ConversationItem>,
    index: HashMap<String, usize>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create `item_id` and merge `delta` into it.
    pub fn apply_delta(&mut self, item_id: &str, delta: &ItemDelta) -> DeltaOutcome {
        if let Some(&pos) = self.index.get(item_id) {
            let item = &mut self.items[pos];
            if item.is_completed() {
                if let Some(transcript) = delta.late_transcript() {
                    transcript.clone_into(&mut item.transcript);
                    debug!(item_id, "Transcript attached to completed item");
                    return DeltaOutcome::Updated;
                }
                warn!(item_id, "Ignoring delta for completed item");
                return DeltaOutcome::Rejected;
            }
            item.apply(delta);
            return if item.is_completed() {
                debug!(item_id, audio_bytes = item.audio.len(), "Item completed");
                DeltaOutcome::Completed
            } else {
                DeltaOutcome::Updated
            };
        }

        let mut item = ConversationItem::new(item_id);
        item.apply(delta);
        debug!(item_id, role = ?item.role, kind = ?item.kind, "Item created");
        self.index.insert(item_id.to_string(), self.items.len());
        self.items.push(item);
        DeltaOutcome::Created
    }

    /// Insert a fully formed item (e.g. a local tool output). Existing ids are left alone.
    pub fn insert(&mut self, item: ConversationItem) -> bool {
        if self.index.contains_key(&item.id) {
            return false;
        }
        self.index.insert(item.id.clone(), self.items.len());
        self.items.push(item);
        true
    }

    /// Record how much of an item's audio was heard before barge-in.
    pub fn mark_truncated(&mut self, item_id: &str, heard_samples: u64) -> bool {
        match self.index.get(item_id) {
            Some(&pos) => {
                self.items[pos].heard_samples = Some(heard_samples);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.index.get(item_id).map(|&pos| &self.items[pos])
    }

    /// Snapshot of all items in order.
    pub fn items(&self) -> Vec<ConversationItem> {
        self.items.clone()
    }

    /// Remove `item_id` if present. Returns whether anything was removed.
    pub fn remove(&mut self, item_id: &str) -> bool {
        let Some(pos) = self.index.remove(item_id) else {
            return false;
        };
        self.items.remove(pos);
        for idx in self.index.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}
