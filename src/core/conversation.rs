//! Conversation transcript assembled from server events.
//!
//! Items are created when the upstream announces them and filled in from text,
//! transcript and transcription deltas. Items are never removed. An item marked
//! interrupted stays interrupted even if a later event reports it done.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::core::realtime::openai::{self, ServerEvent};

/// Content parts kept per item
const MAX_CONTENT_PARTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
    System,
}

impl ItemRole {
    fn parse(role: Option<&str>) -> Self {
        match role {
            Some("user") => ItemRole::User,
            Some("system") => ItemRole::System,
            _ => ItemRole::Assistant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemRole::User => "user",
            ItemRole::Assistant => "assistant",
            ItemRole::System => "system",
        }
    }
}

impl fmt::Display for ItemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Audio { transcript: String },
}

impl ContentPart {
    fn from_wire(part: &openai::ContentPart) -> Self {
        match part.content_type.as_str() {
            "input_audio" | "audio" => ContentPart::Audio {
                transcript: part.transcript.clone().unwrap_or_default(),
            },
            _ => ContentPart::Text {
                text: part.text.clone().unwrap_or_default(),
            },
        }
    }

    fn body(&self) -> &str {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Audio { transcript } => transcript,
        }
    }

    fn body_mut(&mut self) -> &mut String {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Audio { transcript } => transcript,
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationItem {
    pub id: String,
    pub role: ItemRole,
    pub status: ItemStatus,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// The item's text and audio transcripts joined in content order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ContentPart::body)
            .filter(|body| !body.trim().is_empty())
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The part at `index`, padding with empty parts up to it. Indexes past
    /// `MAX_CONTENT_PARTS` are refused.
    fn part_mut(&mut self, index: u32, empty: fn() -> ContentPart) -> Option<&mut ContentPart> {
        let index = index as usize;
        if index >= MAX_CONTENT_PARTS {
            tracing::warn!(item_id = %self.id, index, "Ignoring content part index out of range");
            return None;
        }
        while self.content.len() <= index {
            self.content.push(empty());
        }
        self.content.get_mut(index)
    }

    /// Forget audio transcripts; the caller did not hear all of that speech.
    fn clear_audio_transcripts(&mut self) {
        for part in &mut self.content {
            if let ContentPart::Audio { transcript } = part {
                transcript.clear();
            }
        }
    }
}

/// Result of marking an item interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Interrupted,
    /// Completion was recorded first and is kept
    AlreadyCompleted,
    Unknown,
}

#[derive(Debug, Default)]
pub struct Conversation {
    items: Vec<ConversationItem>,
    index: HashMap<String, usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the record from a server event. Returns the item it touched.
    pub fn apply(&mut self, event: &ServerEvent) -> Option<&ConversationItem> {
        match event {
            ServerEvent::ConversationItemCreated { item, .. }
            | ServerEvent::OutputItemAdded { item } => {
                let position = self.upsert(item)?;
                Some(&self.items[position])
            }
            ServerEvent::OutputItemDone { item } => {
                let position = self.upsert(item)?;
                let entry = &mut self.items[position];
                if entry.status != ItemStatus::Interrupted {
                    entry.status = ItemStatus::Completed;
                }
                Some(&self.items[position])
            }
            ServerEvent::TranscriptionCompleted {
                item_id,
                content_index,
                transcript,
            } => {
                let item = self.item_mut(item_id, ItemRole::User)?;
                *item.part_mut(*content_index, empty_audio)?.body_mut() = transcript.clone();
                Some(item)
            }
            ServerEvent::AudioTranscriptDelta {
                item_id,
                content_index,
                delta,
            } => {
                let item = self.item_mut(item_id, ItemRole::Assistant)?;
                item.part_mut(*content_index, empty_audio)?
                    .body_mut()
                    .push_str(delta);
                Some(item)
            }
            ServerEvent::TextDelta {
                item_id,
                content_index,
                delta,
            } => {
                let item = self.item_mut(item_id, ItemRole::Assistant)?;
                item.part_mut(*content_index, empty_text)?
                    .body_mut()
                    .push_str(delta);
                Some(item)
            }
            ServerEvent::ConversationItemTruncated { item_id, .. } => {
                self.mark_interrupted(item_id);
                let &position = self.index.get(item_id.as_str())?;
                let item = &mut self.items[position];
                item.clear_audio_transcripts();
                Some(item)
            }
            _ => None,
        }
    }

    /// Record that the assistant was cut off in `item_id`.
    pub fn mark_interrupted(&mut self, item_id: &str) -> InterruptOutcome {
        let Some(&position) = self.index.get(item_id) else {
            return InterruptOutcome::Unknown;
        };
        let item = &mut self.items[position];
        match item.status {
            ItemStatus::Completed => InterruptOutcome::AlreadyCompleted,
            ItemStatus::InProgress | ItemStatus::Interrupted => {
                item.status = ItemStatus::Interrupted;
                InterruptOutcome::Interrupted
            }
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.index.get(item_id).map(|&position| &self.items[position])
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `role: text` per item with text, in item order.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            let text = item.text();
            if !text.is_empty() {
                out.push_str(&format!("{}: {}\n", item.role, text));
            }
        }
        out
    }

    fn upsert(&mut self, wire: &openai::ConversationItem) -> Option<usize> {
        let id = wire.id.as_deref()?;
        let wire_parts: Vec<ContentPart> = wire
            .content
            .iter()
            .flatten()
            .map(ContentPart::from_wire)
            .collect();

        if let Some(&position) = self.index.get(id) {
            let item = &mut self.items[position];
            for (i, part) in wire_parts.into_iter().enumerate() {
                match item.content.get_mut(i) {
                    Some(existing) if existing.body().is_empty() => *existing = part,
                    Some(_) => {}
                    None => item.content.push(part),
                }
            }
            return Some(position);
        }

        let status = match wire.status.as_deref() {
            Some("completed") => ItemStatus::Completed,
            Some("incomplete") => ItemStatus::Interrupted,
            _ => ItemStatus::InProgress,
        };
        self.items.push(ConversationItem {
            id: id.to_string(),
            role: ItemRole::parse(wire.role.as_deref()),
            status,
            content: wire_parts,
        });
        let position = self.items.len() - 1;
        self.index.insert(id.to_string(), position);
        Some(position)
    }

    /// Look up `item_id`, creating an in-progress item if it was never announced.
    fn item_mut(&mut self, item_id: &str, role: ItemRole) -> Option<&mut ConversationItem> {
        if item_id.is_empty() {
            return None;
        }
        let position = match self.index.get(item_id) {
            Some(&position) => position,
            None => {
                self.items.push(ConversationItem {
                    id: item_id.to_string(),
                    role,
                    status: ItemStatus::InProgress,
                    content: Vec::new(),
                });
                let position = self.items.len() - 1;
                self.index.insert(item_id.to_string(), position);
                position
            }
        };
        self.items.get_mut(position)
    }
}

fn empty_audio() -> ContentPart {
    ContentPart::Audio {
        transcript: String::new(),
    }
}

fn empty_text() -> ContentPart {
    ContentPart::Text {
        text: String::new(),
    }
}
