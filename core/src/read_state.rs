/// Read-state tracking: selection and unread-count transitions
use serde::{Deserialize, Serialize};

/// At most one selected conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    selected: Option<String>,
}

impl SelectionState {
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_selected(&self, conversation_id: &str) -> bool {
        self.selected.as_deref() == Some(conversation_id)
    }
}

/// How much an incoming message adds to a conversation's unread count.
/// Own messages and messages for the open conversation never count.
pub fn unread_delta(
    sender_id: &str,
    conversation_id: &str,
    local_user_id: &str,
    selected: Option<&str>,
) -> u32 {
    if sender_id == local_user_id || selected == Some(conversation_id) {
        0
    } else {
        1
    }
}

/// Side effect requested by a selection change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEffect {
    /// Call `mark_conversation_read` for this id
    MarkRead(String),
}

#[derive(Debug, Default)]
pub struct ReadStateTracker {
    selection: SelectionState,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SelectionState {
        &self.selection
    }

    pub fn selected(&self) -> Option<&str> {
        self.selection.selected()
    }

    /// Select a conversation. Returns the mark-as-read effect only when the
    /// selection actually changed, so re-selecting the open conversation is free.
    pub fn select(&mut self, conversation_id: &str) -> Option<ReadEffect> {
        if self.selection.is_selected(conversation_id) {
            return None;
        }
        self.selection.selected = Some(conversation_id.to_string());
        Some(ReadEffect::MarkRead(conversation_id.to_string()))
    }

    /// Clear the selection without touching any counts. Returns the previous id.
    pub fn deselect(&mut self) -> Option<String> {
        self.selection.selected.take()
    }
}
