//! In-game chat for the players and spectators of a session.
//!
//! Messages are plain text: markup is stripped, the result is trimmed and
//! length-checked, and a small word filter applies. Each session keeps a
//! bounded log so a reconnecting client sees recent conversation in its
//! snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{GameError, GameResult};
use crate::types::Color;

/// Longest accepted message, counted in characters after sanitizing.
pub const MAX_MESSAGE_LEN: usize = 150;

/// Messages kept per session; older ones are dropped first.
pub const MAX_LOG_LEN: usize = 200;

const FORBIDDEN_WORDS: [&str; 3] = ["spam", "hack", "cheat"];

/// One chat line as stored and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: String,
    /// Unset for spectators.
    pub sender_color: Option<Color>,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Names of the members who have seen the message. The sender is
    /// always included.
    pub read_by: Vec<String>,
}

/// Removes anything that looks like a markup tag.
///
/// A `<` without a closing `>` is kept as text.
fn strip_tags(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => rest = &rest[open + close + 1..],
            None => {
                rest = &rest[open..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Turns raw client input into the text that will be stored.
pub fn sanitize_message(raw: &str) -> GameResult<String> {
    let text = strip_tags(raw).trim().to_string();
    if text.is_empty() {
        return Err(GameError::MessageRejected("message is empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(GameError::MessageRejected(format!(
            "message too long (max {MAX_MESSAGE_LEN} characters)"
        )));
    }
    let lower = text.to_lowercase();
    if FORBIDDEN_WORDS.iter().any(|word| lower.contains(word)) {
        return Err(GameError::MessageRejected(
            "message contains inappropriate content".into(),
        ));
    }
    Ok(text)
}

/// Bounded, ordered message history of one session.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
}

impl ChatLog {
    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == MAX_LOG_LEN {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Records that `reader` has seen the listed messages. Returns the ids
    /// that exist in the log, in request order.
    pub fn mark_read(&mut self, reader: &str, ids: &[Uuid]) -> Vec<Uuid> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.messages.iter_mut().find(|m| m.id == *id) {
                if !message.read_by.iter().any(|name| name == reader) {
                    message.read_by.push(reader.to_string());
                }
                found.push(*id);
            }
        }
        found
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
