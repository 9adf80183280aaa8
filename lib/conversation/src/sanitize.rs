//! History clean-up applied before every request.

use chorus_ai::{Content, ContentPart, Message};
use std::collections::HashSet;

/// Appended to text that was cut short.
pub const TRUNCATION_MARKER: &str = "(truncated)";

/// Cuts `text` to at most `max_chars` characters, marking the cut.
#[must_use]
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((end, _)) => format!("{}\n{TRUNCATION_MARKER}", &text[..end]),
    }
}

/// Returns a copy of `history` that is safe to send.
///
/// String contents are truncated, malformed or empty parts are removed,
/// user messages left without content are dropped, and tool results whose
/// call is not announced by an earlier assistant message are dropped.
#[must_use]
pub fn sanitize_history(history: &[Message], max_content_chars: usize) -> Vec<Message> {
    let cleaned = history
        .iter()
        .filter_map(|message| sanitize_message(message, max_content_chars))
        .collect();
    drop_orphan_tool_results(cleaned)
}

fn sanitize_message(message: &Message, max_chars: usize) -> Option<Message> {
    let message = match message {
        Message::System { content } => Message::system(truncate_text(content, max_chars)),
        Message::User { content } => {
            let content = sanitize_content(content, max_chars)?;
            Message::User { content }
        }
        Message::Assistant {
            content,
            tool_calls,
        } => Message::Assistant {
            content: content.as_deref().map(|c| truncate_text(c, max_chars)),
            tool_calls: tool_calls.clone(),
        },
        Message::Tool {
            tool_call_id,
            content,
        } => Message::tool(tool_call_id.clone(), truncate_text(content, max_chars)),
    };
    Some(message)
}

fn sanitize_content(content: &Content, max_chars: usize) -> Option<Content> {
    match content {
        Content::Text(text) if text.is_empty() => None,
        Content::Text(text) => Some(Content::Text(truncate_text(text, max_chars))),
        Content::Parts(parts) => {
            let parts: Vec<ContentPart> = parts
                .iter()
                .filter(|part| part.is_well_formed())
                .map(|part| match part {
                    ContentPart::Text { text } => ContentPart::text(truncate_text(text, max_chars)),
                    other => other.clone(),
                })
                .collect();
            (!parts.is_empty()).then_some(Content::Parts(parts))
        }
    }
}

/// Limits `messages` to `max` entries.
///
/// Every system message is kept; the remaining room goes to the most recent
/// other messages, and at least the last message always survives. Tool
/// results orphaned by the cut are removed too.
#[must_use]
pub fn cap_messages(messages: Vec<Message>, max: usize) -> Vec<Message> {
    if messages.len() <= max {
        return messages;
    }

    let system_count = messages.iter().filter(|m| m.is_system()).count();
    let keep_others = max.saturating_sub(system_count).max(1);
    let other_count = messages.len() - system_count;
    let mut to_skip = other_count.saturating_sub(keep_others);

    let capped = messages
        .into_iter()
        .filter(|message| {
            if message.is_system() || to_skip == 0 {
                return true;
            }
            to_skip -= 1;
            false
        })
        .collect();
    drop_orphan_tool_results(capped)
}

fn drop_orphan_tool_results(messages: Vec<Message>) -> Vec<Message> {
    let mut announced = HashSet::new();
    messages
        .into_iter()
        .filter(|message| match message {
            Message::Assistant { tool_calls, .. } => {
                announced.extend(tool_calls.iter().map(|call| call.id.clone()));
                true
            }
            Message::Tool { tool_call_id, .. } => announced.contains(tool_call_id),
            _ => true,
        })
        .collect()
}
