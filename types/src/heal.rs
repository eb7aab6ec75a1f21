//! Transcript repair applied before every request.
//!
//! The provider rejects transcripts where two adjacent messages share a role,
//! where a message has no content, or where a text block is blank. Healing
//! fixes all three without losing any text: blank blocks carry no text, and
//! same-role neighbours are merged rather than dropped.

use crate::{ContentBlock, ConversationMessage, Role};

/// Produce a transcript with strictly alternating roles.
///
/// Pure and total: every input has a healed form. Within a merged user turn,
/// `tool_result` blocks are hoisted ahead of the other blocks (stable order),
/// since the provider requires results to open a user turn.
#[must_use]
pub fn heal_messages(messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
    heal_with_origins(messages).0
}

/// For each message [`heal_messages`] would return, the index of the last
/// input message folded into it.
#[must_use]
pub fn heal_origins(messages: &[ConversationMessage]) -> Vec<usize> {
    heal_with_origins(messages).1
}

fn heal_with_origins(messages: &[ConversationMessage]) -> (Vec<ConversationMessage>, Vec<usize>) {
    let mut healed: Vec<ConversationMessage> = Vec::with_capacity(messages.len());
    let mut origins: Vec<usize> = Vec::with_capacity(messages.len());

    for (index, message) in messages.iter().enumerate() {
        let content: Vec<ContentBlock> = message
            .content
            .iter()
            .filter(|block| !block.is_blank())
            .cloned()
            .collect();
        if content.is_empty() {
            continue;
        }

        match (healed.last_mut(), origins.last_mut()) {
            (Some(previous), Some(origin)) if previous.role == message.role => {
                previous.content.extend(content);
                *origin = index;
            }
            _ => {
                healed.push(ConversationMessage::new(message.role, content));
                origins.push(index);
            }
        }
    }

    for message in &mut healed {
        if message.role == Role::User {
            hoist_tool_results(&mut message.content);
        }
    }

    (healed, origins)
}

fn hoist_tool_results(content: &mut Vec<ContentBlock>) {
    let first_other = content.iter().position(|b| !b.is_tool_result());
    let needs_hoist = first_other
        .is_some_and(|index| content[index..].iter().any(ContentBlock::is_tool_result));
    if !needs_hoist {
        return;
    }
    let (mut results, others): (Vec<_>, Vec<_>) = std::mem::take(content)
        .into_iter()
        .partition(ContentBlock::is_tool_result);
    results.extend(others);
    *content = results;
}
