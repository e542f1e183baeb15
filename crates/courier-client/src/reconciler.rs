//! Merging server-originated state into a conversation's message list.
//!
//! Everything here is a pure function over `&mut Vec<Message>` returning
//! whether the list changed. Matching order is correlation id, then the
//! temporary id (confirmations only), then server id. Every status change
//! goes through [`Message::apply_status`], so out-of-order or duplicate
//! events are absorbed rather than regressing a message.

use chrono::{DateTime, Utc};
use courier_shared::{DeliveryStatus, Message, MessageId, UserId};

fn position(messages: &[Message], incoming: &Message, temp_id: Option<&MessageId>) -> Option<usize> {
    if let Some(key) = incoming.correlation_id.as_deref() {
        if let Some(i) = messages
            .iter()
            .position(|m| m.correlation_id.as_deref() == Some(key))
        {
            return Some(i);
        }
    }
    if let Some(i) = temp_id.and_then(|temp| messages.iter().position(|m| &m.id == temp)) {
        return Some(i);
    }
    messages.iter().position(|m| m.id == incoming.id)
}

/// Index of a locally created message, by its original id or correlation id.
pub fn position_of_local(
    messages: &[Message],
    local_id: &MessageId,
    correlation_id: Option<&str>,
) -> Option<usize> {
    messages.iter().position(|m| &m.id == local_id).or_else(|| {
        let key = correlation_id?;
        messages
            .iter()
            .position(|m| m.correlation_id.as_deref() == Some(key))
    })
}

/// Put `incoming` at `index`, keeping the furthest-along status and every
/// read receipt either copy had.
fn replace_at(messages: &mut [Message], index: usize, mut incoming: Message) -> bool {
    let existing = &messages[index];
    incoming.delivery_status = merged_status(existing.delivery_status, incoming.delivery_status);
    for receipt in &existing.read_by {
        if !incoming.is_read_by(&receipt.user_id) {
            incoming.read_by.push(receipt.clone());
        }
    }
    if incoming.correlation_id.is_none() {
        incoming.correlation_id = existing.correlation_id.clone();
    }
    if messages[index] == incoming {
        return false;
    }
    messages[index] = incoming;
    true
}

/// A server copy never drags a local record backwards, and a local
/// `sending`/`failed` record is at least `sent` once the server has it.
fn merged_status(current: DeliveryStatus, incoming: DeliveryStatus) -> DeliveryStatus {
    let confirmed = match current {
        DeliveryStatus::Sending | DeliveryStatus::Failed => {
            courier_shared::apply_status(current, DeliveryStatus::Sent)
        }
        other => other,
    };
    courier_shared::apply_status(confirmed, incoming)
}

/// Drop any other record carrying the id at `keep`.
fn dedupe(messages: &mut Vec<Message>, keep: usize) -> bool {
    let id = messages[keep].id.clone();
    let mut index = 0;
    let mut removed = false;
    messages.retain(|m| {
        let duplicate = index != keep && m.id == id;
        index += 1;
        removed |= duplicate;
        !duplicate
    });
    removed
}

/// `new_message`: replace the record for the same logical message in
/// place, or append.
pub fn upsert_message(messages: &mut Vec<Message>, incoming: Message) -> bool {
    match position(messages, &incoming, None) {
        Some(index) => {
            let replaced = replace_at(messages, index, incoming);
            dedupe(messages, index) || replaced
        }
        None => {
            messages.push(incoming);
            true
        }
    }
}

/// `message_sent`: swap the optimistic record for the canonical one,
/// keeping its position. Unknown messages are appended.
pub fn confirm_sent(
    messages: &mut Vec<Message>,
    confirmed: Message,
    temp_id: Option<&MessageId>,
) -> bool {
    match position(messages, &confirmed, temp_id) {
        Some(index) => {
            let replaced = replace_at(messages, index, confirmed);
            dedupe(messages, index) || replaced
        }
        None => {
            messages.push(confirmed);
            true
        }
    }
}

/// Apply `status` to one message. Returns whether it changed.
pub fn set_status(messages: &mut [Message], index: usize, status: DeliveryStatus) -> bool {
    messages
        .get_mut(index)
        .map(|m| m.apply_status(status))
        .unwrap_or(false)
}

/// `message_delivered`. Returns the number of messages that moved.
pub fn apply_delivered(messages: &mut [Message], ids: &[MessageId]) -> usize {
    messages
        .iter_mut()
        .filter(|m| ids.contains(&m.id))
        .map(|m| m.apply_status(DeliveryStatus::Delivered))
        .filter(|changed| *changed)
        .count()
}

/// `messages_read` from `reader`.
///
/// With explicit ids, those messages become read. Without, every message of
/// `own_user` still at `sent` or `delivered` does. Each affected message
/// gains a receipt for `reader`. A reader's own messages are never touched.
pub fn apply_read(
    messages: &mut [Message],
    reader: &UserId,
    ids: Option<&[MessageId]>,
    own_user: &UserId,
    read_at: DateTime<Utc>,
) -> usize {
    let mut changed = 0;
    for message in messages.iter_mut() {
        if &message.sender_id == reader {
            continue;
        }
        let targeted = match ids {
            Some(ids) => ids.contains(&message.id),
            None => {
                &message.sender_id == own_user
                    && matches!(
                        message.delivery_status,
                        DeliveryStatus::Sent | DeliveryStatus::Delivered
                    )
            }
        };
        if !targeted {
            continue;
        }
        let moved = message.apply_status(DeliveryStatus::Read);
        let stamped = message.add_read_receipt(reader, read_at);
        if moved || stamped {
            changed += 1;
        }
    }
    changed
}

/// Local `mark_read`: every peer message not yet read by `own_user`.
pub fn mark_peer_messages_read(
    messages: &mut [Message],
    own_user: &UserId,
    read_at: DateTime<Utc>,
) -> usize {
    let mut changed = 0;
    for message in messages
        .iter_mut()
        .filter(|m| &m.sender_id != own_user && !m.is_read_by(own_user))
    {
        message.add_read_receipt(own_user, read_at);
        message.apply_status(DeliveryStatus::Read);
        changed += 1;
    }
    changed
}

/// Merge fetched history. Records already held are merged in place.
pub fn merge_history(messages: &mut Vec<Message>, history: Vec<Message>) -> bool {
    let mut changed = false;
    for message in history {
        changed |= upsert_message(messages, message);
    }
    changed
}

/// Give up on the unacknowledged message at `index`.
pub fn fail_unconfirmed(messages: &mut [Message], index: usize) -> bool {
    messages[index].fail_unconfirmed()
}

pub fn remove_message(messages: &mut Vec<Message>, id: &MessageId) -> bool {
    let before = messages.len();
    messages.retain(|m| &m.id != id);
    messages.len() != before
}
