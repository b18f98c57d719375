//! Hooks keeping `Conversation::last_activity` in step with its messages.
//!
//! Message writes issued by another hook are left alone: the hook that
//! issued them owns the conversation for that write. This includes message
//! writes from `will_commit` hooks.

use tracing::{debug, warn};
use viewdb_hooks::Hooks;
use viewdb_store::{AnyObject, Reader, StoreError, StoreResult, WriteTransaction};
use viewdb_types::Timestamp;
use viewdb_view::ViewAccess;

use crate::config::ConversationDeletePolicy;
use crate::model::{Conversation, Message, CONVERSATIONS, MESSAGES};
use crate::views::MESSAGES_VIEW;

/// The chat hooks extension for `policy`.
pub fn chat_hooks(policy: ConversationDeletePolicy) -> Hooks {
    Hooks::new()
        .only([CONVERSATIONS, MESSAGES])
        .on_will_modify(|txn, collection, key, object| {
            if collection != MESSAGES || issued_by_hook(txn) {
                return Ok(());
            }
            will_modify_message(txn, key, object)
        })
        .on_did_modify(|txn, collection, _key, object| {
            if collection != MESSAGES || issued_by_hook(txn) {
                return Ok(());
            }
            match object.downcast_ref::<Message>() {
                Some(message) => did_modify_message(txn, message),
                None => Ok(()),
            }
        })
        .on_will_remove(move |txn, collection, key| match collection {
            MESSAGES if !issued_by_hook(txn) => will_remove_message(txn, key),
            CONVERSATIONS => will_remove_conversation(txn, key, policy),
            _ => Ok(()),
        })
        .on_will_remove_all(move |txn, collection| {
            if collection == CONVERSATIONS {
                will_remove_all_conversations(txn, policy)
            } else {
                Ok(())
            }
        })
        .on_did_remove_all(|txn, collection| {
            if collection != MESSAGES || issued_by_hook(txn) {
                return Ok(());
            }
            reset_all_conversations(txn)
        })
}

fn issued_by_hook(txn: &WriteTransaction) -> bool {
    txn.hook_depth() > 1
}

// --- Messages ---

fn did_modify_message(txn: &mut WriteTransaction, message: &Message) -> StoreResult<()> {
    let Some(conversation) = txn.get::<Conversation>(CONVERSATIONS, &message.conversation_id)? else {
        return Ok(());
    };
    let latest = latest_date(&*txn, &message.conversation_id);
    set_or_touch(txn, &conversation, latest)
}

/// A message moving to another conversation leaves its old one first.
fn will_modify_message(txn: &mut WriteTransaction, key: &str, object: &AnyObject) -> StoreResult<()> {
    let (Some(next), Some(previous)) = (object.downcast_ref::<Message>(), txn.get::<Message>(MESSAGES, key)?)
    else {
        return Ok(());
    };
    if previous.conversation_id == next.conversation_id {
        return Ok(());
    }
    message_leaving(txn, &previous.conversation_id, key)
}

fn will_remove_message(txn: &mut WriteTransaction, key: &str) -> StoreResult<()> {
    let Some(message) = txn.get::<Message>(MESSAGES, key)? else {
        return Ok(());
    };
    message_leaving(txn, &message.conversation_id, key)
}

/// `key` is about to leave `conversation_id` and is still in the messages view.
fn message_leaving(txn: &mut WriteTransaction, conversation_id: &str, key: &str) -> StoreResult<()> {
    let Some(conversation) = txn.get::<Conversation>(CONVERSATIONS, conversation_id)? else {
        return Ok(());
    };
    let replacement = date_without_latest(txn, conversation_id, key);
    set_or_touch(txn, &conversation, replacement)
}

/// Every message is gone, so every conversation is back at the epoch.
fn reset_all_conversations(txn: &mut WriteTransaction) -> StoreResult<()> {
    for key in txn.keys(CONVERSATIONS) {
        let Some(conversation) = txn.get::<Conversation>(CONVERSATIONS, &key)? else {
            continue;
        };
        if !conversation.last_activity.is_epoch() {
            txn.set(CONVERSATIONS, &key, conversation.with_last_activity(Timestamp::EPOCH))?;
        }
    }
    Ok(())
}

/// Store `last_activity` on the conversation if it moved, else touch it so
/// observers of conversations still see the message change.
fn set_or_touch(
    txn: &mut WriteTransaction,
    conversation: &Conversation,
    last_activity: Option<Timestamp>,
) -> StoreResult<()> {
    match last_activity {
        Some(last_activity) if last_activity != conversation.last_activity => {
            debug!(
                conversation = conversation.id(),
                from = %conversation.last_activity,
                to = %last_activity,
                "updating last activity"
            );
            txn.set(CONVERSATIONS, conversation.id(), conversation.with_last_activity(last_activity))
        }
        _ => {
            txn.touch(CONVERSATIONS, conversation.id());
            Ok(())
        }
    }
}

/// Date of the newest message in `conversation_id`.
pub(crate) fn latest_date<R: Reader + ?Sized>(txn: &R, conversation_id: &str) -> Option<Timestamp> {
    let view = txn.view(MESSAGES_VIEW).ok()?;
    view.last_object::<Message>(conversation_id)
        .ok()
        .flatten()
        .map(|message| message.date)
}

/// If `key` is the newest message in `conversation_id`, the date the
/// conversation falls back to once it is gone. `None` if `key` is not the
/// newest.
fn date_without_latest(txn: &WriteTransaction, conversation_id: &str, key: &str) -> Option<Timestamp> {
    let view = txn.view(MESSAGES_VIEW).ok()?;
    let count = view.count(conversation_id);
    let newest = view.key_at(count.checked_sub(1)?, conversation_id)?;
    if newest.key() != key {
        return None;
    }
    if count < 2 {
        return Some(Timestamp::EPOCH);
    }
    view.object_at::<Message>(count - 2, conversation_id)
        .ok()
        .flatten()
        .map(|message| message.date)
}

// --- Conversations ---

fn will_remove_conversation(
    txn: &mut WriteTransaction,
    key: &str,
    policy: ConversationDeletePolicy,
) -> StoreResult<()> {
    match policy {
        ConversationDeletePolicy::Retain => Ok(()),
        ConversationDeletePolicy::Cascade => {
            let keys = message_keys(&*txn, key)?;
            debug!(conversation = key, messages = keys.len(), "removing conversation messages");
            for message in keys {
                txn.remove(MESSAGES, &message)?;
            }
            Ok(())
        }
        ConversationDeletePolicy::Restrict => {
            let count = message_keys(&*txn, key)?.len();
            if count == 0 {
                return Ok(());
            }
            warn!(conversation = key, messages = count, "conversation still has messages");
            Err(StoreError::Aborted(format!(
                "conversation {key} still has {count} messages"
            )))
        }
    }
}

fn will_remove_all_conversations(
    txn: &mut WriteTransaction,
    policy: ConversationDeletePolicy,
) -> StoreResult<()> {
    match policy {
        ConversationDeletePolicy::Retain => Ok(()),
        ConversationDeletePolicy::Cascade => txn.remove_all(MESSAGES).map(|_| ()),
        ConversationDeletePolicy::Restrict => {
            let count = txn.count(MESSAGES);
            if count == 0 {
                return Ok(());
            }
            warn!(messages = count, "conversations still have messages");
            Err(StoreError::Aborted(format!("{count} messages still reference conversations")))
        }
    }
}

/// Keys of the messages in `conversation_id`, from the messages view when
/// it is registered and by scanning the collection otherwise.
pub(crate) fn message_keys<R: Reader + ?Sized>(txn: &R, conversation_id: &str) -> StoreResult<Vec<String>> {
    if let Ok(view) = txn.view(MESSAGES_VIEW) {
        return Ok(view
            .iter_group(conversation_id)
            .map(|entry| entry.id.key().to_string())
            .collect());
    }
    let mut keys = Vec::new();
    for key in txn.keys(MESSAGES) {
        if let Some(message) = txn.get::<Message>(MESSAGES, &key)? {
            if message.conversation_id == conversation_id {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}
