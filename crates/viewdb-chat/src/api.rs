//! Database setup and typed chat access.

use std::sync::Arc;

use tracing::{debug, error, info};
use viewdb_links::{LinkReader, NodeLinks};
use viewdb_store::{
    Database, Extension, Format, Reader, Registration, StoreResult, WriteTransaction,
};
use viewdb_types::{NodeId, Timestamp};
use viewdb_view::ViewAccess;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::hooks::{chat_hooks, latest_date, message_keys};
use crate::model::{Conversation, Message, CONVERSATIONS, MESSAGES};
use crate::views::{
    conversations_view, messages_view, unread_messages_view, ALL_CONVERSATIONS,
    CONVERSATIONS_VIEW, HOOKS, MESSAGES_VIEW, UNREAD_MESSAGES_VIEW,
};

/// Register the chat collections, views, and hooks on `db`.
///
/// Extensions register in dependency order; each one completes before the
/// next starts. Returns every extension's outcome in that order.
pub async fn configure_database(
    db: &Database,
    config: &ChatConfig,
) -> ChatResult<Vec<(&'static str, Registration)>> {
    db.register_collection::<Conversation>(CONVERSATIONS, Format::Json)?;
    db.register_collection::<Message>(MESSAGES, Format::Json)?;

    let outcomes = vec![
        (CONVERSATIONS_VIEW, register(db, CONVERSATIONS_VIEW, conversations_view()).await?),
        (MESSAGES_VIEW, register(db, MESSAGES_VIEW, messages_view()).await?),
        (UNREAD_MESSAGES_VIEW, register(db, UNREAD_MESSAGES_VIEW, unread_messages_view()).await?),
        (HOOKS, register(db, HOOKS, chat_hooks(config.delete_policy)).await?),
    ];
    if config.install_links {
        NodeLinks::install(db)?;
    }

    info!(
        policy = ?config.delete_policy,
        links = config.install_links,
        "chat database configured"
    );
    Ok(outcomes)
}

async fn register<E: Extension>(
    db: &Database,
    name: &'static str,
    extension: E,
) -> ChatResult<Registration> {
    let handle = db.async_register(name, extension, move |ready| {
        if !ready {
            error!(extension = name, "error registering extension");
        }
    });
    let not_ready = |reason: String| ChatError::ExtensionNotReady {
        name: name.to_string(),
        reason,
    };
    match handle.await {
        Ok(Ok(outcome)) => {
            debug!(extension = name, ?outcome, "extension ready");
            Ok(outcome)
        }
        Ok(Err(e)) => Err(not_ready(e.to_string())),
        Err(e) => Err(not_ready(e.to_string())),
    }
}

/// Chat queries for anything that can read the store.
pub trait ChatReader: Reader {
    fn conversation(&self, id: &str) -> ChatResult<Option<Arc<Conversation>>> {
        Ok(self.get::<Conversation>(CONVERSATIONS, id)?)
    }

    fn message(&self, id: &str) -> ChatResult<Option<Arc<Message>>> {
        Ok(self.get::<Message>(MESSAGES, id)?)
    }

    /// All conversations, most recent activity first.
    fn conversations_by_activity(&self) -> ChatResult<Vec<Arc<Conversation>>> {
        Ok(self.view(CONVERSATIONS_VIEW)?.objects(ALL_CONVERSATIONS)?)
    }

    /// Messages of one conversation, oldest first.
    fn messages_in(&self, conversation_id: &str) -> ChatResult<Vec<Arc<Message>>> {
        Ok(self.view(MESSAGES_VIEW)?.objects(conversation_id)?)
    }

    fn latest_message(&self, conversation_id: &str) -> ChatResult<Option<Arc<Message>>> {
        Ok(self.view(MESSAGES_VIEW)?.last_object(conversation_id)?)
    }

    fn unread_messages(&self, conversation_id: &str) -> ChatResult<Vec<Arc<Message>>> {
        Ok(self.view(UNREAD_MESSAGES_VIEW)?.objects(conversation_id)?)
    }

    fn unread_count(&self, conversation_id: &str) -> ChatResult<usize> {
        Ok(self.view(UNREAD_MESSAGES_VIEW)?.count(conversation_id))
    }

    /// The message a cloud node is linked to, if it is linked to a message.
    fn message_for_node(&self, node: &NodeId) -> ChatResult<Option<Arc<Message>>> {
        match self.linked_collection_and_key(node) {
            Some((MESSAGES, key)) => self.message(key),
            _ => Ok(None),
        }
    }
}

impl<R: Reader + ?Sized> ChatReader for R {}

/// Chat writes inside a write transaction.
pub trait ChatWriter {
    /// Store a conversation. While the messages view is registered its
    /// `last_activity` is derived from the conversation's messages.
    fn set_conversation(&mut self, conversation: Conversation) -> StoreResult<()>;

    fn set_message(&mut self, message: Message) -> StoreResult<()>;

    /// Mark a message read. Returns `false` if the message does not exist.
    fn mark_read(&mut self, message_id: &str) -> StoreResult<bool>;

    /// Report a conversation as changed without modifying it.
    fn touch_conversation(&mut self, id: &str) -> bool;

    fn remove_message(&mut self, id: &str) -> StoreResult<bool>;

    /// Remove a conversation, subject to the configured delete policy.
    fn remove_conversation(&mut self, id: &str) -> StoreResult<bool>;

    /// Number of messages stored for a conversation.
    fn message_count(&self, conversation_id: &str) -> StoreResult<usize>;
}

impl ChatWriter for WriteTransaction {
    fn set_conversation(&mut self, conversation: Conversation) -> StoreResult<()> {
        let conversation = if self.view(MESSAGES_VIEW).is_ok() {
            let last_activity = latest_date(&*self, conversation.id()).unwrap_or(Timestamp::EPOCH);
            conversation.with_last_activity(last_activity)
        } else {
            conversation
        };
        let id = conversation.id().to_string();
        self.set(CONVERSATIONS, &id, conversation)
    }

    fn set_message(&mut self, message: Message) -> StoreResult<()> {
        let id = message.id();
        self.set(MESSAGES, &id, message)
    }

    fn mark_read(&mut self, message_id: &str) -> StoreResult<bool> {
        let Some(message) = self.get::<Message>(MESSAGES, message_id)? else {
            return Ok(false);
        };
        if !message.is_read {
            self.set(MESSAGES, message_id, message.read())?;
        }
        Ok(true)
    }

    fn touch_conversation(&mut self, id: &str) -> bool {
        self.touch(CONVERSATIONS, id)
    }

    fn remove_message(&mut self, id: &str) -> StoreResult<bool> {
        self.remove(MESSAGES, id)
    }

    fn remove_conversation(&mut self, id: &str) -> StoreResult<bool> {
        self.remove(CONVERSATIONS, id)
    }

    fn message_count(&self, conversation_id: &str) -> StoreResult<usize> {
        Ok(message_keys(self, conversation_id)?.len())
    }
}
