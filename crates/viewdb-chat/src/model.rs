//! Conversation and message records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use viewdb_types::Timestamp;

/// Collection holding [`Conversation`]s keyed by remote user id.
pub const CONVERSATIONS: &str = "conversations";

/// Collection holding [`Message`]s keyed by message uuid.
pub const MESSAGES: &str = "messages";

/// Where the remote participant receives messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDropbox {
    pub tree_id: String,
    pub path: String,
}

/// A one-on-one conversation.
///
/// `last_activity` tracks the newest message in the conversation and is
/// kept current by the chat hooks; it is [`Timestamp::EPOCH`] while the
/// conversation has no messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub remote_user_id: String,
    pub last_activity: Timestamp,
    pub remote_dropbox: Option<RemoteDropbox>,
}

impl Conversation {
    pub fn new(remote_user_id: impl Into<String>) -> Self {
        Self {
            remote_user_id: remote_user_id.into(),
            last_activity: Timestamp::EPOCH,
            remote_dropbox: None,
        }
    }

    /// Database key; one-on-one conversations are keyed by the other user.
    pub fn id(&self) -> &str {
        &self.remote_user_id
    }

    pub fn with_last_activity(&self, last_activity: Timestamp) -> Self {
        Self {
            last_activity,
            ..self.clone()
        }
    }

    pub fn with_remote_dropbox(&self, remote_dropbox: Option<RemoteDropbox>) -> Self {
        Self {
            remote_dropbox,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub conversation_id: String,
    pub date: Timestamp,
    pub is_read: bool,
    pub is_attachment: bool,
}

impl Message {
    /// A new unread text message with a fresh time-ordered uuid.
    pub fn new(conversation_id: impl Into<String>, date: Timestamp) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            conversation_id: conversation_id.into(),
            date,
            is_read: false,
            is_attachment: false,
        }
    }

    /// Database key: the hyphenated uuid.
    pub fn id(&self) -> String {
        self.uuid.to_string()
    }

    pub fn read(&self) -> Self {
        Self {
            is_read: true,
            ..self.clone()
        }
    }

    pub fn attachment(&self) -> Self {
        Self {
            is_attachment: true,
            ..self.clone()
        }
    }
}
