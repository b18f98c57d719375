//! Chat model on viewdb.
//!
//! Conversations and messages live in two collections. Three views order
//! them for display, and a hooks extension keeps every conversation's
//! `last_activity` equal to its newest message inside the same commit.
//!
//! # Key Types
//!
//! - [`Conversation`] / [`Message`] -- the stored records
//! - [`configure_database`] -- registers collections, views, hooks, and links
//! - [`ChatReader`] / [`ChatWriter`] -- typed access on transactions
//! - [`ChatConfig`] -- delete policy and link installation
//!
//! # Design Rules
//!
//! 1. `last_activity` is written only by the hooks and by [`ChatWriter::set_conversation`].
//! 2. A conversation without messages reports the epoch.
//! 3. Removing a conversation follows [`ConversationDeletePolicy`].

pub mod api;
pub mod config;
pub mod error;
pub mod hooks;
pub mod model;
pub mod views;

pub use api::{configure_database, ChatReader, ChatWriter};
pub use config::{ChatConfig, ConversationDeletePolicy};
pub use error::{ChatError, ChatResult};
pub use hooks::chat_hooks;
pub use model::{Conversation, Message, RemoteDropbox, CONVERSATIONS, MESSAGES};
pub use views::{
    conversations_view, messages_view, unread_messages_view, ALL_CONVERSATIONS,
    CONVERSATIONS_VIEW, HOOKS, MESSAGES_VIEW, UNREAD_MESSAGES_VIEW,
};
