//! The three chat views.
//!
//! Bump a view's tag whenever its grouping, sorting, or filtering logic
//! changes; the next registration then rebuilds it.

use viewdb_view::{AutoView, FilteredView, ViewOptions};

use crate::model::{Conversation, Message, CONVERSATIONS, MESSAGES};

/// Every conversation in one group (`""`), most recent activity first.
pub const CONVERSATIONS_VIEW: &str = "ConversationsView";

/// Messages grouped by conversation id, oldest first.
pub const MESSAGES_VIEW: &str = "MessagesView";

/// The unread subset of [`MESSAGES_VIEW`], same groups and order.
pub const UNREAD_MESSAGES_VIEW: &str = "UnreadMessagesView";

/// Name of the chat hooks extension.
pub const HOOKS: &str = "hooks";

/// The single group of [`CONVERSATIONS_VIEW`].
pub const ALL_CONVERSATIONS: &str = "";

pub fn conversations_view() -> AutoView<Conversation> {
    AutoView::new(
        |_collection: &str, _key: &str, _conversation: &Conversation| {
            Some(ALL_CONVERSATIONS.to_string())
        },
        |a: &Conversation, b: &Conversation| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.remote_user_id.cmp(&b.remote_user_id))
        },
        "1",
    )
    .with_options(ViewOptions::allow([CONVERSATIONS]))
}

pub fn messages_view() -> AutoView<Message> {
    AutoView::new(
        |_collection: &str, _key: &str, message: &Message| Some(message.conversation_id.clone()),
        |a: &Message, b: &Message| a.date.cmp(&b.date).then_with(|| a.uuid.cmp(&b.uuid)),
        "1",
    )
    .with_options(ViewOptions::allow([MESSAGES]))
}

pub fn unread_messages_view() -> FilteredView<Message> {
    FilteredView::new(
        MESSAGES_VIEW,
        |_group: &str, _collection: &str, _key: &str, message: &Message| !message.is_read,
        "2",
    )
}
