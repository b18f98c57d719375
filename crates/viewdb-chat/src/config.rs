use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// What removing a conversation does to its messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationDeletePolicy {
    /// Leave the messages in place.
    #[default]
    Retain,
    /// Remove the messages in the same transaction.
    Cascade,
    /// Refuse to remove a conversation that still has messages.
    Restrict,
}

/// Chat-layer settings, independent of the store's own configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub delete_policy: ConversationDeletePolicy,
    /// Install node links so messages can be addressed by cloud node id.
    pub install_links: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            delete_policy: ConversationDeletePolicy::Retain,
            install_links: true,
        }
    }
}

impl ChatConfig {
    pub fn from_toml_str(text: &str) -> ChatResult<Self> {
        toml::from_str(text).map_err(|e| ChatError::Config(e.to_string()))
    }

    pub fn with_delete_policy(mut self, delete_policy: ConversationDeletePolicy) -> Self {
        self.delete_policy = delete_policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ChatConfig::default();
        assert_eq!(c.delete_policy, ConversationDeletePolicy::Retain);
        assert!(c.install_links);
    }

    #[test]
    fn parse_toml() {
        let c = ChatConfig::from_toml_str("delete_policy = \"cascade\"").unwrap();
        assert_eq!(c.delete_policy, ConversationDeletePolicy::Cascade);
        assert!(c.install_links);

        let c = ChatConfig::from_toml_str("delete_policy = \"restrict\"\ninstall_links = false").unwrap();
        assert_eq!(c.delete_policy, ConversationDeletePolicy::Restrict);
        assert!(!c.install_links);
    }

    #[test]
    fn unknown_policy_rejected() {
        let err = ChatConfig::from_toml_str("delete_policy = \"archive\"").unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }
}
