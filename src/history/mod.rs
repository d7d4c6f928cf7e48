mod file;
mod memory;

pub use file::FileSettingsStore;
pub use memory::MemorySettingsStore;

use async_trait::async_trait;
use log::{ info, warn };
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::llm::RequestConfig;
use crate::models::chat::Conversation;

pub const HISTORY_SLOT: &str = "chat_session.history";
pub const REQUEST_CONFIG_SLOT: &str = "chat_session.request_config";

/// Durable string-keyed settings, the substrate session state is saved into.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ChatError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    File,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreTypeError {
    message: String,
}

impl fmt::Display for ParseStoreTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseStoreTypeError {}

impl FromStr for StoreType {
    type Err = ParseStoreTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StoreType::File),
            "memory" => Ok(StoreType::Memory),
            _ =>
                Err(ParseStoreTypeError {
                    message: format!("Invalid settings store type: '{}'", s),
                }),
        }
    }
}

pub fn create_settings_store(args: &Args) -> Result<Arc<dyn SettingsStore>, ChatError> {
    let store_type: StoreType = args.store_type
        .parse()
        .map_err(|e: ParseStoreTypeError| ChatError::Persistence(e.to_string()))?;
    match store_type {
        StoreType::File => {
            let store = FileSettingsStore::new(&args.store_path);
            info!("Session state will be stored in: {}", store.path().display());
            Ok(Arc::new(store))
        }
        StoreType::Memory => {
            info!("Session state will be kept in memory only");
            Ok(Arc::new(MemorySettingsStore::new()))
        }
    }
}

/// Saves and restores a session's conversation and request config as two
/// independent JSON slots.
#[derive(Clone)]
pub struct SessionPersistence {
    store: Arc<dyn SettingsStore>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub async fn save(
        &self,
        conversation: &Conversation,
        config: &RequestConfig
    ) -> Result<(), ChatError> {
        let history_json = serde_json::to_string(conversation).map_err(|e|
            ChatError::Persistence(format!("Failed to encode chat history: {}", e))
        )?;
        let config_json = serde_json::to_string(config).map_err(|e|
            ChatError::Persistence(format!("Failed to encode request config: {}", e))
        )?;

        self.store.set(HISTORY_SLOT, &history_json).await?;
        self.store.set(REQUEST_CONFIG_SLOT, &config_json).await?;
        info!("Saved {} turns of chat history", conversation.len());
        Ok(())
    }

    /// Missing, empty or undecodable slots come back as `None`. Nothing
    /// here ever fails the caller.
    pub async fn restore(&self) -> (Option<Conversation>, Option<RequestConfig>) {
        let conversation = self.load_slot::<Conversation>(HISTORY_SLOT).await;
        let config = self
            .load_slot::<RequestConfig>(REQUEST_CONFIG_SLOT).await
            .map(RequestConfig::sanitized);
        (conversation, config)
    }

    async fn load_slot<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => {
                return None;
            }
            Err(e) => {
                warn!("Failed to read '{}' from settings store: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring undecodable '{}' entry: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Turn;

    fn persistence_with(store: MemorySettingsStore) -> SessionPersistence {
        SessionPersistence::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_save_then_restore_round_trips() {
        let persistence = persistence_with(MemorySettingsStore::new());
        let conversation = Conversation::from(vec![
            Turn::new("user", "  spaced  "),
            Turn::new("assistant", "line one\nline two"),
            Turn::new("user", "unicode ✓"),
        ]);
        let config = RequestConfig::new("gpt-4o", 1.25, 90);

        persistence.save(&conversation, &config).await.unwrap();
        let (restored_conversation, restored_config) = persistence.restore().await;

        assert_eq!(restored_conversation, Some(conversation));
        assert_eq!(restored_config, Some(config));
    }

    #[tokio::test]
    async fn test_restore_from_empty_store_is_unset() {
        let persistence = persistence_with(MemorySettingsStore::new());
        let (conversation, config) = persistence.restore().await;
        assert!(conversation.is_none());
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn test_empty_slot_is_unset() {
        let store = MemorySettingsStore::new();
        store.set(HISTORY_SLOT, "   ").await.unwrap();
        let (conversation, _) = persistence_with(store).restore().await;
        assert!(conversation.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_history_does_not_affect_config() {
        let store = MemorySettingsStore::new();
        store.set(HISTORY_SLOT, "{not json").await.unwrap();
        store
            .set(REQUEST_CONFIG_SLOT, r#"{"model":"gpt-4o","temperature":0.5,"timeout_seconds":45}"#).await
            .unwrap();

        let (conversation, config) = persistence_with(store).restore().await;
        assert!(conversation.is_none());
        assert_eq!(config, Some(RequestConfig::new("gpt-4o", 0.5, 45)));
    }

    #[tokio::test]
    async fn test_corrupt_config_does_not_affect_history() {
        let store = MemorySettingsStore::new();
        store.set(HISTORY_SLOT, r#"[{"role":"user","content":"hi"}]"#).await.unwrap();
        store.set(REQUEST_CONFIG_SLOT, r#"{"model":42}"#).await.unwrap();

        let (conversation, config) = persistence_with(store).restore().await;
        assert_eq!(conversation, Some(Conversation::from(vec![Turn::new("user", "hi")])));
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn test_both_slots_corrupt() {
        let store = MemorySettingsStore::new();
        store.set(HISTORY_SLOT, "null?").await.unwrap();
        store.set(REQUEST_CONFIG_SLOT, "[]").await.unwrap();

        let (conversation, config) = persistence_with(store).restore().await;
        assert!(conversation.is_none());
        assert!(config.is_none());
    }

    #[test]
    fn test_store_type_parsing() {
        assert_eq!("File".parse::<StoreType>(), Ok(StoreType::File));
        assert_eq!(" memory ".parse::<StoreType>(), Ok(StoreType::Memory));
        assert!("redis".parse::<StoreType>().is_err());
    }
}
