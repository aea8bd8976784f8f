//! Interfaces to the systems around the engine: identity resolution and the
//! chat notification sink.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Error;

/// Maps a counterpart's rotating key to their stable actor id.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// `None` when the key expired or never existed.
    async fn resolve(&self, key: &str) -> Result<Option<String>, Error>;
}

/// In-process resolver backed by a key table.
#[derive(Clone, Default)]
pub struct StaticResolver {
    keys: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver where every actor id is also its own key.
    pub fn identity<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resolver = Self::new();
        for id in ids {
            let id = id.into();
            resolver.insert(id.clone(), id);
        }
        resolver
    }

    pub fn insert(&self, key: impl Into<String>, actor_id: impl Into<String>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(key.into(), actor_id.into());
        }
    }

    /// Replace every key of `actor_id` with `new_key`.
    pub fn rotate(&self, actor_id: &str, new_key: impl Into<String>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.retain(|_, id| id != actor_id);
            keys.insert(new_key.into(), actor_id.to_string());
        }
    }

    pub fn revoke(&self, key: &str) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(key);
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, key: &str) -> Result<Option<String>, Error> {
        let keys = self
            .keys
            .read()
            .map_err(|_| Error::Storage("resolver table poisoned".to_string()))?;
        Ok(keys.get(key).cloned())
    }
}

/// Best-effort sink for system messages posted into a conversation.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn post(&self, conversation_key: &str, text: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn post(&self, _conversation_key: &str, _text: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub conversation_key: String,
    pub text: String,
}

/// Forwards notifications onto an mpsc channel for a transport to drain.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn post(&self, conversation_key: &str, text: &str) -> Result<(), Error> {
        self.sender
            .send(Notification {
                conversation_key: conversation_key.to_string(),
                text: text.to_string(),
            })
            .map_err(|_| Error::Unavailable("notification channel closed".to_string()))
    }
}
