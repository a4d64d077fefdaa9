//! Publishing of newly encoded output paths.
//!
//! When the shared cache is enabled every finished encode is published on
//! `<prefix>-jobs`; the cache feeder appends received paths to the library
//! cache so no full scan is needed to see them. With a `redis_url` the
//! channel is a Redis pub/sub channel shared by every worker host, otherwise
//! it only reaches this process.

use crate::config::SharedCacheConfig;
use crate::library::SharedLibraryCache;
use futures::StreamExt;
use redis::Commands;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 64;
/// Connect timeout of a single publish
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("No subscribers on channel {0}")]
    NoSubscribers(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Publisher of completed output paths.
pub trait Broadcaster: Send + Sync {
    /// Whether paths published here reach the library cache.
    fn is_active(&self) -> bool;

    fn publish(&self, path: &Path) -> Result<(), BroadcastError>;
}

/// In-process pub/sub channel.
#[derive(Debug, Clone)]
pub struct LocalBroadcast {
    channel: String,
    sender: broadcast::Sender<PathBuf>,
}

impl LocalBroadcast {
    pub fn new(channel: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channel: channel.into(),
            sender,
        }
    }

    pub fn from_config(config: &SharedCacheConfig) -> Self {
        Self::new(config.channel_name())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.sender.subscribe()
    }
}

impl Broadcaster for LocalBroadcast {
    fn is_active(&self) -> bool {
        true
    }

    fn publish(&self, path: &Path) -> Result<(), BroadcastError> {
        let receivers = self
            .sender
            .send(path.to_path_buf())
            .map_err(|_| BroadcastError::NoSubscribers(self.channel.clone()))?;
        debug!("published {} to {} receivers on {}", path.display(), receivers, self.channel);
        Ok(())
    }
}

/// Shared cache disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBroadcast;

impl Broadcaster for NoBroadcast {
    fn is_active(&self) -> bool {
        false
    }

    fn publish(&self, _path: &Path) -> Result<(), BroadcastError> {
        Ok(())
    }
}

/// Redis pub/sub channel.
///
/// Publishing goes straight to the server. [`spawn_relay`](Self::spawn_relay)
/// subscribes to the same channel and hands every message to the local
/// receivers returned by [`subscribe`](Self::subscribe), including paths this
/// host published itself.
#[derive(Debug, Clone)]
pub struct RedisBroadcast {
    client: redis::Client,
    local: LocalBroadcast,
}

impl RedisBroadcast {
    /// Parses the URL; no connection is made until the first publish or relay.
    pub fn open(config: &SharedCacheConfig) -> Result<Self, BroadcastError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            local: LocalBroadcast::from_config(config),
        })
    }

    pub fn channel(&self) -> &str {
        self.local.channel()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.local.subscribe()
    }

    /// Forward messages from the Redis channel until `cancel` fires or the
    /// subscription drops.
    pub fn spawn_relay(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.client.clone();
        let local = self.local.clone();
        tokio::spawn(async move {
            let channel = local.channel().to_string();
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!("redis: could not connect for {}: {}", channel, e);
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!("redis: could not subscribe to {}: {}", channel, e);
                return;
            }
            info!("redis: starting broadcast subscription to {}", channel);

            let messages = pubsub.on_message();
            tokio::pin!(messages);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => match message {
                        Some(message) => match message.get_payload::<String>() {
                            Ok(payload) => {
                                // no local receiver just means the feeder is gone
                                let _ = local.sender.send(PathBuf::from(payload));
                            }
                            Err(e) => warn!("redis: unreadable message on {}: {}", channel, e),
                        },
                        None => {
                            warn!("redis: subscription to {} closed", channel);
                            break;
                        }
                    },
                }
            }
            debug!("redis relay stopped");
        })
    }
}

impl Broadcaster for RedisBroadcast {
    fn is_active(&self) -> bool {
        true
    }

    fn publish(&self, path: &Path) -> Result<(), BroadcastError> {
        let mut connection = self.client.get_connection_with_timeout(PUBLISH_TIMEOUT)?;
        let receivers: i64 = connection.publish(self.channel(), path.to_string_lossy().as_ref())?;
        if receivers == 0 {
            return Err(BroadcastError::NoSubscribers(self.channel().to_string()));
        }
        debug!("published {} to {} redis subscribers on {}", path.display(), receivers, self.channel());
        Ok(())
    }
}

/// How finished encodes reach the library caches, fixed at startup.
#[derive(Debug, Clone)]
pub enum CacheTransport {
    Disabled,
    Local(LocalBroadcast),
    Redis(RedisBroadcast),
}

impl CacheTransport {
    /// Transport for `config`. An unusable Redis URL disables the shared cache.
    pub fn from_config(config: &SharedCacheConfig) -> Self {
        if !config.enabled {
            return CacheTransport::Disabled;
        }
        if config.redis_url.is_empty() {
            let local = LocalBroadcast::from_config(config);
            info!("shared cache enabled on in-process channel {}", local.channel());
            return CacheTransport::Local(local);
        }
        match RedisBroadcast::open(config) {
            Ok(redis) => {
                info!("shared cache enabled on redis channel {}", redis.channel());
                CacheTransport::Redis(redis)
            }
            Err(e) => {
                warn!("invalid redis url, shared cache disabled: {}", e);
                CacheTransport::Disabled
            }
        }
    }

    pub fn broadcaster(&self) -> Arc<dyn Broadcaster> {
        match self {
            CacheTransport::Disabled => Arc::new(NoBroadcast),
            CacheTransport::Local(local) => Arc::new(local.clone()),
            CacheTransport::Redis(redis) => Arc::new(redis.clone()),
        }
    }

    /// Receiver for the cache feeder, `None` when disabled.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<PathBuf>> {
        match self {
            CacheTransport::Disabled => None,
            CacheTransport::Local(local) => Some(local.subscribe()),
            CacheTransport::Redis(redis) => Some(redis.subscribe()),
        }
    }

    /// Start the task pulling remote messages, if this transport has one.
    pub fn spawn_relay(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        match self {
            CacheTransport::Redis(redis) => Some(redis.spawn_relay(cancel)),
            _ => None,
        }
    }
}

/// Append received paths to `cache` until `cancel` fires or the channel closes.
///
/// A lagging receiver has missed paths, so the cache is invalidated to force
/// the next lookup to rescan.
pub fn spawn_cache_feeder(
    mut receiver: broadcast::Receiver<PathBuf>,
    cache: SharedLibraryCache,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Ok(path) => {
                        info!("received new library path: {}", path.display());
                        cache.lock().append(path);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("cache feeder missed {} paths, invalidating cache", missed);
                        cache.lock().invalidate();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("cache feeder stopped");
    })
}
