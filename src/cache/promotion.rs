//! Promotion notification channel.
//!
//! The cache layer publishes newly promoted entries here and knows nothing
//! about who listens. Every subscriber gets its own background task per
//! promotion; a failing subscriber is logged and never retried.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::entry::CacheEntry;
use crate::error::{EngramError, Result};

/// Something that reacts to promoted cache entries.
#[async_trait]
pub trait PromotionHandler: Send + Sync {
    /// Handle one promoted entry.
    async fn on_promotion(&self, entry: &CacheEntry) -> Result<()>;
}

/// Adapter turning a synchronous closure into a [`PromotionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> PromotionHandler for FnHandler<F>
where
    F: Fn(&CacheEntry) -> Result<()> + Send + Sync,
{
    async fn on_promotion(&self, entry: &CacheEntry) -> Result<()> {
        (self.0)(entry)
    }
}

/// Forwards promoted entries into a bounded channel.
struct ChannelHandler {
    tx: mpsc::Sender<CacheEntry>,
}

#[async_trait]
impl PromotionHandler for ChannelHandler {
    async fn on_promotion(&self, entry: &CacheEntry) -> Result<()> {
        self.tx.try_send(entry.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngramError::promotion(format!("channel full, dropped '{}'", entry.key))
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngramError::promotion(format!("receiver gone, dropped '{}'", entry.key))
            }
        })
    }
}

/// Subscriber list for promotion events.
#[derive(Default)]
pub struct PromotionBus {
    subscribers: RwLock<Vec<Arc<dyn PromotionHandler>>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl PromotionBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn subscribe(&self, handler: Arc<dyn PromotionHandler>) {
        self.subscribers.write().push(handler);
    }

    /// Register a closure.
    pub fn subscribe_fn<F>(&self, f: F)
    where
        F: Fn(&CacheEntry) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnHandler(f)));
    }

    /// Register a bounded channel and return its receiving end.
    ///
    /// When the channel is full the event is dropped with a warning.
    pub fn subscribe_channel(&self, capacity: usize) -> mpsc::Receiver<CacheEntry> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(Arc::new(ChannelHandler { tx }));
        rx
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Notify every subscriber without blocking the caller.
    ///
    /// Requires a tokio runtime on the current thread; without one the
    /// notification is dropped with a warning.
    pub(crate) fn dispatch(&self, entry: CacheEntry) {
        let subscribers = self.subscribers.read().clone();
        if subscribers.is_empty() {
            debug!(key = %entry.key, "promotion with no subscribers");
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %entry.key, "no async runtime, promotion notification dropped");
                return;
            }
        };

        let entry = Arc::new(entry);
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|task| !task.is_finished());
        for handler in subscribers {
            let entry = Arc::clone(&entry);
            in_flight.push(handle.spawn(async move {
                if let Err(e) = handler.on_promotion(&entry).await {
                    warn!(key = %entry.key, error = %e, "promotion subscriber failed");
                }
            }));
        }
    }

    /// Wait for every notification dispatched so far to finish.
    pub async fn flush(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.in_flight.lock());
        if tasks.is_empty() {
            return;
        }
        debug!(tasks = tasks.len(), "waiting for promotion notifications");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "promotion task aborted");
            }
        }
    }
}

impl std::fmt::Debug for PromotionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
