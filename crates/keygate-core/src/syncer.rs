use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use keygate_store::{KvResult, KvStore};

pub const CHANNEL_GROUPS: &str = "groups";
pub const CHANNEL_KEYS: &str = "keys";
pub const CHANNEL_SETTINGS: &str = "settings";

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);
const RELOAD_PAYLOAD: &[u8] = b"reload";

pub type Loader<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
pub type ReloadHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Read-through cache refreshed by pub/sub invalidation.
///
/// `invalidate` only publishes; the reload happens when the subscription
/// delivers the message back, so every instance (the publisher included)
/// converges through the same path. Readers always see either the previous
/// or the next complete value.
pub struct CacheSyncer<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner<T> {
    current: ArcSwap<T>,
    store: Arc<dyn KvStore>,
    channel: &'static str,
    loader: Loader<T>,
    after_reload: Option<ReloadHook<T>>,
}

impl<T: Send + Sync + 'static> CacheSyncer<T> {
    /// Performs the initial load (a failure here is fatal to bootstrap) and
    /// starts the invalidation listener.
    pub async fn start(
        store: Arc<dyn KvStore>,
        channel: &'static str,
        loader: Loader<T>,
        after_reload: Option<ReloadHook<T>>,
    ) -> anyhow::Result<Arc<Self>> {
        let initial = loader().await?;
        if let Some(hook) = &after_reload {
            hook(&initial);
        }
        // Subscribe before returning so an invalidation published right
        // after startup cannot slip past the listener.
        let subscription = store.subscribe(channel).await.ok();
        let inner = Arc::new(Inner {
            current: ArcSwap::from_pointee(initial),
            store,
            channel,
            loader,
            after_reload,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listen(inner.clone(), subscription, shutdown_rx));
        Ok(Arc::new(Self {
            inner,
            listener: Mutex::new(Some(listener)),
            shutdown_tx,
        }))
    }

    pub fn get(&self) -> Arc<T> {
        self.inner.current.load_full()
    }

    /// Publishes the reload marker; does not itself reload.
    pub async fn invalidate(&self) -> KvResult<()> {
        self.inner
            .store
            .publish(self.inner.channel, RELOAD_PAYLOAD)
            .await
    }

    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!(
                    channel = self.inner.channel,
                    "syncer listener did not stop in time"
                );
            }
        }
    }
}

async fn listen<T: Send + Sync + 'static>(
    inner: Arc<Inner<T>>,
    mut initial: Option<Box<dyn keygate_store::Subscription>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let mut subscription = match initial.take() {
            Some(subscription) => subscription,
            None => match inner.store.subscribe(inner.channel).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    tracing::warn!(channel = inner.channel, error = %err, "subscribe failed");
                    if wait_backoff(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            },
        };

        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Ok(_) => reload(&inner).await,
                    Err(err) => {
                        tracing::warn!(channel = inner.channel, error = %err, "subscription lost");
                        if wait_backoff(&mut shutdown_rx).await {
                            return;
                        }
                        break;
                    }
                },
                _ = shutdown_rx.changed() => return,
            }
        }
    }
}

/// Returns true when shutdown was requested during the backoff.
async fn wait_backoff(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => false,
        _ = shutdown_rx.changed() => true,
    }
}

async fn reload<T: Send + Sync + 'static>(inner: &Arc<Inner<T>>) {
    match (inner.loader)().await {
        Ok(next) => {
            if let Some(hook) = &inner.after_reload {
                hook(&next);
            }
            inner.current.store(Arc::new(next));
        }
        // Keep serving the previous value; the next invalidation retries.
        Err(err) => tracing::warn!(channel = inner.channel, error = %err, "reload failed"),
    }
}
