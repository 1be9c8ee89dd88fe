//! Job queue: sequential producer/consumer queue with named channels.
//!
//! Every `JobQueue` owns one consumer task. Items are pulled strictly FIFO
//! and each item is awaited through all handlers connected to its channel,
//! one handler after another, before the next item is pulled. A queue never
//! has two payloads in flight at once.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A payload tagged with the channel it was added on.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub channel: String,
    pub data: T,
}

/// State shared between the queue handle and its consumer task.
struct Shared<T> {
    handlers: RwLock<HashMap<String, Vec<Handler<T>>>>,
    /// Items added but not yet fully handled.
    pending: watch::Sender<usize>,
}

struct Inner<T> {
    name: String,
    tx: mpsc::UnboundedSender<QueueItem<T>>,
    /// Taken by the consumer task the first time it starts.
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueItem<T>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    shared: Arc<Shared<T>>,
}

/// Unbounded, single-consumer FIFO queue with per-channel async handlers.
pub struct JobQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> JobQueue<T>
where
    T: Clone + Send + 'static,
{
    /// Create a new queue. `name` only shows up in logs.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tx,
                rx: Mutex::new(Some(rx)),
                consumer: Mutex::new(None),
                stopped: AtomicBool::new(false),
                shared: Arc::new(Shared {
                    handlers: RwLock::new(HashMap::new()),
                    pending,
                }),
            }),
        }
    }

    /// Enqueue `data` on `channel`. Never blocks.
    ///
    /// Starts the consumer if it is not running yet and a Tokio runtime is
    /// available; otherwise the item waits until `start()` or `connect()` is
    /// called from inside a runtime.
    pub fn add(&self, channel: &str, data: T) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!(queue = %self.inner.name, channel, "Queue stopped, dropping item");
            return;
        }

        self.inner.shared.pending.send_modify(|n| *n += 1);
        let item = QueueItem {
            channel: channel.to_string(),
            data,
        };
        if self.inner.tx.send(item).is_err() {
            // Receiver gone: the consumer was aborted.
            self.inner
                .shared
                .pending
                .send_modify(|n| *n = n.saturating_sub(1));
            warn!(queue = %self.inner.name, channel, "Consumer gone, dropping item");
            return;
        }

        self.start();
    }

    /// Connect an additional handler to `channel`.
    ///
    /// Handlers run in registration order for every item on the channel.
    pub fn connect<F, Fut>(&self, channel: &str, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |data| handler(data).boxed());
        self.inner
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push(handler);
        debug!(queue = %self.inner.name, channel, "Handler connected");

        self.start();
    }

    /// Number of handlers connected to `channel`.
    pub fn handler_count(&self, channel: &str) -> usize {
        self.inner
            .shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Number of items added but not yet fully handled.
    pub fn pending(&self) -> usize {
        *self.inner.shared.pending.borrow()
    }

    /// Start the consumer if possible. Idempotent.
    ///
    /// The consumer needs a running Tokio runtime and at least one connected
    /// handler; until both are true, added items stay queued.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let has_handlers = !self
            .inner
            .shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if !has_handlers {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(queue = %self.inner.name, "No runtime yet, consumer deferred");
            return;
        };

        let mut consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if consumer.is_some() {
            return;
        }
        let Some(rx) = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let name = self.inner.name.clone();
        let shared = Arc::clone(&self.inner.shared);
        *consumer = Some(runtime.spawn(run(name, rx, shared)));
        debug!(queue = %self.inner.name, "Consumer started");
    }

    /// Cancel the consumer. In-flight handlers are cancelled at their next
    /// await point. The queue accepts no more work afterwards.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner.shared.pending.send_replace(0);
        debug!(queue = %self.inner.name, "Queue stopped");
    }

    /// Wait until every added item has been handled.
    pub async fn join(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.inner.shared.pending.subscribe();
        // Sender lives in `self`, so this only errors if the queue is gone.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

async fn run<T>(name: String, mut rx: mpsc::UnboundedReceiver<QueueItem<T>>, shared: Arc<Shared<T>>)
where
    T: Clone + Send + 'static,
{
    while let Some(item) = rx.recv().await {
        process(&name, &shared, item).await;
        shared.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
    debug!(queue = %name, "Consumer exiting");
}

async fn process<T>(name: &str, shared: &Shared<T>, item: QueueItem<T>)
where
    T: Clone + Send + 'static,
{
    let handlers: Vec<Handler<T>> = shared
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&item.channel)
        .cloned()
        .unwrap_or_default();

    if handlers.is_empty() {
        debug!(queue = %name, channel = %item.channel, "No handler for channel, item dropped");
        return;
    }

    for handler in handlers {
        let data = item.data.clone();
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(data))) {
            Ok(fut) => fut,
            Err(_) => {
                error!(queue = %name, channel = %item.channel, "Handler panicked");
                continue;
            }
        };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(queue = %name, channel = %item.channel, error = %e, "Handler failed");
            }
            Err(_) => {
                error!(queue = %name, channel = %item.channel, "Handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl Fn(u32) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |n| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{tag}:start:{n}"));
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().unwrap().push(format!("{tag}:end:{n}"));
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn items_are_handled_fifo_without_overlap() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.connect("x", recorder(&log, "h"));

        for n in 0..4 {
            queue.add("x", n);
        }
        queue.join().await;

        let expected: Vec<String> = (0..4)
            .flat_map(|n| [format!("h:start:{n}"), format!("h:end:{n}")])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.connect("x", recorder(&log, "a"));
        queue.connect("x", recorder(&log, "b"));

        queue.add("x", 1);
        queue.join().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:start:1", "a:end:1", "b:start:1", "b:end:1"]
        );
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_queue_or_siblings() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.connect("x", |n: u32| async move {
            if n == 1 {
                anyhow::bail!("boom");
            }
            Ok(())
        });
        queue.connect("x", |n: u32| async move {
            if n == 2 {
                panic!("handler panic");
            }
            Ok(())
        });
        queue.connect("x", recorder(&log, "c"));

        for n in 0..3 {
            queue.add("x", n);
        }
        queue.join().await;

        let ends: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.contains(":end:"))
            .cloned()
            .collect();
        assert_eq!(ends, vec!["c:end:0", "c:end:1", "c:end:2"]);
    }

    #[tokio::test]
    async fn item_added_before_connect_is_delivered() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.add("x", 1);
        assert_eq!(queue.pending(), 1);

        queue.connect("x", recorder(&log, "h"));
        queue.join().await;

        assert_eq!(*log.lock().unwrap(), vec!["h:start:1", "h:end:1"]);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.connect("create", recorder(&log, "create"));

        queue.add("execute", 7);
        queue.add("create", 8);
        queue.join().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["create:start:8", "create:end:8"]
        );
        assert_eq!(queue.handler_count("execute"), 0);
    }

    #[test]
    fn consumer_deferred_until_runtime_exists() {
        let log: Log = Arc::default();
        let queue = JobQueue::new("test");
        queue.connect("x", recorder(&log, "h"));
        queue.add("x", 3);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            queue.start();
            queue.join().await;
        });

        assert_eq!(*log.lock().unwrap(), vec!["h:start:3", "h:end:3"]);
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let queue = JobQueue::new("test");
        queue.connect("x", |_: u32| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        queue.add("x", 1);
        tokio::task::yield_now().await;

        queue.stop();
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .expect("join should return after stop");

        queue.add("x", 2);
        assert_eq!(queue.pending(), 0);
    }
}
