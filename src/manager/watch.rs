use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives change notifications from a watch.
///
/// Handlers run on the watch task and must not block; the usual
/// implementation just pushes a key onto a [`super::WorkQueue`].
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// A watch as seen by the controller group that owns it.
pub trait ResourceWatch: Send + Sync {
    fn name(&self) -> &str;
    /// Start delivering events until `stop` is cancelled.
    fn start(&self, stop: CancellationToken) -> JoinHandle<()>;
    /// Whether the initial list has been delivered.
    fn has_synced(&self) -> bool;
}

/// Poll interval of the cache-sync barrier
const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Block until every watch has synced. Returns `false` if `stop` fires first.
pub async fn wait_for_cache_sync(watches: &[Arc<dyn ResourceWatch>], stop: &CancellationToken) -> bool {
    loop {
        if watches.iter().all(|w| w.has_synced()) {
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = tokio::time::sleep(SYNC_POLL_PERIOD) => {}
        }
    }
}

/// A kube-runtime watch with a local cache, dispatching add/update/delete
/// events to registered handlers.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    name: String,
    api: Api<K>,
    config: watcher::Config,
    resync: Option<Duration>,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: Mutex<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    synced: Arc<AtomicBool>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, api: Api<K>, config: watcher::Config) -> Arc<Self> {
        Self::with_resync(name, api, config, None)
    }

    /// Like [`Informer::new`], but re-delivers every cached object as an update
    /// each `resync` period.
    pub fn with_resync(
        name: impl Into<String>,
        api: Api<K>,
        config: watcher::Config,
        resync: Option<Duration>,
    ) -> Arc<Self> {
        let writer = Writer::<K>::default();
        Arc::new(Self {
            name: name.into(),
            api,
            config,
            resync,
            store: writer.as_reader(),
            writer: Mutex::new(Some(writer)),
            handlers: Mutex::new(Vec::new()),
            synced: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a handler. Handlers added after [`ResourceWatch::start`] are ignored.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Read access to the local cache
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }
}

impl<K> ResourceWatch for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, stop: CancellationToken) -> JoinHandle<()> {
        let Some(writer) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(watch = %self.name, "watch was already started");
            return tokio::spawn(async {});
        };
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let dispatcher = Dispatcher {
            name: self.name.clone(),
            writer,
            store: self.store.clone(),
            handlers,
            synced: self.synced.clone(),
            relisting: None,
        };
        let stream = watcher(self.api.clone(), self.config.clone()).default_backoff();
        let resync = self
            .resync
            .map(|period| interval_at(Instant::now() + period, period));
        tokio::spawn(dispatcher.run(stream, resync, stop))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

struct Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    name: String,
    writer: Writer<K>,
    store: Store<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    synced: Arc<AtomicBool>,
    /// Cached objects a relist in progress has not listed again yet
    relisting: Option<HashMap<ObjectRef<K>, Arc<K>>>,
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    async fn run(
        mut self,
        stream: impl futures::Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
        mut resync: Option<Interval>,
        stop: CancellationToken,
    ) {
        let mut stream = pin!(stream);
        debug!(watch = %self.name, "watch started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = next_resync(&mut resync) => self.resync(),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(err)) => warn!(watch = %self.name, "watch error: {err}"),
                    None => break,
                },
            }
        }
        debug!(watch = %self.name, "watch stopped");
    }

    fn dispatch(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                if let Some(relisting) = self.relisting.as_mut() {
                    relisting.remove(&obj_ref);
                }
                let old = self.store.get(&obj_ref);
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
                    None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                }
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.handlers.iter().for_each(|h| h.on_delete(obj));
            }
            watcher::Event::Init => {
                self.relisting = Some(
                    self.store
                        .state()
                        .into_iter()
                        .map(|obj| (ObjectRef::from_obj(&*obj), obj))
                        .collect(),
                );
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                // deleted while the watch was down
                for (obj_ref, obj) in self.relisting.take().unwrap_or_default() {
                    debug!(watch = %self.name, object = %obj_ref, "gone after relist");
                    self.handlers.iter().for_each(|h| h.on_delete(&obj));
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    debug!(watch = %self.name, "initial list complete");
                }
            }
        }
    }

    fn resync(&self) {
        for obj in self.store.state() {
            self.handlers.iter().for_each(|h| h.on_update(&obj, &obj));
        }
    }
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
