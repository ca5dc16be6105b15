//! Informer plumbing
//!
//! An informer owns one watch stream and a reflector store. Every event is turned into an
//! add, update or delete callback on the kind's [`EventHandler`], with the previous version
//! of the object taken from the store before the event is applied. The same events feed an
//! optional [`LabelIndex`].

use std::collections::HashSet;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::index::LabelIndex;

/// Callbacks for one resource kind
#[async_trait]
pub trait EventHandler<K>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
{
    async fn on_add(&self, _obj: Arc<K>) {}

    async fn on_update(&self, _old: Arc<K>, _new: Arc<K>) {}

    async fn on_delete(&self, _obj: Arc<K>) {}
}

/// Handler that ignores every event, for kinds that are only cached and indexed
pub struct IgnoreEvents;

#[async_trait]
impl<K> EventHandler<K> for IgnoreEvents where K: Send + Sync + 'static {}

type SyncFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// A running informer
pub struct Informer {
    kind: &'static str,
    task: JoinHandle<()>,
    synced: Option<SyncFuture>,
}

impl Informer {
    /// Start watching `api`, delivering events to `handler` until `cancel` fires
    pub fn spawn<K, H>(
        kind: &'static str,
        api: Api<K>,
        config: watcher::Config,
        handler: Arc<H>,
        index: Option<Arc<LabelIndex>>,
        cancel: CancellationToken,
    ) -> Self
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
        H: EventHandler<K>,
    {
        let (reader, writer) = reflector::store::<K>();
        let sync_reader = reader.clone();
        let synced: SyncFuture = Box::pin(async move { sync_reader.wait_until_ready().await.is_ok() });

        let task = tokio::spawn(async move {
            let mut dispatcher = Dispatcher {
                reader,
                writer,
                handler,
                seen: HashSet::new(),
            };
            let mut stream = watcher(api, config).default_backoff().boxed();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                let Some(event) = next else {
                    break;
                };
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(kind, error = %e, "Watch error");
                        continue;
                    }
                };
                if let Some(index) = &index {
                    index.apply_event(&event);
                }
                dispatcher.dispatch(event).await;
            }
            debug!(kind, "Informer stopped");
        });

        Self {
            kind,
            task,
            synced: Some(synced),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Wait until the initial list has been delivered; `false` if the watch ended first
    pub async fn wait_for_sync(&mut self) -> bool {
        match self.synced.take() {
            Some(synced) => synced.await,
            None => true,
        }
    }

    /// Wait for the watch task to finish after cancellation
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(kind = self.kind, error = %e, "Informer task failed");
        }
    }
}

struct Dispatcher<K, H>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    reader: Store<K>,
    writer: reflector::store::Writer<K>,
    handler: Arc<H>,
    seen: HashSet<ObjectRef<K>>,
}

impl<K, H> Dispatcher<K, H>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    H: EventHandler<K>,
{
    async fn dispatch(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                self.seen.clear();
                self.writer.apply_watcher_event(&watcher::Event::Init);
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                let old = self.reader.get(&key);
                self.seen.insert(key);
                self.writer
                    .apply_watcher_event(&watcher::Event::InitApply(obj.clone()));
                self.deliver_apply(old, obj).await;
            }
            watcher::Event::InitDone => {
                // objects cached before a relist but missing from it were deleted meanwhile
                let stale: Vec<Arc<K>> = self
                    .reader
                    .state()
                    .into_iter()
                    .filter(|obj| !self.seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();
                self.seen.clear();
                self.writer.apply_watcher_event(&watcher::Event::InitDone);
                for obj in stale {
                    self.handler.on_delete(obj).await;
                }
            }
            watcher::Event::Apply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(&obj));
                self.writer
                    .apply_watcher_event(&watcher::Event::Apply(obj.clone()));
                self.deliver_apply(old, obj).await;
            }
            watcher::Event::Delete(obj) => {
                self.writer
                    .apply_watcher_event(&watcher::Event::Delete(obj.clone()));
                self.handler.on_delete(Arc::new(obj)).await;
            }
        }
    }

    async fn deliver_apply(&self, old: Option<Arc<K>>, new: K) {
        let new = Arc::new(new);
        match old {
            Some(old) => self.handler.on_update(old, new).await,
            None => self.handler.on_add(new).await,
        }
    }
}
