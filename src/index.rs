//! Label index
//!
//! Maps `(namespace, label key, label value)` to the names of the objects carrying that
//! label. The index is rebuilt from watch events, so it only ever answers "which objects
//! should I look at"; callers still read the objects themselves before acting on them.
//!
//! A relist is buffered and swapped in once complete, so lookups made while it is
//! replayed keep answering from the previous listing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kube::Resource;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct IndexKey {
    namespace: String,
    key: String,
    value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ObjectId {
    namespace: String,
    name: String,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<IndexKey, BTreeSet<String>>,
    labels: HashMap<ObjectId, BTreeMap<String, String>>,
}

impl Inner {
    fn remove(&mut self, id: &ObjectId) {
        let Some(labels) = self.labels.remove(id) else {
            return;
        };
        for (key, value) in labels {
            let index_key = IndexKey {
                namespace: id.namespace.clone(),
                key,
                value,
            };
            if let Some(names) = self.entries.get_mut(&index_key) {
                names.remove(&id.name);
                if names.is_empty() {
                    self.entries.remove(&index_key);
                }
            }
        }
    }

    fn insert(&mut self, id: ObjectId, labels: BTreeMap<String, String>) {
        for (key, value) in &labels {
            self.entries
                .entry(IndexKey {
                    namespace: id.namespace.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
                .or_default()
                .insert(id.name.clone());
        }
        self.labels.insert(id, labels);
    }
}

/// Label index for one resource kind
#[derive(Debug, Default)]
struct State {
    live: Inner,
    /// Listing being rebuilt between `Init` and `InitDone`
    relist: Option<Inner>,
}

#[derive(Debug, Default)]
pub struct LabelIndex {
    inner: RwLock<State>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn id(meta: &ObjectMeta) -> Option<ObjectId> {
        Some(ObjectId {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone()?,
        })
    }

    /// Record the current labels of an object, replacing what was known before
    pub fn upsert(&self, meta: &ObjectMeta) {
        let Some(id) = Self::id(meta) else {
            return;
        };
        let labels = meta.labels.clone().unwrap_or_default();
        let mut guard = self.write();
        let state = &mut *guard;
        if let Some(relist) = state.relist.as_mut() {
            relist.remove(&id);
            relist.insert(id.clone(), labels.clone());
        }
        state.live.remove(&id);
        state.live.insert(id, labels);
    }

    /// Forget an object
    pub fn remove(&self, meta: &ObjectMeta) {
        if let Some(id) = Self::id(meta) {
            let mut guard = self.write();
            let state = &mut *guard;
            if let Some(relist) = state.relist.as_mut() {
                relist.remove(&id);
            }
            state.live.remove(&id);
        }
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut state = self.write();
        state.live = Inner::default();
        state.relist = None;
    }

    fn begin_relist(&self) {
        self.write().relist = Some(Inner::default());
    }

    /// Record an object of the listing being rebuilt; applied directly when no relist runs
    fn relist_upsert(&self, meta: &ObjectMeta) {
        let Some(id) = Self::id(meta) else {
            return;
        };
        let labels = meta.labels.clone().unwrap_or_default();
        let mut guard = self.write();
        let state = &mut *guard;
        match state.relist.as_mut() {
            Some(relist) => {
                relist.remove(&id);
                relist.insert(id, labels);
            }
            None => {
                state.live.remove(&id);
                state.live.insert(id, labels);
            }
        }
    }

    fn finish_relist(&self) {
        let mut guard = self.write();
        let state = &mut *guard;
        if let Some(relist) = state.relist.take() {
            state.live = relist;
        }
    }

    /// Feed a watch event into the index
    pub fn apply_event<K>(&self, event: &watcher::Event<K>)
    where
        K: Resource,
    {
        match event {
            watcher::Event::Init => self.begin_relist(),
            watcher::Event::InitApply(obj) => self.relist_upsert(obj.meta()),
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(obj) => self.upsert(obj.meta()),
            watcher::Event::Delete(obj) => self.remove(obj.meta()),
        }
    }

    /// Names of objects in `namespace` labelled `key=value`, sorted
    pub fn lookup(&self, namespace: &str, key: &str, value: &str) -> Vec<String> {
        let index_key = IndexKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        self.read()
            .live
            .entries
            .get(&index_key)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of objects in `namespace` carrying every `key=value` pair, sorted
    pub fn select(&self, namespace: &str, pairs: &[(&str, &str)]) -> Vec<String> {
        let Some(((first_key, first_value), rest)) = pairs.split_first() else {
            return Vec::new();
        };
        let mut names = self.lookup(namespace, first_key, first_value);
        for (key, value) in rest {
            let matching: BTreeSet<String> = self.lookup(namespace, key, value).into_iter().collect();
            names.retain(|n| matching.contains(n));
        }
        names
    }

    /// Number of indexed objects
    pub fn len(&self) -> usize {
        self.read().live.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
