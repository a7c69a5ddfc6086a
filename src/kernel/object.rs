//! Object Manager: the canonical registry of typed browser-local resources.
//!
//! Objects are addressed by stable, type-prefixed ids (`tab:42`) allocated
//! from per-kind monotonic counters that are never reused within a process
//! lifetime. `update` is the only legal mutation path and is crate-private:
//! agent code reaches it exclusively through the mediated surface, which
//! journals pre-images into the active transaction before anything becomes
//! visible.
//!
//! Attribute maps are held behind `Arc` so large pre-images are snapshotted
//! by reference: a mutation installs a fresh `Arc` and parks the displaced
//! version in a bounded ring, leaving old versions bit-identical for every
//! checkpoint that still holds them.

use crate::kernel::error::KernelError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, RwLock};

/// Kinds of registry-managed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Tab,
    Form,
    Workspace,
    Credential,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Tab => "tab",
            ObjectKind::Form => "form",
            ObjectKind::Workspace => "workspace",
            ObjectKind::Credential => "credential",
        }
    }

    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Tab,
        ObjectKind::Form,
        ObjectKind::Workspace,
        ObjectKind::Credential,
    ];

    fn index(self) -> usize {
        match self {
            ObjectKind::Tab => 0,
            ObjectKind::Form => 1,
            ObjectKind::Workspace => 2,
            ObjectKind::Credential => 3,
        }
    }
}

impl FromStr for ObjectKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tab" => Ok(ObjectKind::Tab),
            "form" => Ok(ObjectKind::Form),
            "workspace" => Ok(ObjectKind::Workspace),
            "credential" => Ok(ObjectKind::Credential),
            other => Err(KernelError::Validation(format!(
                "unknown object kind '{}'",
                other
            ))),
        }
    }
}

/// Stable object identifier: `(type_tag, monotonic_counter)` rendered as
/// `"<type>:<n>"`. Equality is by exact value; the string form is the
/// canonical wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub kind: ObjectKind,
    pub n: u64,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.n)
    }
}

impl FromStr for ObjectId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, n) = s
            .split_once(':')
            .ok_or_else(|| KernelError::Validation(format!("malformed object id '{}'", s)))?;
        let kind = ObjectKind::from_str(kind)?;
        let n = n
            .parse::<u64>()
            .map_err(|_| KernelError::Validation(format!("malformed object id '{}'", s)))?;
        Ok(ObjectId { kind, n })
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Attribute map for a registry object. Keys are unique; insertion order is
/// irrelevant, so a sorted map keeps serialization deterministic.
pub type Attrs = BTreeMap<String, JsonValue>;

/// Deep, immutable view of an object. The caller cannot mutate the live
/// object through it; mutation goes through the mediated `update` path only.
#[derive(Debug, Clone)]
pub struct ObjectView {
    pub id: ObjectId,
    pub attrs: Arc<Attrs>,
    /// Serialized size of `attrs`, cached at write time.
    pub serialized_len: usize,
}

impl ObjectView {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.attrs.get(key)
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }
}

/// Lifecycle events, published to subscribers after the mutation is visible
/// to `get`, in the order the underlying mutations committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created(ObjectId),
    Updated(ObjectId),
    Destroyed(ObjectId),
}

/// Pre-image displaced by a mutation, handed to the transaction coordinator
/// for journaling.
#[derive(Debug, Clone)]
pub struct Displaced {
    pub attrs: Arc<Attrs>,
    pub serialized_len: usize,
}

struct ObjectRecord {
    attrs: Arc<Attrs>,
    serialized_len: usize,
}

struct Shard {
    counter: AtomicU64,
    map: RwLock<FxHashMap<u64, ObjectRecord>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            map: RwLock::new(FxHashMap::default()),
        }
    }
}

/// Canonical registry of typed resources with stable ids.
///
/// Safe for concurrent reads; writers serialize per kind. No lock is held
/// across a suspension point: renderer waits happen outside the registry.
pub struct ObjectManager {
    shards: [Shard; 4],
    subscribers: Mutex<Vec<Sender<LifecycleEvent>>>,
    /// Displaced large versions parked here so reference snapshots stay
    /// alive until holding checkpoints release them.
    version_ring: Mutex<VecDeque<Arc<Attrs>>>,
    ring_capacity: usize,
}

fn serialized_len(attrs: &Attrs) -> usize {
    serde_json::to_vec(attrs).map(|v| v.len()).unwrap_or(0)
}

impl ObjectManager {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            shards: [Shard::new(), Shard::new(), Shard::new(), Shard::new()],
            subscribers: Mutex::new(Vec::new()),
            version_ring: Mutex::new(VecDeque::new()),
            ring_capacity,
        }
    }

    /// Allocate a fresh id and register the object.
    pub fn create(&self, kind: ObjectKind, attrs: Attrs) -> Result<ObjectId, KernelError> {
        let shard = &self.shards[kind.index()];
        let n = shard.counter.fetch_add(1, Ordering::SeqCst);
        let id = ObjectId { kind, n };
        let len = serialized_len(&attrs);
        {
            let mut map = shard
                .map
                .write()
                .map_err(|_| KernelError::Validation("object shard lock poisoned".to_string()))?;
            map.insert(
                n,
                ObjectRecord {
                    attrs: Arc::new(attrs),
                    serialized_len: len,
                },
            );
        }
        self.publish(LifecycleEvent::Created(id));
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<ObjectView> {
        let shard = &self.shards[id.kind.index()];
        let map = shard.map.read().ok()?;
        map.get(&id.n).map(|rec| ObjectView {
            id,
            attrs: Arc::clone(&rec.attrs),
            serialized_len: rec.serialized_len,
        })
    }

    /// Apply `patch` on top of the current attributes.
    ///
    /// The only legal mutation path, crate-private to the mediated surface.
    /// `expected` keys, when provided, must equal the live value or the
    /// update fails with `ObjectConflict`. Returns the displaced version so
    /// the caller can journal it.
    pub(crate) fn update(
        &self,
        id: ObjectId,
        patch: Attrs,
        expected: Option<&Attrs>,
    ) -> Result<Displaced, KernelError> {
        let shard = &self.shards[id.kind.index()];
        let displaced;
        {
            let mut map = shard
                .map
                .write()
                .map_err(|_| KernelError::Validation("object shard lock poisoned".to_string()))?;
            let rec = map
                .get_mut(&id.n)
                .ok_or_else(|| KernelError::ObjectNotFound { id: id.to_string() })?;

            if let Some(expected) = expected {
                for (key, want) in expected {
                    let have = rec.attrs.get(key).cloned().unwrap_or(JsonValue::Null);
                    if &have != want {
                        return Err(KernelError::ObjectConflict {
                            id: id.to_string(),
                            expected: want.to_string(),
                            actual: have.to_string(),
                        });
                    }
                }
            }

            let mut next: Attrs = (*rec.attrs).clone();
            for (key, value) in patch {
                next.insert(key, value);
            }
            let next_len = serialized_len(&next);
            displaced = Displaced {
                attrs: Arc::clone(&rec.attrs),
                serialized_len: rec.serialized_len,
            };
            rec.attrs = Arc::new(next);
            rec.serialized_len = next_len;
        }
        self.park_version(Arc::clone(&displaced.attrs));
        self.publish(LifecycleEvent::Updated(id));
        Ok(displaced)
    }

    /// Reinstall a journaled pre-image (rollback path only).
    pub(crate) fn restore(&self, id: ObjectId, attrs: Arc<Attrs>) -> Result<(), KernelError> {
        let len = serialized_len(&attrs);
        let shard = &self.shards[id.kind.index()];
        {
            let mut map = shard
                .map
                .write()
                .map_err(|_| KernelError::Validation("object shard lock poisoned".to_string()))?;
            map.insert(
                id.n,
                ObjectRecord {
                    attrs,
                    serialized_len: len,
                },
            );
        }
        self.publish(LifecycleEvent::Updated(id));
        Ok(())
    }

    /// Remove an object created inside a rolled-back transaction frame.
    pub(crate) fn remove(&self, id: ObjectId) -> Result<(), KernelError> {
        let shard = &self.shards[id.kind.index()];
        {
            let mut map = shard
                .map
                .write()
                .map_err(|_| KernelError::Validation("object shard lock poisoned".to_string()))?;
            map.remove(&id.n);
        }
        self.publish(LifecycleEvent::Destroyed(id));
        Ok(())
    }

    /// Test-internals twin of `update`. Only compiled for integration
    /// tests and benches; production mutation goes through mediation.
    #[cfg(feature = "test-internals")]
    pub fn update_internal(
        &self,
        id: ObjectId,
        patch: Attrs,
        expected: Option<&Attrs>,
    ) -> Result<Displaced, KernelError> {
        self.update(id, patch, expected)
    }

    /// Test-internals twin of `dispose`.
    #[cfg(feature = "test-internals")]
    pub fn dispose_internal(&self, id: ObjectId) -> Result<Displaced, KernelError> {
        self.dispose(id)
    }

    pub fn list_by_type(&self, kind: ObjectKind) -> Vec<ObjectView> {
        let shard = &self.shards[kind.index()];
        let Ok(map) = shard.map.read() else {
            return Vec::new();
        };
        let mut views: Vec<ObjectView> = map
            .iter()
            .map(|(n, rec)| ObjectView {
                id: ObjectId { kind, n: *n },
                attrs: Arc::clone(&rec.attrs),
                serialized_len: rec.serialized_len,
            })
            .collect();
        views.sort_by_key(|v| v.id.n);
        views
    }

    /// Destroy an object. Its counter value is never reused; a later create
    /// of the same kind always yields a strictly greater id.
    pub(crate) fn dispose(&self, id: ObjectId) -> Result<Displaced, KernelError> {
        let shard = &self.shards[id.kind.index()];
        let displaced;
        {
            let mut map = shard
                .map
                .write()
                .map_err(|_| KernelError::Validation("object shard lock poisoned".to_string()))?;
            let rec = map
                .remove(&id.n)
                .ok_or_else(|| KernelError::ObjectNotFound { id: id.to_string() })?;
            displaced = Displaced {
                attrs: rec.attrs,
                serialized_len: rec.serialized_len,
            };
        }
        self.publish(LifecycleEvent::Destroyed(id));
        Ok(displaced)
    }

    /// Subscribe to lifecycle events. Events are delivered after the
    /// mutation is visible to `get`.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    fn publish(&self, event: LifecycleEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn park_version(&self, version: Arc<Attrs>) {
        let Ok(mut ring) = self.version_ring.lock() else {
            return;
        };
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(version);
    }
}
