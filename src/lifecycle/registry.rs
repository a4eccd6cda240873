use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use super::participant::{same_participant, SharedResource, ShutdownParticipant};
use super::ShutdownCoordinator;
use crate::config::{CoreConfig, Limits};
use crate::types::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Namespace {
    Clients,
    ShutdownListeners,
}

/// (type, classifier) pair naming one registry slot. A missing classifier is
/// the same as an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    namespace: Namespace,
    type_id: TypeId,
    type_name: &'static str,
    classifier: String,
}

impl RegistryKey {
    fn of<T: Any>(namespace: Namespace, classifier: Option<&str>) -> Self {
        Self {
            namespace,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            classifier: classifier.unwrap_or_default().to_string(),
        }
    }

    pub fn classifier(&self) -> &str {
        &self.classifier
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.classifier)
    }
}

struct Entry {
    instance: Arc<dyn Any + Send + Sync>,
    participant: Option<Arc<dyn ShutdownParticipant>>,
}

type Entries = RefCell<HashMap<RegistryKey, Entry>>;
type ConfigSubscriber = Arc<dyn Fn(&CoreConfig) + Send + Sync>;

/// Thread-safe map from (type, classifier) to a lazily built, shared instance.
///
/// Every mutation goes through one reentrant lock acquired with a bounded
/// wait. Factories run while the lock is held, so an instance becomes visible
/// to other threads only once its factory has returned. Reentrancy lets a
/// factory register further resources from the same thread.
pub struct SharedResourceRegistry {
    entries: ReentrantMutex<Entries>,
    lock_timeout_ms: AtomicU64,
    coordinator: Arc<ShutdownCoordinator>,
    subscribers: Mutex<Vec<ConfigSubscriber>>,
}

impl SharedResourceRegistry {
    pub fn new(coordinator: Arc<ShutdownCoordinator>, lock_timeout_ms: u64) -> Self {
        Self {
            entries: ReentrantMutex::new(RefCell::new(HashMap::new())),
            lock_timeout_ms: AtomicU64::new(Limits::lock_timeout(lock_timeout_ms).as_millis() as u64),
            coordinator,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    fn acquire(&self) -> Result<ReentrantMutexGuard<'_, Entries>> {
        let timeout = self.lock_timeout();
        self.entries.try_lock_for(timeout).ok_or_else(|| {
            tracing::error!(timeout_ms = timeout.as_millis() as u64, "Registry lock acquisition timed out");
            CoreError::LockTimeout(timeout)
        })
    }

    /// Looks up an instance without creating one.
    pub fn get<T: SharedResource>(&self, classifier: Option<&str>) -> Result<Option<Arc<T>>> {
        let key = RegistryKey::of::<T>(Namespace::Clients, classifier);
        let guard = self.acquire()?;
        let entries = guard.borrow();
        Ok(lookup::<T>(&entries, &key))
    }

    /// Returns the instance stored under `(T, classifier)`, building it with
    /// `factory` when absent. A factory returning `None` stores nothing.
    ///
    /// Instances whose [`SharedResource::as_participant`] yields a participant
    /// are enrolled with the shutdown coordinator on creation.
    pub fn get_or_create<T, F>(&self, classifier: Option<&str>, factory: F) -> Result<Option<Arc<T>>>
    where
        T: SharedResource,
        F: FnOnce() -> Option<T>,
    {
        self.get_or_insert_with(
            RegistryKey::of::<T>(Namespace::Clients, classifier),
            || factory().map(Arc::new),
            |instance| SharedResource::as_participant(Arc::clone(instance)),
        )
    }

    /// Removes the instance stored under `(T, classifier)` and withdraws it
    /// from coordinated shutdown if it had been enrolled.
    pub fn remove<T: SharedResource>(&self, classifier: Option<&str>) -> Result<Option<Arc<T>>> {
        self.remove_entry::<T>(RegistryKey::of::<T>(Namespace::Clients, classifier))
    }

    pub fn contains<T: SharedResource>(&self, classifier: Option<&str>) -> Result<bool> {
        let key = RegistryKey::of::<T>(Namespace::Clients, classifier);
        let guard = self.acquire()?;
        let contains = guard.borrow().contains_key(&key);
        Ok(contains)
    }

    /// Explicitly enrols `participant` in coordinated shutdown under
    /// `(T, classifier)`. Registering the same instance again is a no-op;
    /// a different instance under an occupied key is a conflict.
    pub fn register_participant<T>(&self, participant: Arc<T>, classifier: Option<&str>) -> Result<()>
    where
        T: ShutdownParticipant + Any,
    {
        let key = RegistryKey::of::<T>(Namespace::ShutdownListeners, classifier);
        let guard = self.acquire()?;

        // An instance created through `get_or_create` under the same key is
        // already enrolled and occupies the key.
        let client_key = RegistryKey::of::<T>(Namespace::Clients, classifier);
        let enrolled = guard
            .borrow()
            .get(&client_key)
            .and_then(|entry| entry.participant.clone());
        if let Some(enrolled) = enrolled {
            let candidate: Arc<dyn ShutdownParticipant> = participant.clone();
            if same_participant(&enrolled, &candidate) {
                return Ok(());
            }
            return Err(conflict(&key));
        }

        let candidate = Arc::clone(&participant);
        let stored = self.get_or_insert_with(
            key.clone(),
            move || Some(candidate),
            |instance| Some(Arc::clone(instance) as Arc<dyn ShutdownParticipant>),
        )?;

        match stored {
            Some(stored) if Arc::ptr_eq(&stored, &participant) => Ok(()),
            _ => Err(conflict(&key)),
        }
    }

    pub fn remove_participant<T>(&self, classifier: Option<&str>) -> Result<bool>
    where
        T: ShutdownParticipant + Any,
    {
        let key = RegistryKey::of::<T>(Namespace::ShutdownListeners, classifier);
        Ok(self.remove_entry::<T>(key)?.is_some())
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.acquire()?;
        let len = guard.borrow().len();
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Adds a callback invoked by [`reconfigure`](Self::reconfigure).
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&CoreConfig) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Arc::new(callback));
    }

    /// Applies `config` to the registry itself, then notifies subscribers in
    /// subscription order.
    pub fn reconfigure(&self, config: &CoreConfig) -> Result<()> {
        {
            let _guard = self.acquire()?;
            let timeout = config.lock_timeout();
            self.lock_timeout_ms
                .store(timeout.as_millis() as u64, Ordering::Relaxed);
            tracing::debug!(lock_timeout_ms = timeout.as_millis() as u64, "Registry reconfigured");
        }

        let subscribers: Vec<ConfigSubscriber> = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(config);
        }
        Ok(())
    }

    fn get_or_insert_with<T, F, P>(&self, key: RegistryKey, factory: F, enrol: P) -> Result<Option<Arc<T>>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Option<Arc<T>>,
        P: FnOnce(&Arc<T>) -> Option<Arc<dyn ShutdownParticipant>>,
    {
        let guard = self.acquire()?;
        if let Some(existing) = lookup::<T>(&guard.borrow(), &key) {
            return Ok(Some(existing));
        }

        // No RefCell borrow is held while the factory runs: it may re-enter
        // the registry from this thread.
        let Some(instance) = factory() else {
            return Ok(None);
        };

        let mut entries = guard.borrow_mut();
        if let Some(existing) = lookup::<T>(&entries, &key) {
            tracing::debug!(key = %key, "Factory registered its own key, keeping first instance");
            return Ok(Some(existing));
        }

        let participant = enrol(&instance);
        if let Some(p) = &participant {
            self.coordinator.register(Arc::clone(p));
        }
        tracing::debug!(key = %key, participant = participant.is_some(), "Registered shared resource");
        entries.insert(
            key,
            Entry {
                instance: Arc::clone(&instance) as Arc<dyn Any + Send + Sync>,
                participant,
            },
        );
        Ok(Some(instance))
    }

    fn remove_entry<T: Any + Send + Sync>(&self, key: RegistryKey) -> Result<Option<Arc<T>>> {
        let guard = self.acquire()?;
        let removed = guard.borrow_mut().remove(&key);
        let Some(entry) = removed else {
            return Ok(None);
        };

        if let Some(participant) = &entry.participant {
            self.coordinator.deregister(participant);
        }
        tracing::debug!(key = %key, "Removed shared resource");
        Ok(entry.instance.downcast::<T>().ok())
    }
}

fn conflict(key: &RegistryKey) -> CoreError {
    CoreError::Conflict(format!(
        "a different shutdown participant is already registered as {}, try with a different classifier",
        key
    ))
}

fn lookup<T: Any + Send + Sync>(entries: &HashMap<RegistryKey, Entry>, key: &RegistryKey) -> Option<Arc<T>> {
    entries
        .get(key)
        .and_then(|entry| Arc::clone(&entry.instance).downcast::<T>().ok())
}
