use super::BackendError;
use crate::event::{ChangeEvent, EventFilter, Record, TableName};
use crate::logging::traffic;
use crate::optimistic::OptimisticOperation;
use crate::subscription::{ChangeHandlers, Subscription, SubscriptionManager};
use crate::transport::ChangefeedTransport;
use crate::types::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An active business location (`negocios` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Location {
    /// Maps a `negocios` row. Rows without an `id` are rejected.
    pub fn from_record(record: &Record) -> Option<Self> {
        let text = |column: &str| record.str_field(column).map(str::to_string);
        Some(Self {
            id: record.id()?,
            name: text("nombre").unwrap_or_default(),
            address: text("direccion"),
            phone: text("telefono"),
            email: text("email"),
        })
    }
}

/// A location that does not exist remotely yet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewLocation {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl NewLocation {
    /// The row to insert, marked active.
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("nombre", self.name.clone())
            .with("direccion", self.address.clone())
            .with("telefono", self.phone.clone())
            .with("email", self.email.clone())
            .with("activo", true)
    }

    fn with_id(&self, id: String) -> Location {
        Location {
            id,
            name: self.name.clone(),
            address: self.address.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
        }
    }
}

/// Remote service storing locations.
pub trait LocationBackend: Send + Sync + 'static {
    fn load_active(&self) -> BoxFuture<'_, std::result::Result<Vec<Location>, BackendError>>;

    /// Returns the stored location with its server-assigned id.
    fn create(&self, location: NewLocation) -> BoxFuture<'_, std::result::Result<Location, BackendError>>;

    fn update(&self, location: Location) -> BoxFuture<'_, std::result::Result<(), BackendError>>;

    fn delete(&self, id: String) -> BoxFuture<'_, std::result::Result<(), BackendError>>;
}

static PENDING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Active locations, kept current from `negocios` changes.
///
/// Realtime inserts are de-duplicated by id, so a row that arrives twice, or
/// that was already added locally, shows up once.
pub struct LocationStore<B: LocationBackend> {
    backend: Arc<B>,
    locations: Arc<Mutex<Vec<Location>>>,
}

impl<B: LocationBackend> Clone for LocationStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            locations: Arc::clone(&self.locations),
        }
    }
}

impl<B: LocationBackend> LocationStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            locations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn locations(&self) -> Vec<Location> {
        self.locations.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<Location> {
        self.locations.lock().iter().find(|l| l.id == id).cloned()
    }

    /// Replaces the list with the backend's active locations. On failure the
    /// list is emptied and the error returned.
    pub async fn load(&self) -> std::result::Result<usize, BackendError> {
        match self.backend.load_active().await {
            Ok(loaded) => {
                let count = loaded.len();
                *self.locations.lock() = loaded;
                tracing::info!("Loaded {} locations", count);
                Ok(count)
            }
            Err(e) => {
                tracing::error!("Failed to load locations: {}", e);
                self.locations.lock().clear();
                Err(e)
            }
        }
    }

    /// Applies one `negocios` change to the list.
    pub fn apply(&self, event: &ChangeEvent) {
        let mut locations = self.locations.lock();
        match event {
            ChangeEvent::Insert(change) => {
                if !change.new.flag("activo") {
                    traffic!("Ignoring inactive location {:?}", change.new.id());
                    return;
                }
                let Some(location) = Location::from_record(&change.new) else {
                    return;
                };
                if !locations.iter().any(|l| l.id == location.id) {
                    locations.push(location);
                }
            }
            ChangeEvent::Update(change) => {
                let Some(updated) = Location::from_record(&change.new) else {
                    return;
                };
                if let Some(slot) = locations.iter_mut().find(|l| l.id == updated.id) {
                    *slot = updated;
                }
            }
            ChangeEvent::Delete(change) => {
                if let Some(id) = change.old.id() {
                    locations.retain(|l| l.id != id);
                }
            }
        }
    }

    /// Handlers feeding every `negocios` change into [`apply`](Self::apply).
    pub fn handlers(&self) -> ChangeHandlers {
        let on_insert = self.clone();
        let on_update = self.clone();
        let on_delete = self.clone();
        ChangeHandlers::new()
            .on_insert(move |change| {
                tracing::debug!("Location inserted: {:?}", change.new.id());
                on_insert.apply(&ChangeEvent::Insert(change.clone()));
                Ok(())
            })
            .on_update(move |change| {
                tracing::debug!("Location updated: {:?}", change.new.id());
                on_update.apply(&ChangeEvent::Update(change.clone()));
                Ok(())
            })
            .on_delete(move |change| {
                tracing::debug!("Location deleted: {:?}", change.old.id());
                on_delete.apply(&ChangeEvent::Delete(change.clone()));
                Ok(())
            })
            .on_error(|e| tracing::error!("Error in negocios subscription: {}", e))
    }

    pub fn subscribe<T>(&self, manager: &SubscriptionManager<T>) -> Result<Subscription<T>>
    where
        T: ChangefeedTransport + Clone,
    {
        manager.subscribe(TableName::Negocios, EventFilter::Any, self.handlers())
    }

    /// Shows the location at once under a placeholder id, then swaps in the
    /// stored one. The placeholder is removed if the backend refuses.
    pub async fn add(&self, location: NewLocation) -> std::result::Result<Location, BackendError> {
        let placeholder = format!("pending-{}", PENDING_SEQ.fetch_add(1, Ordering::Relaxed));
        let local = location.with_id(placeholder.clone());

        let stored = OptimisticOperation::new(
            || self.locations.lock().push(local),
            || self.backend.create(location),
            || self.locations.lock().retain(|l| l.id != placeholder),
        )
        .label("add location")
        .run()
        .await?;

        let mut locations = self.locations.lock();
        let already_known = locations.iter().any(|l| l.id == stored.id);
        match locations.iter().position(|l| l.id == placeholder) {
            Some(index) if !already_known => locations[index] = stored.clone(),
            Some(index) => {
                locations.remove(index);
            }
            None if !already_known => locations.push(stored.clone()),
            None => {}
        }
        Ok(stored)
    }

    /// Replaces the location locally, restoring the previous value if the
    /// backend refuses.
    pub async fn update(&self, location: Location) -> std::result::Result<(), BackendError> {
        let previous = self.get(&location.id);
        let local = location.clone();

        OptimisticOperation::new(
            || {
                if let Some(slot) = self.locations.lock().iter_mut().find(|l| l.id == local.id) {
                    *slot = local.clone();
                }
            },
            || self.backend.update(location),
            || {
                if let Some(previous) = previous {
                    if let Some(slot) = self.locations.lock().iter_mut().find(|l| l.id == previous.id) {
                        *slot = previous;
                    }
                }
            },
        )
        .label("update location")
        .run()
        .await
    }

    /// Removes the location locally, putting it back in place if the backend
    /// refuses.
    pub async fn delete(&self, id: &str) -> std::result::Result<(), BackendError> {
        let removed = {
            let locations = self.locations.lock();
            locations
                .iter()
                .position(|l| l.id == id)
                .map(|index| (index, locations[index].clone()))
        };

        OptimisticOperation::new(
            || self.locations.lock().retain(|l| l.id != id),
            || self.backend.delete(id.to_string()),
            || {
                if let Some((index, location)) = removed {
                    let mut locations = self.locations.lock();
                    if !locations.iter().any(|l| l.id == location.id) {
                        let index = index.min(locations.len());
                        locations.insert(index, location);
                    }
                }
            },
        )
        .label("delete location")
        .run()
        .await
    }
}
