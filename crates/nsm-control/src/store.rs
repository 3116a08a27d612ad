//! Dataplane store shared by the registrar and the health monitors
//!
//! The store maps a dataplane name to its registration record. It enforces name
//! uniqueness on insert and is the only place dataplane state lives; the
//! registrar adds and removes entries, and each dataplane's own monitor is the
//! sole writer of its mechanism lists.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nsm_proto::Mechanism;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// A registered dataplane
#[derive(Debug, Clone, PartialEq)]
pub struct Dataplane {
    /// Unique name the dataplane registered under
    pub registered_name: String,
    /// Socket the dataplane serves its monitoring endpoint on
    pub socket_location: String,
    pub local_mechanisms: Vec<Mechanism>,
    pub remote_mechanisms: Vec<Mechanism>,
    /// Identifies this particular registration of the name
    pub registration_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

impl Dataplane {
    pub fn new(registered_name: &str, socket_location: &str) -> Self {
        Self {
            registered_name: registered_name.to_string(),
            socket_location: socket_location.to_string(),
            local_mechanisms: Vec::new(),
            remote_mechanisms: Vec::new(),
            registration_id: Uuid::new_v4(),
            registered_at: Utc::now(),
        }
    }
}

/// Store errors
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("dataplane with name {0} already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Default)]
struct StoreInner {
    dataplanes: DashMap<String, Dataplane>,
    changed: Notify,
}

/// Concurrent map of registered dataplanes
///
/// Cloning the store yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct DataplaneStore {
    inner: Arc<StoreInner>,
}

impl DataplaneStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of a dataplane's record
    pub fn get(&self, name: &str) -> Option<Dataplane> {
        self.inner
            .dataplanes
            .get(name)
            .map(|entry| entry.value().clone())
    }

    /// Add a dataplane (fails if the name is already registered)
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyRegistered` and leaves the store untouched if
    /// a dataplane with the same name is present.
    pub fn add(&self, dataplane: Dataplane) -> Result<(), StoreError> {
        match self
            .inner
            .dataplanes
            .entry(dataplane.registered_name.clone())
        {
            Entry::Occupied(_) => {
                tracing::warn!(
                    dataplane = %dataplane.registered_name,
                    "Dataplane already exists in the store"
                );
                return Err(StoreError::AlreadyRegistered(dataplane.registered_name));
            }
            Entry::Vacant(vacant) => {
                tracing::info!(
                    dataplane = %dataplane.registered_name,
                    socket = %dataplane.socket_location,
                    registration_id = %dataplane.registration_id,
                    "Added dataplane to the store"
                );
                vacant.insert(dataplane);
            }
        }

        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Delete a dataplane by name
    ///
    /// Returns the removed record, or None if it was not present.
    pub fn delete(&self, name: &str) -> Option<Dataplane> {
        let removed = self.inner.dataplanes.remove(name).map(|(_, dp)| dp);
        if removed.is_some() {
            tracing::info!(dataplane = %name, "Deleted dataplane from the store");
            self.inner.changed.notify_waiters();
        } else {
            tracing::debug!(dataplane = %name, "Dataplane not in the store, nothing to delete");
        }
        removed
    }

    /// Delete a dataplane only if it is still the given registration
    ///
    /// A newer registration of the same name is left in place.
    pub fn delete_registration(&self, name: &str, registration_id: Uuid) -> Option<Dataplane> {
        let removed = self
            .inner
            .dataplanes
            .remove_if(name, |_, dp| dp.registration_id == registration_id)
            .map(|(_, dp)| dp);
        if removed.is_some() {
            tracing::info!(
                dataplane = %name,
                registration_id = %registration_id,
                "Deleted dataplane registration from the store"
            );
            self.inner.changed.notify_waiters();
        }
        removed
    }

    /// Replace the mechanism lists of a registration
    ///
    /// Returns false if the registration is no longer in the store.
    pub fn update_mechanisms(
        &self,
        name: &str,
        registration_id: Uuid,
        local_mechanisms: Vec<Mechanism>,
        remote_mechanisms: Vec<Mechanism>,
    ) -> bool {
        let updated = match self.inner.dataplanes.get_mut(name) {
            Some(mut entry) if entry.registration_id == registration_id => {
                entry.local_mechanisms = local_mechanisms;
                entry.remote_mechanisms = remote_mechanisms;
                true
            }
            _ => false,
        };
        if updated {
            self.inner.changed.notify_waiters();
        }
        updated
    }

    /// List all registered dataplanes
    pub fn list(&self) -> Vec<Dataplane> {
        self.inner
            .dataplanes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get the total count of registered dataplanes
    pub fn count(&self) -> usize {
        self.inner.dataplanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dataplanes.is_empty()
    }

    /// Wait until a dataplane is present
    ///
    /// With `Some(name)` waits for that dataplane, with `None` for any. The
    /// wait is unbounded; callers put their own deadline around it.
    pub async fn wait_for_dataplane(&self, name: Option<&str>) -> Dataplane {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(dataplane) = self.find(name) {
                return dataplane;
            }

            notified.await;
        }
    }

    fn find(&self, name: Option<&str>) -> Option<Dataplane> {
        match name {
            Some(name) => self.get(name),
            None => self
                .inner
                .dataplanes
                .iter()
                .next()
                .map(|entry| entry.value().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_proto::MechanismType;
    use std::time::Duration;

    #[test]
    fn test_add_and_get() {
        let store = DataplaneStore::new();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();

        let dataplane = store.get("dp1").unwrap();
        assert_eq!(dataplane.registered_name, "dp1");
        assert_eq!(dataplane.socket_location, "/tmp/dp1.sock");
        assert!(dataplane.local_mechanisms.is_empty());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_add_duplicate_leaves_store_unchanged() {
        let store = DataplaneStore::new();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();
        let before = store.get("dp1").unwrap();

        let result = store.add(Dataplane::new("dp1", "/tmp/other.sock"));
        assert_eq!(result, Err(StoreError::AlreadyRegistered("dp1".to_string())));
        assert!(result.unwrap_err().to_string().contains("already registered"));

        assert_eq!(store.get("dp1").unwrap(), before);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = DataplaneStore::new();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();

        assert!(store.delete("dp1").is_some());
        assert!(store.delete("dp1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_registration_ignores_newer_registration() {
        let store = DataplaneStore::new();
        let first = Dataplane::new("dp1", "/tmp/dp1.sock");
        let first_id = first.registration_id;
        store.add(first).unwrap();
        store.delete("dp1");

        let second = Dataplane::new("dp1", "/tmp/dp1.sock");
        let second_id = second.registration_id;
        store.add(second).unwrap();

        assert!(store.delete_registration("dp1", first_id).is_none());
        assert_eq!(store.get("dp1").unwrap().registration_id, second_id);

        assert!(store.delete_registration("dp1", second_id).is_some());
        assert!(store.get("dp1").is_none());
    }

    #[test]
    fn test_update_mechanisms_replaces_lists() {
        let store = DataplaneStore::new();
        let dataplane = Dataplane::new("dp1", "/tmp/dp1.sock");
        let id = dataplane.registration_id;
        store.add(dataplane).unwrap();

        let kernel = Mechanism::new(MechanismType::KernelInterface);
        let vxlan = Mechanism::new(MechanismType::Vxlan);
        assert!(store.update_mechanisms("dp1", id, vec![kernel.clone()], vec![vxlan.clone()]));
        assert!(store.update_mechanisms("dp1", id, vec![], vec![vxlan.clone()]));

        let dataplane = store.get("dp1").unwrap();
        assert!(dataplane.local_mechanisms.is_empty());
        assert_eq!(dataplane.remote_mechanisms, vec![vxlan]);
    }

    #[test]
    fn test_update_mechanisms_after_delete() {
        let store = DataplaneStore::new();
        let dataplane = Dataplane::new("dp1", "/tmp/dp1.sock");
        let id = dataplane.registration_id;
        store.add(dataplane).unwrap();
        store.delete("dp1");

        assert!(!store.update_mechanisms("dp1", id, vec![], vec![]));
        assert!(store.get("dp1").is_none());
    }

    #[test]
    fn test_list() {
        let store = DataplaneStore::new();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();
        store.add(Dataplane::new("dp2", "/tmp/dp2.sock")).unwrap();

        let mut names: Vec<String> = store
            .list()
            .into_iter()
            .map(|dp| dp.registered_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["dp1".to_string(), "dp2".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_dataplane_wakes_on_add() {
        let store = DataplaneStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_dataplane(Some("dp1")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.add(Dataplane::new("other", "/tmp/other.sock")).unwrap();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();

        let dataplane = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dataplane.registered_name, "dp1");
    }

    #[tokio::test]
    async fn test_wait_for_any_dataplane_returns_present_entry() {
        let store = DataplaneStore::new();
        store.add(Dataplane::new("dp1", "/tmp/dp1.sock")).unwrap();

        let dataplane = tokio::time::timeout(Duration::from_millis(100), store.wait_for_dataplane(None))
            .await
            .unwrap();
        assert_eq!(dataplane.registered_name, "dp1");
    }
}
