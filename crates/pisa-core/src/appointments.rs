//! Durable registry of accepted appointments.
//!
//! The inspector hands over fully validated appointments; this registry
//! persists them under the `appointments` namespace and serves them to the
//! watching components. Appointments leave the registry when their response
//! reaches final confirmation or they expire untriggered.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::store::{ItemStore, ItemStoreError, ItemStoreExt};
use crate::types::{Appointment, AppointmentId};

const NAMESPACE: &str = "appointments";

pub struct AppointmentRegistry {
    store: Arc<dyn ItemStore>,
    // BTreeMap keeps iteration in appointment-id order, which is what
    // makes component action emission stable.
    appointments: RwLock<BTreeMap<AppointmentId, Arc<Appointment>>>,
}

impl AppointmentRegistry {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store, appointments: RwLock::new(BTreeMap::new()) }
    }

    /// Loads every persisted appointment. Called once at startup, before
    /// the first head is processed.
    pub fn restore(&self) -> Result<usize, ItemStoreError> {
        let mut restored = BTreeMap::new();
        for (key, bytes) in self.store.scan_prefix(NAMESPACE, &[])? {
            let appointment: Appointment = serde_json::from_slice(&bytes).map_err(|source| {
                ItemStoreError::Corrupt { namespace: NAMESPACE.to_string(), source }
            })?;
            debug_assert_eq!(key, appointment.id.to_vec());
            restored.insert(appointment.id, Arc::new(appointment));
        }
        let count = restored.len();
        *self.appointments.write() = restored;
        info!(appointments = count, "appointment registry restored");
        Ok(count)
    }

    /// Accepts an appointment. A duplicate id overwrites: appointment
    /// identity is the inspector's concern and last write wins.
    pub fn add(&self, appointment: Appointment) -> Result<(), ItemStoreError> {
        let bytes = serde_json::to_vec(&appointment).map_err(|source| {
            ItemStoreError::Corrupt { namespace: NAMESPACE.to_string(), source }
        })?;
        self.store.put(NAMESPACE, &appointment.id, &bytes)?;
        debug!(start = appointment.start_block, end = appointment.end_block, "appointment added");
        self.appointments.write().insert(appointment.id, Arc::new(appointment));
        Ok(())
    }

    /// Drops an appointment; returns whether it was present.
    pub fn remove(&self, id: &AppointmentId) -> Result<bool, ItemStoreError> {
        self.store.delete(NAMESPACE, id)?;
        Ok(self.appointments.write().remove(id).is_some())
    }

    #[must_use]
    pub fn get(&self, id: &AppointmentId) -> Option<Arc<Appointment>> {
        self.appointments.read().get(id).cloned()
    }

    /// All appointments in id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Appointment>> {
        self.appointments.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.appointments.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.appointments.read().is_empty()
    }
}
