//! Admission control — per-(backend class, capability) capacity enforcement.
//!
//! One counting semaphore per `(backend_class, capability)` pair, with
//! permits equal to the configured ceiling. Acquisition is fail-fast and
//! never suspends: when no permit is available the caller gets an immediate
//! `backend_overloaded` refusal (429, `Retry-After: 5`) instead of queueing.
//!
//! The counters are plain `Mutex<u32>` rather than `tokio::sync::Semaphore`
//! precisely because acquire must not await — the mutex guards only the
//! check-and-decrement pair and is held for nanoseconds.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use serde_json::{json, Value};

use crate::{
    error::GatewayError,
    registry::{BackendRegistry, Capability},
};

/// Permit state for one `(backend_class, capability)` pair.
#[derive(Debug)]
struct Slot {
    limit: u32,
    available: Mutex<u32>,
}

impl Slot {
    fn try_acquire(&self) -> bool {
        let mut available = self.available.lock().expect("admission slot poisoned");
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    fn release(&self) {
        let mut available = self.available.lock().expect("admission slot poisoned");
        // Clamp to the ceiling so a stray release can never mint permits.
        if *available < self.limit {
            *available += 1;
        }
    }
}

/// A held admission permit. Released on drop; release is idempotent, so an
/// explicit [`release`][AdmissionLease::release] followed by drop is a no-op.
#[derive(Debug)]
pub struct AdmissionLease {
    slot: Arc<Slot>,
    released: AtomicBool,
}

impl AdmissionLease {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.slot.release();
        }
    }
}

impl Drop for AdmissionLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Enforces concurrency ceilings for every backend/capability combination the
/// registry declares. Owned by the [`GatewayContext`][crate::GatewayContext];
/// constructed once at startup.
pub struct AdmissionController {
    registry: Arc<BackendRegistry>,
    slots: HashMap<(String, Capability), Arc<Slot>>,
}

impl AdmissionController {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        let mut slots = HashMap::new();
        for (class, cfg) in registry.iter() {
            for &capability in &cfg.supported_capabilities {
                let limit = cfg.limit(capability);
                tracing::info!(backend = %class, capability = %capability, limit, "admission ceiling");
                slots.insert(
                    (class.clone(), capability),
                    Arc::new(Slot { limit, available: Mutex::new(limit) }),
                );
            }
        }
        Self { registry, slots }
    }

    fn slot(&self, backend_class: &str, capability: Capability) -> Option<&Arc<Slot>> {
        let canonical = self.registry.resolve_class(backend_class);
        self.slots.get(&(canonical.to_string(), capability))
    }

    /// Reserve one unit of capacity. Never blocks.
    ///
    /// # Errors
    /// - `capability_not_supported` (400) when no ceiling exists for the pair,
    ///   with the availability list of backends that do offer the capability;
    /// - `backend_overloaded` (429) when all permits are in flight.
    pub fn acquire(
        &self,
        backend_class: &str,
        capability: Capability,
    ) -> Result<AdmissionLease, GatewayError> {
        let Some(slot) = self.slot(backend_class, capability) else {
            return Err(GatewayError::CapabilityNotSupported {
                backend_class: backend_class.to_string(),
                route_kind: capability.as_str().to_string(),
                availability: self.registry.capability_availability(capability),
            });
        };

        if !slot.try_acquire() {
            return Err(GatewayError::BackendOverloaded {
                backend_class: backend_class.to_string(),
                route_kind: capability.as_str().to_string(),
            });
        }

        Ok(AdmissionLease { slot: Arc::clone(slot), released: AtomicBool::new(false) })
    }

    /// Current `{limit, available, inflight}` per key, for the status surface.
    pub fn stats(&self) -> Value {
        let mut out = serde_json::Map::new();
        for ((class, capability), slot) in &self.slots {
            let available = *slot.available.lock().expect("admission slot poisoned");
            out.insert(
                format!("{class}.{capability}"),
                json!({
                    "limit": slot.limit,
                    "available": available,
                    "inflight": slot.limit - available,
                }),
            );
        }
        Value::Object(out)
    }
}
