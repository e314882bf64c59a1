//! Per-object metadata element
//!
//! Each configured object has exactly one ACTIVE side across the SP pair;
//! the PASSIVE side proxies metadata mutations to the ACTIVE side. A
//! passive-to-active handoff ("passive request") is honored only when the
//! current active side holds no state that would be orphaned.

use dashmap::DashMap;
use extentio_common::{Error, LifecycleState, ObjectId, Result};
use extentio_peer::{PeerLink, PeerRequest, PeerResponse};
use std::sync::Arc;
use tracing::info;

/// Metadata element role for one object on one SP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementState {
    /// This SP is authoritative for the object's metadata
    Active,
    /// The peer SP is authoritative; mutations are forwarded
    Passive,
}

#[derive(Clone, Copy, Debug)]
struct ElementInfo {
    state: ElementState,
    lifecycle: LifecycleState,
}

/// Table of metadata elements for all objects on one SP.
pub struct ElementTable {
    entries: DashMap<ObjectId, ElementInfo>,
}

impl ElementTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register an object with its initial role.
    pub fn register(&self, object_id: ObjectId, state: ElementState) {
        self.entries.insert(
            object_id,
            ElementInfo {
                state,
                lifecycle: LifecycleState::Activate,
            },
        );
    }

    /// Whether this SP holds the ACTIVE role for the object.
    pub fn is_active(&self, object_id: ObjectId) -> Result<bool> {
        self.entries
            .get(&object_id)
            .map(|e| e.state == ElementState::Active)
            .ok_or(Error::NotFound(object_id))
    }

    /// Current role for the object.
    pub fn state(&self, object_id: ObjectId) -> Result<ElementState> {
        self.entries
            .get(&object_id)
            .map(|e| e.state)
            .ok_or(Error::NotFound(object_id))
    }

    /// Force the role (fail-over and handoff paths).
    pub fn set_state(&self, object_id: ObjectId, state: ElementState) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&object_id)
            .ok_or(Error::NotFound(object_id))?;
        entry.state = state;
        Ok(())
    }

    /// Record the local lifecycle state.
    pub fn set_lifecycle(&self, object_id: ObjectId, state: LifecycleState) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&object_id)
            .ok_or(Error::NotFound(object_id))?;
        entry.lifecycle = state;
        Ok(())
    }

    /// Local lifecycle state.
    pub fn lifecycle(&self, object_id: ObjectId) -> Result<LifecycleState> {
        self.entries
            .get(&object_id)
            .map(|e| e.lifecycle)
            .ok_or(Error::NotFound(object_id))
    }

    /// Ask the peer to surrender the ACTIVE role for an object.
    ///
    /// The request is honored only when the peer reports no outstanding
    /// forwarded locks for the object; on success this SP becomes ACTIVE.
    pub async fn request_active(
        &self,
        object_id: ObjectId,
        peer: &Arc<dyn PeerLink>,
    ) -> Result<bool> {
        if self.is_active(object_id)? {
            return Ok(true);
        }
        match peer.call(PeerRequest::RequestActive { object_id }).await? {
            PeerResponse::ActiveGranted(true) => {
                self.set_state(object_id, ElementState::Active)?;
                info!(%object_id, "passive request granted, now ACTIVE");
                Ok(true)
            }
            PeerResponse::ActiveGranted(false) => Ok(false),
            other => Err(Error::internal(format!(
                "unexpected peer response to RequestActive: {other:?}"
            ))),
        }
    }
}

impl Default for ElementTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_roles() {
        let table = ElementTable::new();
        let id = ObjectId::new(1);
        table.register(id, ElementState::Active);
        assert!(table.is_active(id).unwrap());

        table.set_state(id, ElementState::Passive).unwrap();
        assert!(!table.is_active(id).unwrap());
        assert_eq!(table.state(id).unwrap(), ElementState::Passive);
    }

    #[test]
    fn test_unknown_object() {
        let table = ElementTable::new();
        assert!(matches!(
            table.is_active(ObjectId::new(9)),
            Err(Error::NotFound(_))
        ));
    }
}
