//! Storage processor assembly
//!
//! One [`StorageProcessor`] owns the per-SP stores (element table,
//! non-paged, paged, stripe locks) and the groups configured on it.
//! [`SpService`] is the dispatcher for requests arriving over the peer
//! link. [`SpPair`] wires two SPs back to back over an in-process link,
//! which is how the engine ships and how the dual-SP scenarios are
//! exercised.

use crate::group::{GroupSpec, RaidGroup};
use async_trait::async_trait;
use dashmap::DashMap;
use extentio_common::{EngineConfig, Error, ObjectId, Result, SpId};
use extentio_journal::{RekeyCipher, WriteLog};
use extentio_lock::StripeLockManager;
use extentio_metadata::{ElementState, ElementTable, NonPagedStore, PagedStore};
use extentio_peer::{
    InProcessLink, PeerLink, PeerRequest, PeerResponse, PeerService,
};
use extentio_storage::DriveSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// One storage processor: per-SP stores plus the groups it serves.
pub struct StorageProcessor {
    sp: SpId,
    element: Arc<ElementTable>,
    nonpaged: Arc<NonPagedStore>,
    paged: Arc<PagedStore>,
    locks: Arc<StripeLockManager>,
    groups: DashMap<ObjectId, Arc<RaidGroup>>,
}

impl StorageProcessor {
    /// Build an SP over its backing directory and peer link.
    pub fn new(sp: SpId, dir: impl AsRef<Path>, peer: Arc<dyn PeerLink>) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        let element = Arc::new(ElementTable::new());
        let nonpaged = Arc::new(NonPagedStore::new(dir.join("nonpaged"), Arc::clone(&peer))?);
        let paged = Arc::new(PagedStore::new(
            dir.join("paged"),
            Arc::clone(&element),
            Arc::clone(&peer),
        )?);
        let locks = Arc::new(StripeLockManager::new(sp, Arc::clone(&element), peer));
        Ok(Arc::new(Self {
            sp,
            element,
            nonpaged,
            paged,
            locks,
            groups: DashMap::new(),
        }))
    }

    #[must_use]
    pub fn sp(&self) -> SpId {
        self.sp
    }

    #[must_use]
    pub fn element(&self) -> &Arc<ElementTable> {
        &self.element
    }

    #[must_use]
    pub fn nonpaged(&self) -> &Arc<NonPagedStore> {
        &self.nonpaged
    }

    #[must_use]
    pub fn paged(&self) -> &Arc<PagedStore> {
        &self.paged
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<StripeLockManager> {
        &self.locks
    }

    /// Configure a group on this SP with the given metadata role.
    pub fn add_group(
        &self,
        spec: &GroupSpec,
        role: ElementState,
        config: EngineConfig,
        drives: Arc<DriveSet>,
        journal: Arc<WriteLog>,
        cipher: Arc<RekeyCipher>,
    ) -> Result<Arc<RaidGroup>> {
        self.element.register(spec.id, role);
        let group = RaidGroup::new(
            spec,
            self.sp,
            config,
            drives,
            Arc::clone(&self.element),
            Arc::clone(&self.nonpaged),
            Arc::clone(&self.paged),
            Arc::clone(&self.locks),
            journal,
            cipher,
        )?;
        self.groups.insert(spec.id, Arc::clone(&group));
        info!(sp = %self.sp, group = %spec.id, ?role, "group configured");
        Ok(group)
    }

    /// Look up a configured group.
    pub fn group(&self, id: ObjectId) -> Result<Arc<RaidGroup>> {
        self.groups
            .get(&id)
            .map(|g| Arc::clone(&g))
            .ok_or(Error::NotFound(id))
    }
}

/// Peer-request dispatcher for one SP.
pub struct SpService(Arc<StorageProcessor>);

impl SpService {
    #[must_use]
    pub fn new(sp: Arc<StorageProcessor>) -> Arc<Self> {
        Arc::new(Self(sp))
    }
}

#[async_trait]
impl PeerService for SpService {
    async fn handle(&self, request: PeerRequest) -> Result<PeerResponse> {
        let sp = &self.0;
        match request {
            PeerRequest::NonpagedMirror { object_id, record } => {
                sp.nonpaged.apply_peer_mirror(object_id, &record)?;
                Ok(PeerResponse::Ack)
            }
            PeerRequest::PagedMutate { object_id, op } => {
                sp.paged.apply_peer_mutate(object_id, op).await?;
                Ok(PeerResponse::Ack)
            }
            PeerRequest::PagedShadowPush {
                object_id,
                chunk_index,
                records,
            } => {
                sp.paged.apply_shadow_push(object_id, chunk_index, &records)?;
                Ok(PeerResponse::Ack)
            }
            PeerRequest::LockAcquire {
                request_id,
                object_id,
                stripe,
                stripe_count,
                mode,
                from,
            } => {
                sp.locks
                    .handle_peer_acquire(request_id, object_id, stripe, stripe_count, mode, from)
                    .await
            }
            PeerRequest::LockRelease {
                request_id,
                object_id,
            } => {
                sp.locks.handle_peer_release(request_id, object_id);
                Ok(PeerResponse::Ack)
            }
            PeerRequest::LockHoldCount { object_id } => {
                Ok(PeerResponse::HoldCount(sp.locks.peer_hold_count(object_id)))
            }
            PeerRequest::RequestActive { object_id } => {
                // Surrender the active role only when no lock state would
                // be orphaned by the handoff.
                if sp.locks.has_outstanding(object_id) {
                    return Ok(PeerResponse::ActiveGranted(false));
                }
                sp.element.set_state(object_id, ElementState::Passive)?;
                info!(sp = %sp.sp, %object_id, "surrendered ACTIVE role to peer");
                Ok(PeerResponse::ActiveGranted(true))
            }
        }
    }
}

/// A connected pair of storage processors sharing their member drives.
pub struct SpPair {
    pub a: Arc<StorageProcessor>,
    pub b: Arc<StorageProcessor>,
    link_a: Arc<InProcessLink>,
    config: EngineConfig,
    dir: PathBuf,
}

impl SpPair {
    /// Build both SPs under `dir` and start their peer services.
    pub fn create(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (link_a, link_b) = InProcessLink::pair();
        let a = StorageProcessor::new(SpId::A, dir.join("spa"), Arc::clone(&link_a) as _)?;
        let b = StorageProcessor::new(SpId::B, dir.join("spb"), Arc::clone(&link_b) as _)?;
        // Each side serves the requests its peer sends.
        link_a.serve(SpService::new(Arc::clone(&a)));
        link_b.serve(SpService::new(Arc::clone(&b)));
        Ok(Self {
            a,
            b,
            link_a,
            config,
            dir,
        })
    }

    /// Configure a group on both SPs: SPA takes the ACTIVE metadata
    /// role. The drive set, write log and key state are the shared
    /// physical medium between the two sides.
    pub fn create_group(&self, spec: &GroupSpec, key: [u8; 32]) -> Result<(Arc<RaidGroup>, Arc<RaidGroup>)> {
        let capacity = spec.member_user_blocks + WriteLog::region_blocks(&self.config.journal);
        let drives = Arc::new(DriveSet::create(
            self.dir.join(format!("drives_{:x}", spec.id.as_u64())),
            spec.width,
            capacity,
        )?);
        let journal = Arc::new(WriteLog::new(
            spec.member_user_blocks,
            self.config.journal.clone(),
        ));
        let cipher = Arc::new(RekeyCipher::new(key));

        let group_a = self.a.add_group(
            spec,
            ElementState::Active,
            self.config.clone(),
            Arc::clone(&drives),
            Arc::clone(&journal),
            Arc::clone(&cipher),
        )?;
        let group_b = self.b.add_group(
            spec,
            ElementState::Passive,
            self.config.clone(),
            drives,
            journal,
            cipher,
        )?;
        Ok((group_a, group_b))
    }

    /// Sever the inter-SP link (both directions).
    pub fn sever_link(&self) {
        self.link_a.disconnect();
    }

    /// Restore the inter-SP link.
    pub fn restore_link(&self) {
        self.link_a.reconnect();
    }
}
