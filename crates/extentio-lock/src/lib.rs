//! Stripe lock manager
//!
//! Range locks over LBA "stripes" serialize every multi-member mutation
//! in the engine: foreground writes, rebuild passes and journal recovery
//! all queue through the same per-object table, so background work is
//! ordered against client I/O without a second lock.
//!
//! Grant discipline: shared (read) holders may overlap freely; an
//! exclusive (write) holder excludes everything overlapping, across both
//! SPs combined. Conflicting requests queue FIFO per range and are
//! granted on release. "Blocking" here suspends the calling I/O's
//! completion, never a thread.
//!
//! When the metadata element for the object is PASSIVE locally, the
//! request is forwarded to the ACTIVE SP, which serializes local and
//! peer-originated requests in the same queue.

use dashmap::DashMap;
use extentio_common::{Error, Lba, LockMode, ObjectId, Result, SpId};
use extentio_metadata::ElementTable;
use extentio_peer::{PeerLink, PeerRequest, PeerResponse};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Half-open stripe range `[stripe, stripe + count)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeRange {
    pub stripe: Lba,
    pub count: u64,
}

impl StripeRange {
    #[must_use]
    pub const fn new(stripe: Lba, count: u64) -> Self {
        Self { stripe, count }
    }

    /// Whether two ranges share at least one stripe.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.stripe < other.stripe + other.count && other.stripe < self.stripe + self.count
    }
}

struct LockRecord {
    id: u64,
    range: StripeRange,
    mode: LockMode,
    owner: SpId,
    /// Remote request id when this record was forwarded from the peer
    remote_id: Option<u64>,
    granted: bool,
    waker: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct LockTable {
    /// FIFO: queued records keep arrival order behind granted ones.
    records: Vec<LockRecord>,
}

impl LockTable {
    /// Whether the record at `index` can be granted: nothing ahead of it
    /// overlaps incompatibly.
    fn grantable(&self, index: usize) -> bool {
        let candidate = &self.records[index];
        self.records[..index].iter().all(|ahead| {
            !ahead.range.overlaps(&candidate.range) || ahead.mode.compatible(candidate.mode)
        })
    }

    /// Drop queued records whose requester went away before the grant.
    fn purge_abandoned(&mut self) {
        self.records.retain(|r| {
            r.granted || r.waker.as_ref().is_some_and(|w| !w.is_closed())
        });
    }

    /// Grant every newly grantable queued record, FIFO.
    ///
    /// A record whose requester went away between the purge and the
    /// grant is removed instead of granted: a lock nobody holds a guard
    /// for would block its range on both SPs forever.
    fn grant_ready(&mut self) {
        self.purge_abandoned();
        let mut index = 0;
        while index < self.records.len() {
            if self.records[index].granted || !self.grantable(index) {
                index += 1;
                continue;
            }
            let record = &mut self.records[index];
            let delivered = match record.waker.take() {
                Some(waker) => waker.send(()).is_ok(),
                None => true,
            };
            if delivered {
                record.granted = true;
                index += 1;
            } else {
                // Requester gave up; re-check this index, the removal
                // may unblock what shifted into it.
                self.records.remove(index);
            }
        }
    }
}

enum GuardKey {
    Local(u64),
    Remote(u64),
}

/// A held stripe lock. Dropping the guard releases the lock and grants
/// the next queued compatible request(s).
pub struct StripeLockGuard {
    manager: Arc<StripeLockManager>,
    object_id: ObjectId,
    key: GuardKey,
    released: bool,
}

impl StripeLockGuard {
    /// Release explicitly (remote releases complete before returning).
    pub async fn release(mut self) {
        self.released = true;
        match &self.key {
            GuardKey::Local(id) => self.manager.release_local(self.object_id, *id),
            GuardKey::Remote(request_id) => {
                let result = self
                    .manager
                    .peer
                    .call(PeerRequest::LockRelease {
                        request_id: *request_id,
                        object_id: self.object_id,
                    })
                    .await;
                if let Err(e) = result {
                    warn!(object_id = %self.object_id, error = %e, "remote lock release failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for StripeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeLockGuard")
            .field("object_id", &self.object_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for StripeLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match &self.key {
            GuardKey::Local(id) => self.manager.release_local(self.object_id, *id),
            GuardKey::Remote(request_id) => {
                let manager = Arc::clone(&self.manager);
                let object_id = self.object_id;
                let request_id = *request_id;
                tokio::spawn(async move {
                    let _ = manager
                        .peer
                        .call(PeerRequest::LockRelease {
                            request_id,
                            object_id,
                        })
                        .await;
                });
            }
        }
    }
}

/// Per-SP stripe lock manager.
pub struct StripeLockManager {
    local_sp: SpId,
    element: Arc<ElementTable>,
    peer: Arc<dyn PeerLink>,
    tables: DashMap<ObjectId, Arc<Mutex<LockTable>>>,
    next_id: AtomicU64,
}

impl StripeLockManager {
    #[must_use]
    pub fn new(local_sp: SpId, element: Arc<ElementTable>, peer: Arc<dyn PeerLink>) -> Self {
        Self {
            local_sp,
            element,
            peer,
            tables: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self, object_id: ObjectId) -> Arc<Mutex<LockTable>> {
        self.tables
            .entry(object_id)
            .or_insert_with(|| Arc::new(Mutex::new(LockTable::default())))
            .clone()
    }

    /// Acquire a stripe lock, suspending until granted.
    ///
    /// On the PASSIVE side the request is forwarded to the ACTIVE SP; if
    /// the peer link drops while the forward is outstanding, the request
    /// fails back with `PeerUnreachable`.
    pub async fn acquire(
        self: &Arc<Self>,
        object_id: ObjectId,
        stripe: Lba,
        stripe_count: u64,
        mode: LockMode,
    ) -> Result<StripeLockGuard> {
        if self.element.is_active(object_id)? {
            let (id, rx) = self.enqueue_local(object_id, stripe, stripe_count, mode, self.local_sp, None);
            if let Some(rx) = rx {
                rx.await
                    .map_err(|_| Error::internal("lock grant channel dropped"))?;
            }
            trace!(%object_id, stripe, stripe_count, ?mode, "stripe lock granted locally");
            Ok(StripeLockGuard {
                manager: Arc::clone(self),
                object_id,
                key: GuardKey::Local(id),
                released: false,
            })
        } else {
            let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let response = self
                .peer
                .call(PeerRequest::LockAcquire {
                    request_id,
                    object_id,
                    stripe,
                    stripe_count,
                    mode,
                    from: self.local_sp,
                })
                .await?;
            match response {
                PeerResponse::LockGranted { .. } => {
                    trace!(%object_id, stripe, stripe_count, ?mode, "stripe lock granted by peer");
                    Ok(StripeLockGuard {
                        manager: Arc::clone(self),
                        object_id,
                        key: GuardKey::Remote(request_id),
                        released: false,
                    })
                }
                other => Err(Error::internal(format!(
                    "unexpected peer response to LockAcquire: {other:?}"
                ))),
            }
        }
    }

    /// Acquire with a timeout budget. An expired wait is dequeued on the
    /// next grant pass; the range is not leaked.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        object_id: ObjectId,
        stripe: Lba,
        stripe_count: u64,
        mode: LockMode,
        budget: Duration,
    ) -> Result<StripeLockGuard> {
        tokio::time::timeout(budget, self.acquire(object_id, stripe, stripe_count, mode))
            .await
            .map_err(|_| Error::Timeout(format!("stripe lock [{stripe},+{stripe_count})")))?
    }

    /// Enqueue on the local table; returns a wait channel unless the
    /// record was granted immediately.
    fn enqueue_local(
        &self,
        object_id: ObjectId,
        stripe: Lba,
        stripe_count: u64,
        mode: LockMode,
        owner: SpId,
        remote_id: Option<u64>,
    ) -> (u64, Option<oneshot::Receiver<()>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let table = self.table(object_id);
        let mut table = table.lock();
        table.purge_abandoned();

        let (tx, rx) = oneshot::channel();
        table.records.push(LockRecord {
            id,
            range: StripeRange::new(stripe, stripe_count),
            mode,
            owner,
            remote_id,
            granted: false,
            waker: Some(tx),
        });
        let index = table.records.len() - 1;
        if table.grantable(index) {
            table.records[index].granted = true;
            table.records[index].waker = None;
            (id, None)
        } else {
            debug!(%object_id, stripe, stripe_count, ?mode, "stripe lock queued");
            (id, Some(rx))
        }
    }

    fn release_local(&self, object_id: ObjectId, id: u64) {
        let table = self.table(object_id);
        let mut table = table.lock();
        table.records.retain(|r| r.id != id);
        table.grant_ready();
    }

    /// Service a lock acquire forwarded from the peer SP. The future
    /// resolves only when the lock is granted.
    pub async fn handle_peer_acquire(
        &self,
        request_id: u64,
        object_id: ObjectId,
        stripe: Lba,
        stripe_count: u64,
        mode: LockMode,
        from: SpId,
    ) -> Result<PeerResponse> {
        let (_, rx) =
            self.enqueue_local(object_id, stripe, stripe_count, mode, from, Some(request_id));
        if let Some(rx) = rx {
            rx.await
                .map_err(|_| Error::internal("lock grant channel dropped"))?;
        }
        Ok(PeerResponse::LockGranted {
            request_id,
            object_id,
        })
    }

    /// Service a lock release forwarded from the peer SP.
    pub fn handle_peer_release(&self, request_id: u64, object_id: ObjectId) {
        let table = self.table(object_id);
        let mut table = table.lock();
        table.records.retain(|r| r.remote_id != Some(request_id));
        table.grant_ready();
    }

    /// Granted locks currently held on behalf of the peer SP.
    #[must_use]
    pub fn peer_hold_count(&self, object_id: ObjectId) -> u64 {
        let Some(table) = self.tables.get(&object_id) else {
            return 0;
        };
        let table = table.lock();
        table
            .records
            .iter()
            .filter(|r| r.granted && r.owner != self.local_sp)
            .count() as u64
    }

    /// Whether any lock (granted or queued) exists for the object.
    /// Used to decide whether an active-role handoff is safe.
    #[must_use]
    pub fn has_outstanding(&self, object_id: ObjectId) -> bool {
        self.tables
            .get(&object_id)
            .is_some_and(|t| !t.lock().records.is_empty())
    }

    /// Count of concurrently granted write locks overlapping a range.
    /// Observability hook for mutual-exclusion verification.
    #[must_use]
    pub fn granted_writers(&self, object_id: ObjectId, stripe: Lba, stripe_count: u64) -> u64 {
        let probe = StripeRange::new(stripe, stripe_count);
        let Some(table) = self.tables.get(&object_id) else {
            return 0;
        };
        let table = table.lock();
        table
            .records
            .iter()
            .filter(|r| r.granted && r.mode == LockMode::Write && r.range.overlaps(&probe))
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentio_metadata::ElementState;
    use async_trait::async_trait;

    struct NoPeer;

    #[async_trait]
    impl PeerLink for NoPeer {
        async fn call(&self, _request: PeerRequest) -> Result<PeerResponse> {
            Err(Error::PeerUnreachable)
        }
        fn is_connected(&self) -> bool {
            false
        }
        fn local_sp(&self) -> SpId {
            SpId::A
        }
    }

    fn manager() -> (Arc<StripeLockManager>, ObjectId) {
        let element = Arc::new(ElementTable::new());
        let id = ObjectId::new(1);
        element.register(id, ElementState::Active);
        (
            Arc::new(StripeLockManager::new(SpId::A, element, Arc::new(NoPeer))),
            id,
        )
    }

    #[test]
    fn test_range_overlap() {
        let a = StripeRange::new(0, 2);
        assert!(a.overlaps(&StripeRange::new(1, 1)));
        assert!(!a.overlaps(&StripeRange::new(2, 1)));
        assert!(StripeRange::new(5, 10).overlaps(&StripeRange::new(0, 6)));
    }

    #[tokio::test]
    async fn test_readers_share_writers_exclude() {
        let (mgr, id) = manager();

        let r1 = mgr.acquire(id, 0, 4, LockMode::Read).await.unwrap();
        let _r2 = mgr.acquire(id, 2, 4, LockMode::Read).await.unwrap();

        // Overlapping write must wait for both readers.
        let w = mgr.acquire_timeout(id, 0, 1, LockMode::Write, Duration::from_millis(50));
        assert!(matches!(w.await, Err(Error::Timeout(_))));

        r1.release().await;
        // Still blocked by r2? r2 covers [2,6), write wants [0,1): no overlap
        // with r2, so it grants now.
        let w = mgr
            .acquire_timeout(id, 0, 1, LockMode::Write, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(mgr.granted_writers(id, 0, 1), 1);
        drop(w);
    }

    #[tokio::test]
    async fn test_write_lock_fifo_grant_on_release() {
        let (mgr, id) = manager();

        let w1 = mgr.acquire(id, 0, 1, LockMode::Write).await.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = tokio::spawn(async move {
            mgr2.acquire(id, 0, 2, LockMode::Write).await.unwrap()
        });

        // Second writer must not be granted while the first is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.granted_writers(id, 0, 2), 1);
        assert!(!waiter.is_finished());

        w1.release().await;
        let w2 = waiter.await.unwrap();
        assert_eq!(mgr.granted_writers(id, 0, 2), 1);
        drop(w2);
    }

    #[tokio::test]
    async fn test_non_overlapping_writes_concurrent() {
        let (mgr, id) = manager();
        let _a = mgr.acquire(id, 0, 1, LockMode::Write).await.unwrap();
        let _b = mgr.acquire(id, 10, 1, LockMode::Write).await.unwrap();
        assert_eq!(mgr.granted_writers(id, 0, 20), 2);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_dequeued() {
        let (mgr, id) = manager();
        let w1 = mgr.acquire(id, 0, 1, LockMode::Write).await.unwrap();

        // Times out and abandons its queue slot.
        let timed_out = mgr
            .acquire_timeout(id, 0, 1, LockMode::Write, Duration::from_millis(20))
            .await;
        assert!(timed_out.is_err());

        w1.release().await;
        // The abandoned record must not block a fresh request.
        let w2 = mgr
            .acquire_timeout(id, 0, 1, LockMode::Write, Duration::from_millis(100))
            .await
            .unwrap();
        drop(w2);
    }

    #[tokio::test]
    async fn test_passive_side_fails_back_on_peer_loss() {
        let element = Arc::new(ElementTable::new());
        let id = ObjectId::new(2);
        element.register(id, ElementState::Passive);
        let mgr = Arc::new(StripeLockManager::new(SpId::B, element, Arc::new(NoPeer)));

        let err = mgr.acquire(id, 0, 1, LockMode::Write).await.unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable));
    }
}
