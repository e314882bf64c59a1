//! Peer link transport
//!
//! [`PeerLink`] is the seam where a real inter-SP transport (CMI, RPC)
//! would plug in. [`InProcessLink`] is the shipped implementation: a
//! duplex pair of channels connecting two SPs in one process, with an
//! explicit disconnect switch to exercise peer-loss paths.

use crate::messages::{PeerRequest, PeerResponse};
use async_trait::async_trait;
use extentio_common::{Error, Result, SpId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Handler for requests arriving from the peer SP.
///
/// Each SP registers one service; dispatch to the owning store or lock
/// manager happens inside the implementation.
#[async_trait]
pub trait PeerService: Send + Sync {
    async fn handle(&self, request: PeerRequest) -> Result<PeerResponse>;
}

/// Transport to the peer SP.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Send a request and await the peer's response.
    async fn call(&self, request: PeerRequest) -> Result<PeerResponse>;

    /// Whether the peer is currently reachable.
    fn is_connected(&self) -> bool;

    /// Identity of the local side of this link.
    fn local_sp(&self) -> SpId;
}

type Envelope = (PeerRequest, oneshot::Sender<Result<PeerResponse>>);

/// In-process duplex peer link.
pub struct InProcessLink {
    local_sp: SpId,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    connected: Arc<AtomicBool>,
}

impl InProcessLink {
    /// Create a connected pair of links, one per SP.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let a = Arc::new(Self {
            local_sp: SpId::A,
            tx: tx_ab,
            rx: Mutex::new(Some(rx_ba)),
            connected: Arc::clone(&connected),
        });
        let b = Arc::new(Self {
            local_sp: SpId::B,
            tx: tx_ba,
            rx: Mutex::new(Some(rx_ab)),
            connected,
        });
        (a, b)
    }

    /// Start servicing requests from the peer with the given handler.
    ///
    /// Each request is handled on its own task so a withheld lock grant
    /// does not stall unrelated traffic.
    pub fn serve(&self, service: Arc<dyn PeerService>) {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("serve may only be called once per link side");
        let connected = Arc::clone(&self.connected);
        let sp = self.local_sp;
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                if !connected.load(Ordering::SeqCst) {
                    let _ = reply.send(Err(Error::PeerUnreachable));
                    continue;
                }
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let response = service.handle(request).await;
                    if let Err(Ok(PeerResponse::LockGranted {
                        request_id,
                        object_id,
                    })) = reply.send(response)
                    {
                        // The requester abandoned the call while the
                        // grant was in flight. Nobody will ever release
                        // this lock, so give it back right away.
                        warn!(request_id, %object_id, "grant undeliverable, releasing lock");
                        let _ = service
                            .handle(PeerRequest::LockRelease {
                                request_id,
                                object_id,
                            })
                            .await;
                    }
                });
            }
            debug!(%sp, "peer link service loop ended");
        });
    }

    /// Sever the link in both directions.
    ///
    /// In-flight calls fail with `PeerUnreachable`; subsequent calls fail
    /// immediately.
    pub fn disconnect(&self) {
        warn!(sp = %self.local_sp, "peer link disconnected");
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Restore the link after a simulated outage.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerLink for InProcessLink {
    async fn call(&self, request: PeerRequest) -> Result<PeerResponse> {
        if !self.is_connected() {
            return Err(Error::PeerUnreachable);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .map_err(|_| Error::PeerUnreachable)?;
        match reply_rx.await {
            Ok(response) => {
                if self.is_connected() {
                    response
                } else {
                    Err(Error::PeerUnreachable)
                }
            }
            Err(_) => Err(Error::PeerUnreachable),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn local_sp(&self) -> SpId {
        self.local_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl PeerService for Echo {
        async fn handle(&self, request: PeerRequest) -> Result<PeerResponse> {
            match request {
                PeerRequest::LockHoldCount { .. } => Ok(PeerResponse::HoldCount(7)),
                _ => Ok(PeerResponse::Ack),
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (a, b) = InProcessLink::pair();
        b.serve(Arc::new(Echo));

        let response = a
            .call(PeerRequest::LockHoldCount {
                object_id: extentio_common::ObjectId::new(1),
            })
            .await
            .unwrap();
        assert!(matches!(response, PeerResponse::HoldCount(7)));
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls() {
        let (a, b) = InProcessLink::pair();
        b.serve(Arc::new(Echo));
        a.disconnect();

        let err = a
            .call(PeerRequest::LockHoldCount {
                object_id: extentio_common::ObjectId::new(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable));
    }
}
