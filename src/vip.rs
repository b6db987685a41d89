//! VIPs and VIP-connection slots
//!
//! One VIP per resolved endpoint address. A VIP owns the connection manager
//! bound to that address and a fixed number of connection slots; the slots
//! migrate between the worker's idle list and dispatch futures by move, so
//! a slot is either idle or carrying exactly one request, never both.

use crate::net::{ConnectionManager, HttpConnection};
use slingshot_core_resilience::RefCount;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One endpoint address the client spreads requests over
pub(crate) struct Vip {
    /// Resolved address
    pub address: IpAddr,
    /// Hostname presented on connections to this address
    pub host_address: String,
    /// Connection manager bound to this address
    pub manager: Arc<dyn ConnectionManager>,
    /// Clear once teardown starts; no new requests may be assigned
    active: AtomicBool,
    /// Held by every live slot; the manager shuts down at zero
    pub refs: RefCount,
}

impl Vip {
    pub(crate) fn new(
        address: IpAddr,
        host_address: String,
        manager: Arc<dyn ConnectionManager>,
    ) -> Arc<Self> {
        let vip = Arc::new(Self {
            address,
            host_address,
            manager: Arc::clone(&manager),
            active: AtomicBool::new(true),
            refs: RefCount::new(0),
        });
        // Slot count is known only to the caller; the hook just tears the
        // manager down once the last slot is gone.
        vip.refs.set_on_zero(move || {
            tokio::spawn(async move {
                manager.shutdown().await;
            });
        });
        vip
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!(address = %self.address, "vip deactivated");
        }
    }
}

impl std::fmt::Debug for Vip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vip")
            .field("address", &self.address)
            .field("host_address", &self.host_address)
            .field("active", &self.is_active())
            .field("refs", &self.refs.count())
            .finish()
    }
}

/// One connection slot on a VIP
pub(crate) struct VipConnection {
    pub vip: Arc<Vip>,
    /// Currently held HTTP connection; empty between acquisitions
    pub conn: Option<Box<dyn HttpConnection>>,
    /// Requests served on the current connection, for rotation
    pub request_count: u32,
}

impl VipConnection {
    pub(crate) fn new(vip: Arc<Vip>) -> Self {
        vip.refs.acquire();
        Self {
            vip,
            conn: None,
            request_count: 0,
        }
    }

    /// Politely return the held connection to the manager before the slot
    /// dies. Dropping a slot without this still releases the VIP reference,
    /// but the connection is closed instead of pooled.
    pub(crate) async fn dispose(mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = self.vip.is_active() && conn.is_open();
            self.vip.manager.release(conn, reusable).await;
        }
    }
}

impl Drop for VipConnection {
    fn drop(&mut self) {
        self.vip.refs.release();
    }
}

impl std::fmt::Debug for VipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipConnection")
            .field("vip", &self.vip.address)
            .field("has_connection", &self.conn.is_some())
            .field("request_count", &self.request_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::net::HttpRequest;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct NullManager {
        shutdowns: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionManager for NullManager {
        async fn acquire(&self) -> Result<Box<dyn HttpConnection>> {
            unimplemented!("not used in these tests")
        }

        async fn release(&self, _conn: Box<dyn HttpConnection>, _reusable: bool) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullConnection;

    #[async_trait]
    impl HttpConnection for NullConnection {
        async fn execute(&mut self, _request: HttpRequest) -> Result<crate::net::HttpResponse> {
            unimplemented!("not used in these tests")
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn test_vip(shutdowns: Arc<AtomicUsize>, releases: Arc<AtomicUsize>) -> Arc<Vip> {
        Vip::new(
            "198.51.100.7".parse().unwrap(),
            "bucket.example.com".to_string(),
            Arc::new(NullManager {
                shutdowns,
                releases,
            }),
        )
    }

    #[tokio::test]
    async fn test_slots_hold_vip_references() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let vip = test_vip(Arc::clone(&shutdowns), Arc::new(AtomicUsize::new(0)));

        let slot_a = VipConnection::new(Arc::clone(&vip));
        let slot_b = VipConnection::new(Arc::clone(&vip));
        assert_eq!(vip.refs.count(), 2);

        drop(slot_a);
        assert_eq!(vip.refs.count(), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

        drop(slot_b);
        // The on-zero hook spawns manager shutdown.
        tokio::task::yield_now().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_returns_connection() {
        let releases = Arc::new(AtomicUsize::new(0));
        let vip = test_vip(Arc::new(AtomicUsize::new(0)), Arc::clone(&releases));

        let mut slot = VipConnection::new(Arc::clone(&vip));
        slot.conn = Some(Box::new(NullConnection));
        slot.dispose().await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deactivate_is_sticky() {
        let vip = test_vip(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        assert!(vip.is_active());
        vip.deactivate();
        vip.deactivate();
        assert!(!vip.is_active());
    }
}
