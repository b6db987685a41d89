//! Endpoint hostname resolution and host events
//!
//! S3 endpoints resolve to many addresses, and the set rotates over time;
//! re-resolving periodically is how the client discovers enough VIPs to
//! spread load across. The built-in listener diffs successive resolutions
//! into added/removed events. External resolvers can bypass it entirely and
//! push [`HostEvent`]s through [`Client::on_host_event`]
//! (crate::client::Client::on_host_event).

use crate::client::ClientInner;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A change in the endpoint's resolved address set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The address newly appeared in resolution results
    Added(IpAddr),
    /// The address no longer resolves
    Removed(IpAddr),
}

/// Spawn the periodic resolution task. The task holds one internal client
/// reference and releases it on exit; it exits when teardown begins.
pub(crate) fn spawn_host_listener(
    inner: Arc<ClientInner>,
    endpoint: String,
    port: u16,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: HashSet<IpAddr> = HashSet::new();
        loop {
            if !inner.is_active() {
                break;
            }

            match tokio::net::lookup_host((endpoint.as_str(), port)).await {
                Ok(addresses) => {
                    let fresh: HashSet<IpAddr> = addresses.map(|addr| addr.ip()).collect();
                    for added in fresh.difference(&known) {
                        tracing::debug!(endpoint = %endpoint, address = %added, "address added");
                        inner.on_host_event(HostEvent::Added(*added));
                    }
                    for removed in known.difference(&fresh) {
                        tracing::debug!(endpoint = %endpoint, address = %removed, "address removed");
                        inner.on_host_event(HostEvent::Removed(*removed));
                    }
                    known = fresh;
                }
                Err(error) => {
                    // Transient resolver trouble must not tear down working
                    // VIPs; keep the previous set.
                    tracing::warn!(endpoint = %endpoint, %error, "hostname resolution failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = inner.shutdown_notify.notified() => break,
            }
        }
        tracing::debug!(endpoint = %endpoint, "host listener exiting");
        inner.internal_refs.release();
    })
}
