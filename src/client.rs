//! The client: public handle, shared state, and lifecycle
//!
//! Two reference counters govern the client's life. The external count is
//! held by [`Client`] handles; when the last one drops, teardown begins —
//! the host listener stops, the client goes inactive, VIPs are released,
//! active meta-requests finish with `Cancelled`. The internal count is held
//! by everything with asynchronous cleanup (the worker task, the resolver,
//! VIPs, meta-requests, in-flight dispatches, delivery tasks); only when it
//! also reaches zero does the shutdown callback fire. The two are separate
//! on purpose: cleanup must be able to *start* while internal work is still
//! draining.

use crate::config::{ClientConfig, ShutdownCallback};
use crate::error::{ClientError, Result};
use crate::meta_request::{
    create_state_machine, MetaRequest, MetaRequestKind, MetaRequestOptions, MetaShared,
    resolve_part_size,
};
use crate::net::{ConnectionManagerFactory, TlsConnectionManagerFactory};
use crate::resolver::{spawn_host_listener, HostEvent};
use crate::scheduler::{
    run_worker, Batch, CompletedDispatch, PendingMetaRequest, SyncedData, VipConnectionUpdate,
};
use crate::signing::CachedSigningConfig;
use crate::vip::{Vip, VipConnection};
use http::Method;
use slingshot_core_resilience::{
    BackpressureConfig, BackpressureGuard, RefCount, RetryStrategy,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Point-in-time client counters
#[derive(Debug, Clone)]
pub struct ClientStats {
    /// Live VIPs
    pub vips: usize,
    /// Addresses the host listener currently reports
    pub known_addresses: usize,
    /// Meta-requests submitted and not yet finished
    pub active_meta_requests: usize,
    /// HTTP requests currently in flight
    pub requests_in_flight: u64,
    /// Bytes parked in body-streaming queues
    pub buffered_stream_bytes: u64,
    /// Tokens left in the retry budget
    pub retry_tokens: u64,
}

/// High-throughput S3 transfer client handle.
///
/// Cloning is cheap and shares the client; dropping the last clone begins
/// asynchronous teardown. Must be created from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use slingshot::client::Client;
/// use slingshot::config::ClientConfig;
/// use slingshot::meta_request::{MetaRequestKind, MetaRequestOptions};
/// use slingshot::request::MessageTemplate;
/// use slingshot::signing::{Credentials, SigningConfig, StaticCredentialsProvider};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new(
///     "AKIDEXAMPLE",
///     "secret",
/// )));
/// let config = ClientConfig::new(
///     "us-east-1",
///     "bucket.s3.us-east-1.amazonaws.com",
///     SigningConfig::default_for("us-east-1", provider),
/// );
/// let client = Client::new(config)?;
///
/// let options = MetaRequestOptions::new(
///     MetaRequestKind::GetObject,
///     MessageTemplate::get("/large-object.bin"),
/// )
/// .on_body(Arc::new(|offset, bytes| {
///     println!("{} bytes at offset {}", bytes.len(), offset);
/// }));
/// let _transfer = client.make_meta_request(options)?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client and start its worker, streaming runtime, and (unless
    /// disabled) host listener.
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let shutdown_callback = config.shutdown_callback.take();
        let manager_factory: Arc<dyn ConnectionManagerFactory> = match config.manager_factory.take()
        {
            Some(factory) => factory,
            None => Arc::new(TlsConnectionManagerFactory::new(
                config.port,
                config.connections_per_vip as usize,
                config.max_response_size(),
            )?),
        };

        let streaming_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.streaming_threads)
            .thread_name("slingshot-body-streaming")
            .enable_all()
            .build()
            .map_err(|e| ClientError::Internal(format!("streaming runtime: {e}")))?;

        let signing = Arc::new(CachedSigningConfig::new(&config.signing));
        let retry = Arc::new(RetryStrategy::new(config.retry.clone()));
        let backpressure = Arc::new(BackpressureGuard::new(BackpressureConfig {
            max_requests_in_flight: config.effective_max_requests_in_flight(),
            max_buffered_bytes: config.max_buffered_stream_bytes,
        }));

        let dns_refresh_interval = config.dns_refresh_interval;
        let endpoint = config.endpoint.clone();
        let port = config.port;

        // Internal count starts at two: the worker task and the
        // "client alive" guard released when teardown begins.
        let inner = Arc::new(ClientInner {
            config,
            signing,
            retry,
            backpressure,
            manager_factory,
            synced: Mutex::new(SyncedData::new()),
            work_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            external_refs: RefCount::new(1),
            internal_refs: RefCount::new(2),
            active_meta_count: AtomicUsize::new(0),
            next_meta_id: AtomicU64::new(0),
            shutdown_callback: Mutex::new(shutdown_callback),
            streaming_rt: Mutex::new(Some(streaming_rt)),
        });

        let weak = Arc::downgrade(&inner);
        inner.external_refs.set_on_zero(move || {
            if let Some(inner) = weak.upgrade() {
                inner.begin_shutdown();
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.internal_refs.set_on_zero(move || {
            if let Some(inner) = weak.upgrade() {
                inner.finish_shutdown();
            }
        });

        tokio::spawn(run_worker(Arc::clone(&inner)));

        if let Some(interval) = dns_refresh_interval {
            inner.internal_refs.acquire();
            spawn_host_listener(Arc::clone(&inner), endpoint, port, interval);
        }

        tracing::info!(
            endpoint = %inner.config.endpoint,
            region = %inner.config.region,
            ideal_vips = inner.config.ideal_vip_count(),
            "client created"
        );

        Ok(Self { inner })
    }

    /// Submit a meta-request. Work begins immediately; the returned handle
    /// is only needed for cancellation.
    pub fn make_meta_request(&self, options: MetaRequestOptions) -> Result<MetaRequest> {
        let MetaRequestOptions {
            kind,
            message,
            body_callback,
            finish_callback,
            signing_override,
        } = options;

        if !self.inner.is_active() {
            return Err(ClientError::InvalidArgument(
                "client is shutting down".to_string(),
            ));
        }
        message.validate()?;

        let part_size = match kind {
            MetaRequestKind::GetObject => {
                if message.method != Method::GET {
                    return Err(ClientError::InvalidArgument(
                        "auto-ranged GET requires a GET template".to_string(),
                    ));
                }
                if !message.body.is_empty() {
                    return Err(ClientError::InvalidArgument(
                        "GET template must not carry a body".to_string(),
                    ));
                }
                self.inner.config.part_size
            }
            MetaRequestKind::PutObject => {
                if message.method != Method::PUT {
                    return Err(ClientError::InvalidArgument(
                        "multipart PUT requires a PUT template".to_string(),
                    ));
                }
                if message.body.is_empty() {
                    return Err(ClientError::InvalidArgument(
                        "multipart PUT requires a non-empty body; use a Default \
                         meta-request for zero-byte objects"
                            .to_string(),
                    ));
                }
                resolve_part_size(
                    message.body.len() as u64,
                    self.inner.config.part_size,
                    self.inner.config.max_part_size,
                )?
            }
            MetaRequestKind::Default => self.inner.config.part_size,
        };

        let signing = match signing_override {
            Some(config) => Arc::new(CachedSigningConfig::new(&config)),
            None => Arc::clone(&self.inner.signing),
        };

        let id = self.inner.next_meta_id.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = MetaShared::new(
            id,
            kind,
            message,
            signing,
            part_size,
            self.inner.config.meta_request_window,
            body_callback,
            finish_callback,
        );
        let machine = create_state_machine(Arc::clone(&shared), Arc::clone(&self.inner.backpressure));

        self.inner.internal_refs.acquire();
        self.inner.active_meta_count.fetch_add(1, Ordering::SeqCst);

        // PUTs have no response bodies to stream; GET and Default route
        // theirs through the delivery task.
        if kind != MetaRequestKind::PutObject {
            spawn_delivery_task(&self.inner, Arc::clone(&shared));
        }

        tracing::debug!(meta_request = id, ?kind, "meta request submitted");

        {
            let mut synced = self.inner.lock_synced();
            synced.pending_meta_requests.push(PendingMetaRequest {
                shared: Arc::clone(&shared),
                machine,
            });
        }
        self.inner.schedule_work();

        Ok(MetaRequest {
            shared,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Feed a host event from an external resolver.
    pub fn on_host_event(&self, event: HostEvent) {
        self.inner.on_host_event(event);
    }

    /// Snapshot the client's counters.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats()
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        self.inner.external_refs.acquire();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.external_refs.release();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.config.endpoint)
            .field("active", &self.inner.is_active())
            .finish()
    }
}

/// State shared by every task the client owns
pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub signing: Arc<CachedSigningConfig>,
    pub retry: Arc<RetryStrategy>,
    pub backpressure: Arc<BackpressureGuard>,
    pub manager_factory: Arc<dyn ConnectionManagerFactory>,
    pub synced: Mutex<SyncedData>,
    pub work_notify: Notify,
    pub shutdown_notify: Notify,
    pub external_refs: RefCount,
    pub internal_refs: RefCount,
    pub active_meta_count: AtomicUsize,
    next_meta_id: AtomicU64,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
    streaming_rt: Mutex<Option<tokio::runtime::Runtime>>,
}

impl ClientInner {
    pub(crate) fn lock_synced(&self) -> std::sync::MutexGuard<'_, SyncedData> {
        self.synced.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock_synced().active
    }

    /// Wake the worker, coalescing with any wake already pending.
    pub(crate) fn schedule_work(&self) {
        let should_notify = {
            let mut synced = self.lock_synced();
            if synced.work_scheduled {
                false
            } else {
                synced.work_scheduled = true;
                true
            }
        };
        if should_notify {
            self.work_notify.notify_one();
        }
    }

    /// Drain every producer queue for one worker pass.
    pub(crate) fn take_batch(&self) -> Batch {
        let mut synced = self.lock_synced();
        synced.work_scheduled = false;
        Batch {
            active: synced.active,
            updates: std::mem::take(&mut synced.pending_updates),
            new_meta_requests: std::mem::take(&mut synced.pending_meta_requests),
            completed: std::mem::take(&mut synced.completed),
            retry_ready: std::mem::take(&mut synced.retry_ready),
        }
    }

    pub(crate) fn has_pending_work(&self) -> bool {
        let synced = self.lock_synced();
        !synced.pending_updates.is_empty()
            || !synced.pending_meta_requests.is_empty()
            || !synced.completed.is_empty()
            || !synced.retry_ready.is_empty()
    }

    pub(crate) fn complete_dispatch(&self, completed: CompletedDispatch) {
        {
            let mut synced = self.lock_synced();
            synced.completed.push(completed);
        }
        self.schedule_work();
    }

    pub(crate) fn push_retry_ready(&self, shared: Arc<MetaShared>, request: crate::request::Request) {
        {
            let mut synced = self.lock_synced();
            synced.retry_ready.push((shared, request));
        }
        self.schedule_work();
    }

    pub(crate) fn meta_request_finished(&self) {
        self.active_meta_count.fetch_sub(1, Ordering::SeqCst);
        self.internal_refs.release();
    }

    pub(crate) fn on_host_event(self: &Arc<Self>, event: HostEvent) {
        match event {
            HostEvent::Added(address) => {
                {
                    let mut synced = self.lock_synced();
                    if !synced.active {
                        return;
                    }
                    synced.known_addresses.insert(address);
                }
                self.reconcile_vips();
            }
            HostEvent::Removed(address) => {
                {
                    let mut synced = self.lock_synced();
                    synced.known_addresses.remove(&address);
                    if let Some(position) =
                        synced.vips.iter().position(|vip| vip.address == address)
                    {
                        let vip = synced.vips.remove(position);
                        vip.deactivate();
                        synced
                            .pending_updates
                            .push(VipConnectionUpdate::Remove(address));
                        tracing::info!(%address, "vip removed");
                    }
                }
                self.schedule_work();
                // A previously ignored address may now fit under the ideal
                // count.
                self.reconcile_vips();
            }
        }
    }

    /// Create VIPs for known addresses up to the ideal count. Creation is
    /// asynchronous; `creating` marks addresses with a build in flight so
    /// concurrent events cannot double-create.
    fn reconcile_vips(self: &Arc<Self>) {
        let to_create: Vec<IpAddr> = {
            let mut synced = self.lock_synced();
            if !synced.active {
                return;
            }
            let ideal = self.config.ideal_vip_count() as usize;
            let mut picks = Vec::new();
            for address in synced.known_addresses.iter() {
                if synced.vips.len() + synced.creating.len() + picks.len() >= ideal {
                    break;
                }
                if synced.creating.contains(address)
                    || synced.vips.iter().any(|vip| vip.address == *address)
                {
                    continue;
                }
                picks.push(*address);
            }
            for pick in &picks {
                synced.creating.insert(*pick);
            }
            picks
        };

        for address in to_create {
            self.internal_refs.acquire();
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.create_vip(address).await;
                inner.internal_refs.release();
            });
        }
    }

    async fn create_vip(self: &Arc<Self>, address: IpAddr) {
        let result = self
            .manager_factory
            .create_manager(&self.config.endpoint, address)
            .await;

        let manager = {
            let mut synced = self.lock_synced();
            synced.creating.remove(&address);
            match result {
                Ok(manager) => {
                    let ideal = self.config.ideal_vip_count() as usize;
                    let wanted = synced.active
                        && synced.known_addresses.contains(&address)
                        && synced.vips.len() < ideal
                        && !synced.vips.iter().any(|vip| vip.address == address);
                    if !wanted {
                        Some(manager) // lost the race; shut it down below
                    } else {
                        let vip = Vip::new(address, self.config.endpoint.clone(), manager);

                        // The VIP holds one internal reference, released by
                        // its on-zero hook once every slot is gone.
                        self.internal_refs.acquire();
                        let weak = Arc::downgrade(self);
                        let vip_manager = Arc::clone(&vip.manager);
                        vip.refs.set_on_zero(move || {
                            tokio::spawn(async move {
                                vip_manager.shutdown().await;
                            });
                            if let Some(inner) = weak.upgrade() {
                                inner.internal_refs.release();
                                inner.schedule_work();
                            }
                        });

                        for _ in 0..self.config.connections_per_vip {
                            synced
                                .pending_updates
                                .push(VipConnectionUpdate::Add(VipConnection::new(Arc::clone(
                                    &vip,
                                ))));
                        }
                        synced.vips.push(vip);
                        tracing::info!(%address, "vip added");
                        None
                    }
                }
                Err(error) => {
                    // Failure affects this VIP only; siblings are untouched.
                    tracing::warn!(%address, %error, "vip creation failed");
                    None
                }
            }
        };

        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        self.schedule_work();
    }

    /// External count hit zero: stop producing, release VIPs, let the
    /// worker drain everything.
    fn begin_shutdown(&self) {
        {
            let mut synced = self.lock_synced();
            if !synced.active {
                return;
            }
            synced.active = false;
            synced.known_addresses.clear();
            let vips = std::mem::take(&mut synced.vips);
            for vip in vips {
                vip.deactivate();
                synced
                    .pending_updates
                    .push(VipConnectionUpdate::Remove(vip.address));
            }
        }
        tracing::info!(endpoint = %self.config.endpoint, "client teardown started");
        self.shutdown_notify.notify_waiters();
        self.schedule_work();
        self.internal_refs.release();
    }

    /// Internal count hit zero: all async cleanup is done.
    fn finish_shutdown(&self) {
        let runtime = {
            let mut slot = self
                .streaming_rt
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(runtime) = runtime {
            // The last release can happen on one of the streaming runtime's
            // own threads; hand the teardown to a plain thread so the
            // runtime is never dropped from inside itself.
            std::thread::spawn(move || {
                runtime.shutdown_background();
            });
        }

        let callback = {
            let mut slot = self
                .shutdown_callback
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        tracing::info!(endpoint = %self.config.endpoint, "client fully shut down");
        if let Some(callback) = callback {
            callback();
        }
    }

    fn stats(&self) -> ClientStats {
        let (vips, known_addresses) = {
            let synced = self.lock_synced();
            (synced.vips.len(), synced.known_addresses.len())
        };
        let backpressure = self.backpressure.state();
        ClientStats {
            vips,
            known_addresses,
            active_meta_requests: self.active_meta_count.load(Ordering::SeqCst),
            requests_in_flight: backpressure.requests_in_flight,
            buffered_stream_bytes: backpressure.buffered_bytes,
            retry_tokens: self.retry.tokens(),
        }
    }
}

/// Spawn the per-meta-request delivery task on the body-streaming runtime:
/// drain in-order parts, invoke the user's body callback, settle reference
/// counts and backpressure accounting.
fn spawn_delivery_task(inner: &Arc<ClientInner>, shared: Arc<MetaShared>) {
    inner.internal_refs.acquire();
    let task_inner = Arc::clone(inner);
    let delivery = async move {
        while let Some(part) = shared.stream.next_ready().await {
            let bytes = part.body.len() as u64;
            // No body callbacks once cancellation has been acknowledged.
            if !shared.cancelled() {
                if let Some(callback) = &shared.body_callback {
                    callback(part.offset, &part.body);
                }
            }
            task_inner.backpressure.remove_buffered(bytes);
            shared.refs.release();
            task_inner.schedule_work();
        }
        task_inner.internal_refs.release();
    };

    let handle = {
        let slot = inner
            .streaming_rt
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|rt| rt.handle().clone())
    };
    match handle {
        Some(handle) => {
            handle.spawn(delivery);
        }
        None => {
            // Teardown already reclaimed the runtime; drain inline.
            tokio::spawn(delivery);
        }
    }
}
