//! State shared by every flow of one running engine.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use netsight_core::config::Config;
use netsight_core::dns::DnsCache;
use netsight_core::mitm::{CertificateStore, ForgedCertificate, MitmError, UpstreamIdentity};
use netsight_core::passthrough::TlsPassthroughCache;
use netsight_core::persist::DatabaseConnector;
use netsight_core::stats::EngineStats;
use netsight_core::tracker::TrackerTrie;
use rustls::ClientConfig;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::process::{AppFinder, AppInfo};
use crate::transport::FlowMeta;

/// A forged leaf finished off the dispatch thread, addressed to the flow that
/// asked for it.
#[derive(Debug)]
pub struct LeafReady {
    pub key: u32,
    pub id: u64,
    pub result: Result<Arc<ForgedCertificate>, MitmError>,
}

/// Bytes produced while processing one event, routed by the transport.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Bytes for the outward socket.
    pub to_remote: Vec<u8>,
    /// Transport payloads for the client, in order.
    pub to_client: Vec<Vec<u8>>,
    /// The flow cannot continue.
    pub abort: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_client(&mut self, payload: Vec<u8>) {
        if !payload.is_empty() {
            self.to_client.push(payload);
        }
    }
}

/// The engine's caches, collaborators and output channels.
pub struct EngineContext {
    pub config: Config,
    pub stats: EngineStats,
    pub dns_cache: DnsCache,
    pub passthrough: TlsPassthroughCache,
    pub trackers: TrackerTrie,
    pub certificates: Option<CertificateStore>,
    pub upstream_tls: Option<Arc<ClientConfig>>,
    pub persistence: Arc<dyn DatabaseConnector>,
    pub app_finder: Arc<dyn AppFinder>,
    pub runtime: Handle,
    frames: mpsc::Sender<Vec<u8>>,
    leaves: mpsc::UnboundedSender<LeafReady>,
    waker: Option<Arc<mio::Waker>>,
    session_id: AtomicU64,
}

/// Collaborators an engine context is assembled from.
pub struct ContextParts {
    pub config: Config,
    pub trackers: TrackerTrie,
    pub certificates: Option<CertificateStore>,
    pub upstream_tls: Option<Arc<ClientConfig>>,
    pub persistence: Arc<dyn DatabaseConnector>,
    pub app_finder: Arc<dyn AppFinder>,
    pub runtime: Handle,
}

impl EngineContext {
    pub fn new(
        parts: ContextParts,
        frames: mpsc::Sender<Vec<u8>>,
        leaves: mpsc::UnboundedSender<LeafReady>,
        waker: Option<Arc<mio::Waker>>,
    ) -> Self {
        Self {
            config: parts.config,
            stats: EngineStats::new(),
            dns_cache: DnsCache::default(),
            passthrough: TlsPassthroughCache::default(),
            trackers: parts.trackers,
            certificates: parts.certificates,
            upstream_tls: parts.upstream_tls,
            persistence: parts.persistence,
            app_finder: parts.app_finder,
            runtime: parts.runtime,
            frames,
            leaves,
            waker,
            session_id: AtomicU64::new(0),
        }
    }

    /// Queue a frame for the capture device. Blocks while the queue is full.
    pub fn send_frame(&self, frame: Vec<u8>) {
        self.stats.record_inbound(frame.len());
        if self.frames.blocking_send(frame).is_err() {
            tracing::debug!("writer gone, dropping frame");
        }
    }

    /// Ask the writer to stop once the frames queued so far are written.
    pub fn stop_writer(&self) {
        if self.frames.blocking_send(Vec::new()).is_err() {
            tracing::debug!("writer already gone");
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Relaxed)
    }

    pub fn set_session_id(&self, id: u64) {
        self.session_id.store(id, Ordering::Relaxed);
    }

    /// Whether a TLS flow from `app` to `hostname` should be terminated locally.
    pub fn should_intercept(&self, app: &AppInfo, hostname: &str) -> bool {
        self.certificates.is_some()
            && self.upstream_tls.is_some()
            && self.config.mitm_active()
            && self.config.monitoring.includes(app.app_id, &app.package)
            && !self.passthrough.contains(app.app_id, hostname)
    }

    /// Name used for a remote address: the cached DNS name, else the address.
    pub fn hostname_for(&self, ip: IpAddr) -> String {
        self.dns_cache.get(&ip).unwrap_or_else(|| ip.to_string())
    }

    /// Where an outward socket for `remote` connects. DNS sent to the tunnel
    /// address goes to the configured server.
    pub fn connect_target(&self, remote: SocketAddr) -> SocketAddr {
        if remote.port() == 53 && remote.ip() == IpAddr::V4(self.config.vpn.network().addr()) {
            self.config.vpn.dns_server()
        } else {
            remote
        }
    }

    /// Forge a leaf for `identity` on the blocking pool and post the result
    /// back to the dispatch loop.
    pub fn request_leaf(&self, key: u32, id: u64, identity: UpstreamIdentity) {
        let store = self.certificates.clone();
        let leaves = self.leaves.clone();
        let waker = self.waker.clone();

        self.runtime.spawn_blocking(move || {
            let result = match store {
                Some(store) => store.forge(&identity),
                None => Err(MitmError::Certificate("interception disabled".to_string())),
            };
            if leaves.send(LeafReady { key, id, result }).is_err() {
                return;
            }
            if let Some(waker) = waker {
                if let Err(e) = waker.wake() {
                    tracing::warn!(error = %e, "failed to wake dispatch loop");
                }
            }
        });
    }

    /// Persist a new flow's record. The owner lookup scans socket tables, so
    /// it runs on the blocking pool and the flow shares its result.
    pub fn persist_connection(&self, meta: &FlowMeta) {
        let meta = meta.clone();
        let finder = self.app_finder.clone();
        let persistence = self.persistence.clone();
        let session_id = self.session_id();
        let runtime = self.runtime.clone();

        self.runtime.spawn_blocking(move || {
            let record = meta.record(session_id, meta.app_with(finder.as_ref()));
            runtime.spawn(async move {
                if let Err(e) = persistence.persist_transport_layer_connection(record).await {
                    tracing::warn!(id = meta.id, error = %e, "failed to persist connection");
                }
            });
        });
    }

    /// Run a persistence call without waiting for it.
    pub fn persist<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<dyn DatabaseConnector>) -> Fut,
        Fut: std::future::Future<Output = Result<(), netsight_core::persist::PersistError>> + Send + 'static,
    {
        let fut = op(self.persistence.clone());
        self.runtime.spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(error = %e, "failed to persist record");
            }
        });
    }
}
