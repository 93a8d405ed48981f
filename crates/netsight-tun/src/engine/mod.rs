//! Engine lifecycle: wires the context, flow table and TUN device together
//! and runs the capture, dispatch and writer threads.

pub mod capture;
pub mod dispatch;
pub mod writer;

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mio::Poll;
use netsight_core::config::{Config, MitmConfig};
use netsight_core::mitm::{
    upstream_client_config, CertificateAuthority, CertificateStore, MergeVerifier, MitmError,
};
use netsight_core::persist::{now_millis, DatabaseConnector, PersistError};
use netsight_core::stats::StatsSnapshot;
use netsight_core::tracker::TrackerTrie;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::context::{ContextParts, EngineContext};
use crate::device::{TunConfig, TunDevice, TunError};
use crate::process::AppFinder;

pub use capture::{process_frame, ShutdownSignal};
pub use dispatch::{lock, FlowDispatcher, WAKE_TOKEN};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not running")]
    NotRunning,
    #[error("tun device error: {0}")]
    Tun(#[from] TunError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("certificate authority error: {0}")]
    Mitm(#[from] MitmError),
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Collaborators supplied by the embedding application.
pub struct EngineServices {
    pub persistence: Arc<dyn DatabaseConnector>,
    pub app_finder: Arc<dyn AppFinder>,
    pub trackers: TrackerTrie,
}

/// Certificate store and upstream TLS client for interception.
pub fn interception_for(
    mitm: &MitmConfig,
) -> Result<(CertificateStore, Arc<ClientConfig>), MitmError> {
    let authority = CertificateAuthority::load_or_create(mitm.authority())?;
    let verifier = MergeVerifier::new(mitm.trust_store.as_deref())?;
    let upstream = upstream_client_config(Arc::new(verifier))?;
    Ok((
        CertificateStore::new(Arc::new(authority), mitm.leaf_cache_capacity),
        upstream,
    ))
}

pub struct ComponentManager {
    ctx: Arc<EngineContext>,
    flows: Arc<Mutex<FlowDispatcher>>,
    signal: Arc<ShutdownSignal>,
    device: Option<Arc<TunDevice>>,
    /// Capture and dispatch threads, joined before the writer.
    workers: Vec<(&'static str, JoinHandle<()>)>,
    writer: Option<JoinHandle<()>>,
}

impl ComponentManager {
    /// Open the TUN device and start the engine threads.
    ///
    /// Must be called from within a tokio runtime; its handle runs
    /// persistence calls and certificate forging.
    pub async fn start(config: Config, services: EngineServices) -> Result<Self, EngineError> {
        let interception = config.mitm_active();
        let (certificates, upstream_tls) = if interception {
            let mitm = config.mitm.clone();
            let (store, upstream) = tokio::task::spawn_blocking(move || interception_for(&mitm)).await??;
            tracing::info!(ca_dir = %config.mitm.ca_dir.display(), alias = %config.mitm.alias, "tls interception enabled");
            (Some(store), Some(upstream))
        } else {
            (None, None)
        };

        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let registry = poll.registry().try_clone()?;
        let (frame_tx, frame_rx) = mpsc::channel(config.vpn.write_queue_capacity.max(1));
        let (leaf_tx, leaf_rx) = mpsc::unbounded_channel();

        let parts = ContextParts {
            config,
            trackers: services.trackers,
            certificates,
            upstream_tls,
            persistence: services.persistence,
            app_finder: services.app_finder,
            runtime: Handle::current(),
        };
        let ctx = Arc::new(EngineContext::new(parts, frame_tx, leaf_tx, Some(waker.clone())));

        let session = ctx.persistence.persist_session(now_millis()).await?;
        ctx.set_session_id(session);

        let tun_config = TunConfig::from_vpn(&ctx.config.vpn);
        let device = Arc::new(TunDevice::create(tun_config.clone())?);
        let signal = Arc::new(ShutdownSignal::new(waker)?);
        let flows = Arc::new(Mutex::new(FlowDispatcher::new(ctx.clone(), registry)));

        let mut workers = Vec::with_capacity(2);
        let dispatch = {
            let flows = flows.clone();
            let signal = signal.clone();
            spawn("netsight-dispatch", move || dispatch::run_dispatch(poll, flows, leaf_rx, signal))?
        };
        workers.push(("dispatch", dispatch));

        let capture = {
            let device = device.clone();
            let flows = flows.clone();
            let ctx = ctx.clone();
            let signal = signal.clone();
            spawn("netsight-capture", move || capture::run_capture(device, flows, ctx, signal))
        };
        match capture {
            Ok(handle) => workers.push(("capture", handle)),
            Err(e) => {
                signal.trigger();
                return Err(e.into());
            }
        }

        let writer = {
            let device = device.clone();
            let ctx = ctx.clone();
            spawn("netsight-writer", move || writer::run_writer(device, frame_rx, ctx))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                signal.trigger();
                return Err(e.into());
            }
        };

        tracing::info!(
            device = %tun_config.name,
            address = %tun_config.address,
            prefix_len = tun_config.prefix_len,
            mtu = tun_config.mtu,
            interception,
            session,
            "engine started"
        );

        Ok(Self {
            ctx,
            flows,
            signal,
            device: Some(device),
            workers,
            writer: Some(writer),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn active_flows(&self) -> usize {
        lock(&self.flows).len()
    }

    pub fn is_running(&self) -> bool {
        self.writer.is_some() && !self.signal.is_triggered()
    }

    /// Resolves when a thread has asked the engine to stop, e.g. after a
    /// device failure.
    pub async fn stopped(&self) {
        while !self.signal.is_triggered() {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    /// Stop the threads, soft-close every flow, close the session and the
    /// device. Returns the final counters.
    pub async fn stop(&mut self) -> Result<StatsSnapshot, EngineError> {
        let Some(writer) = self.writer.take() else {
            return Err(EngineError::NotRunning);
        };
        self.signal.trigger();

        let workers = std::mem::take(&mut self.workers);
        let device = self.device.take();
        let flows = self.flows.clone();
        let ctx = self.ctx.clone();
        let closed = tokio::task::spawn_blocking(move || {
            for (name, handle) in workers {
                join(name, handle);
            }
            let closed = lock(&flows).close_all();
            ctx.stop_writer();
            join("writer", writer);
            drop(device);
            closed
        })
        .await?;

        self.ctx
            .persistence
            .update_session(self.ctx.session_id(), now_millis())
            .await?;

        let stats = self.ctx.stats.snapshot();
        tracing::info!(
            closed,
            opened = stats.connections_opened,
            outbound_bytes = stats.outbound_bytes,
            inbound_bytes = stats.inbound_bytes,
            dropped = stats.dropped_packets,
            "engine stopped"
        );
        Ok(stats)
    }
}

impl Drop for ComponentManager {
    fn drop(&mut self) {
        if self.writer.is_some() {
            tracing::warn!("engine dropped without stop, signalling threads");
            self.signal.trigger();
        }
    }
}

fn spawn<F>(name: &str, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(body)
}

fn join(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!(thread = name, "engine thread panicked");
    }
}
