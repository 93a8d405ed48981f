//! Transport layer connections: one outward OS socket per captured flow.

pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use mio::{Registry, Token};
use netsight_core::mitm::{ForgedCertificate, MitmError};
use netsight_core::persist::{now_millis, ConnectionRecord};
use rustls::pki_types::InvalidDnsNameError;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::builder::IpPacketBuilder;
use crate::context::{EngineContext, Outbox};
use crate::encryption::{EncryptionLayer, EncryptionProtocol};
use crate::packet::{parse_tcp, parse_udp, IpPacketInfo, TransportInfo, TransportProtocol};
use crate::process::{AppFinder, AppInfo};

pub use tcp::TcpConnection;
pub use udp::UdpConnection;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("interception failed: {0}")]
    Mitm(#[from] MitmError),
    #[error("invalid server name: {0}")]
    ServerName(#[from] InvalidDnsNameError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("write buffer overflow ({0} bytes pending)")]
    WriteOverflow(usize),
    #[error("packet error: {0}")]
    Packet(#[from] crate::packet::PacketError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Aborted,
}

/// Identity of a flow, fixed when it is opened.
#[derive(Debug, Clone)]
pub struct FlowMeta {
    /// Random id for log correlation.
    pub id: u64,
    pub key: u32,
    pub protocol: TransportProtocol,
    /// Client side of the flow.
    pub local: SocketAddr,
    /// Destination the client addressed.
    pub remote: SocketAddr,
    /// Owning application, looked up on first use.
    owner: Arc<OnceLock<AppInfo>>,
    pub remote_host: String,
    pub is_tracker: bool,
    pub initial_timestamp: u64,
}

impl FlowMeta {
    /// Resolve hostname and tracker label for a new flow. The owner is left
    /// for the first caller of [`FlowMeta::app`].
    pub fn resolve(ctx: &EngineContext, key: u32, info: &IpPacketInfo, transport: &TransportInfo) -> Self {
        let local = SocketAddr::new(info.src_addr, transport.src_port);
        let remote = SocketAddr::new(info.dst_addr, transport.dst_port);
        let remote_host = ctx.hostname_for(remote.ip());
        let is_tracker = ctx.trackers.is_tracker(&remote_host);

        Self {
            id: rand::random::<u32>() as u64,
            key,
            protocol: info.protocol,
            local,
            remote,
            owner: Arc::new(OnceLock::new()),
            remote_host,
            is_tracker,
            initial_timestamp: now_millis(),
        }
    }

    /// Owner of the flow's client socket, resolved once.
    pub fn app(&self, ctx: &EngineContext) -> &AppInfo {
        self.app_with(ctx.app_finder.as_ref())
    }

    pub fn app_with(&self, finder: &dyn AppFinder) -> &AppInfo {
        self.owner
            .get_or_init(|| finder.find(self.local, self.remote, self.protocol))
    }

    /// The owner, if something has resolved it already.
    pub fn resolved_app(&self) -> Option<&AppInfo> {
        self.owner.get()
    }

    pub fn matches(&self, info: &IpPacketInfo, transport: &TransportInfo) -> bool {
        self.protocol == info.protocol
            && self.local == SocketAddr::new(info.src_addr, transport.src_port)
            && self.remote == SocketAddr::new(info.dst_addr, transport.dst_port)
    }

    pub fn record(&self, session_id: u64, app: &AppInfo) -> ConnectionRecord {
        ConnectionRecord {
            id: self.id,
            session_id,
            protocol: self.protocol.name().to_string(),
            ip_version: if self.remote.is_ipv4() { 4 } else { 6 },
            initial_timestamp: self.initial_timestamp,
            initiator_id: app.app_id,
            initiator_pkg: app.package.clone(),
            local_port: self.local.port(),
            remote_host: self.remote_host.clone(),
            remote_ip: self.remote.ip().to_string(),
            remote_port: self.remote.port(),
            is_tracker: self.is_tracker,
        }
    }

    pub fn token(&self) -> Token {
        Token(self.key as usize)
    }
}

/// What a connection needs from the engine while handling one event.
#[derive(Clone, Copy)]
pub struct FlowEnv<'a> {
    pub ctx: &'a EngineContext,
    pub registry: &'a Registry,
}

/// Encryption and app layers stacked on a transport connection.
#[derive(Default)]
pub struct LayerStack {
    encryption: Option<EncryptionLayer>,
}

impl LayerStack {
    pub fn outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) -> Outbox {
        let mut out = Outbox::new();
        self.encryption
            .get_or_insert_with(|| EncryptionLayer::for_first_payload(meta, payload, false))
            .outbound(meta, ctx, payload, &mut out);
        out
    }

    pub fn inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) -> Outbox {
        let mut out = Outbox::new();
        self.encryption
            .get_or_insert_with(|| {
                tracing::debug!(id = meta.id, "inbound data before any outbound payload");
                EncryptionLayer::for_first_payload(meta, payload, true)
            })
            .inbound(meta, ctx, payload, &mut out);
        out
    }

    pub fn leaf_ready(
        &mut self,
        meta: &FlowMeta,
        result: Result<Arc<ForgedCertificate>, MitmError>,
    ) -> Outbox {
        let mut out = Outbox::new();
        match self.encryption.as_mut() {
            Some(layer) => layer.leaf_ready(meta, result, &mut out),
            None => tracing::debug!(id = meta.id, "leaf for a flow without an encryption layer"),
        }
        out
    }

    pub fn close(&mut self) -> Outbox {
        let mut out = Outbox::new();
        if let Some(layer) = self.encryption.as_mut() {
            layer.close(&mut out);
        }
        out
    }

    pub fn protocol(&self) -> Option<EncryptionProtocol> {
        self.encryption.as_ref().map(EncryptionLayer::protocol)
    }
}

/// A captured flow and its outward socket.
pub enum TransportConnection {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

impl TransportConnection {
    /// Open the connection for the first packet of a flow. A TCP flow opens
    /// on any segment without FIN, ACK or RST; its sequence number stands in
    /// for the SYN's.
    pub fn open(
        env: FlowEnv<'_>,
        key: u32,
        frame: &[u8],
        info: &IpPacketInfo,
        transport: &TransportInfo,
    ) -> Result<Self, ConnectionError> {
        let meta = FlowMeta::resolve(env.ctx, key, info, transport);
        let builder = IpPacketBuilder::from_packet(info);

        let connection = match info.protocol {
            TransportProtocol::Tcp => {
                let syn = parse_tcp(frame, info)?;
                TransportConnection::Tcp(TcpConnection::open(env, meta, builder, &syn)?)
            }
            TransportProtocol::Udp => TransportConnection::Udp(UdpConnection::open(env, meta, builder)?),
            _ => return Err(ConnectionError::InvalidState("not a tcp or udp flow")),
        };

        let meta = connection.meta();
        tracing::debug!(
            id = meta.id,
            protocol = meta.protocol.name(),
            local = %meta.local,
            remote = %meta.remote,
            host = %meta.remote_host,
            tracker = meta.is_tracker,
            "connection opened"
        );
        env.ctx.stats.record_connection_open();
        if meta.remote.port() != 53 {
            env.ctx.persist_connection(meta);
        }
        Ok(connection)
    }

    pub fn meta(&self) -> &FlowMeta {
        match self {
            TransportConnection::Tcp(c) => c.meta(),
            TransportConnection::Udp(c) => c.meta(),
        }
    }

    pub fn state(&self) -> TransportState {
        match self {
            TransportConnection::Tcp(c) => c.state(),
            TransportConnection::Udp(c) => c.state(),
        }
    }

    /// The connection is done and should leave the cache.
    pub fn is_finished(&self) -> bool {
        match self {
            TransportConnection::Tcp(c) => c.is_finished(),
            TransportConnection::Udp(c) => c.is_finished(),
        }
    }

    pub fn encryption(&self) -> Option<EncryptionProtocol> {
        match self {
            TransportConnection::Tcp(c) => c.encryption(),
            TransportConnection::Udp(c) => c.encryption(),
        }
    }

    /// Whether the flow ever got an outward connection. UDP flows always do.
    pub fn reached_remote(&self) -> bool {
        match self {
            TransportConnection::Tcp(c) => c.reached_remote(),
            TransportConnection::Udp(_) => true,
        }
    }

    /// A packet captured from the client.
    pub fn handle_packet(&mut self, env: FlowEnv<'_>, frame: &[u8], info: &IpPacketInfo) {
        let result = match self {
            TransportConnection::Tcp(c) => parse_tcp(frame, info).map(|segment| c.handle_segment(env, &segment)),
            TransportConnection::Udp(c) => parse_udp(frame, info).map(|datagram| c.handle_datagram(env, datagram.payload)),
        };
        if let Err(e) = result {
            tracing::debug!(id = self.meta().id, error = %e, "unparsable packet for cached flow");
        }
    }

    /// Readiness reported for the outward socket.
    pub fn handle_ready(&mut self, env: FlowEnv<'_>, readable: bool, writable: bool) {
        match self {
            TransportConnection::Tcp(c) => c.handle_ready(env, readable, writable),
            TransportConnection::Udp(c) => {
                if readable {
                    c.handle_readable(env);
                }
            }
        }
    }

    pub fn leaf_ready(&mut self, env: FlowEnv<'_>, result: Result<Arc<ForgedCertificate>, MitmError>) {
        match self {
            TransportConnection::Tcp(c) => c.leaf_ready(env, result),
            TransportConnection::Udp(c) => c.leaf_ready(env, result),
        }
    }

    /// Close the outward socket.
    pub fn close_soft(&mut self, env: FlowEnv<'_>) {
        match self {
            TransportConnection::Tcp(c) => c.close_soft(env),
            TransportConnection::Udp(c) => c.close_soft(env),
        }
    }

    /// Close the outward socket and mark the flow for eviction.
    pub fn close_hard(&mut self, env: FlowEnv<'_>) {
        match self {
            TransportConnection::Tcp(c) => c.close_hard(env),
            TransportConnection::Udp(c) => c.close_hard(env),
        }
    }
}

/// Non-blocking socket connected (or connecting) to `target`.
///
/// With a mark configured the socket carries `SO_MARK` so policy routing can
/// keep it off the tunnel.
fn outward_socket(target: SocketAddr, protocol: TransportProtocol, mark: Option<u32>) -> io::Result<Socket> {
    let (ty, proto) = match protocol {
        TransportProtocol::Tcp => (Type::STREAM, Protocol::TCP),
        _ => (Type::DGRAM, Protocol::UDP),
    };
    let socket = Socket::new(Domain::for_address(target), ty, Some(proto))?;
    socket.set_nonblocking(true)?;

    if let Some(mark) = mark {
        #[cfg(target_os = "linux")]
        socket.set_mark(mark)?;
        #[cfg(not(target_os = "linux"))]
        tracing::warn!(mark, "socket marks are only supported on Linux");
    }

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket)
}

fn deregister<S: mio::event::Source>(registry: &Registry, source: &mut S, id: u64) {
    if let Err(e) = registry.deregister(source) {
        tracing::debug!(id, error = %e, "deregister failed");
    }
}
