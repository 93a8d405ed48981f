//! Flow table shared by the capture thread and the dispatch thread.
//!
//! Both threads go through the same `Mutex<FlowDispatcher>`, so a connection
//! is never seen half registered: the cache insert and the socket
//! registration happen under one lock, and the dispatch thread holds it for
//! the whole batch of ready events.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::{Events, Poll, Registry, Token};
use tokio::sync::mpsc;

use super::capture::ShutdownSignal;
use crate::builder::IpPacketBuilder;
use crate::cache::{key_for_packet, ConnectionCache, RESERVED_KEY};
use crate::context::{EngineContext, LeafReady};
use crate::packet::{parse_tcp, parse_transport, tcp_flags, IpPacketInfo, TransportProtocol};
use crate::transport::{FlowEnv, TransportConnection};

/// Token of the waker that interrupts the dispatch poll. Flow tokens are
/// their cache keys, which never take the reserved value.
pub const WAKE_TOKEN: Token = Token(RESERVED_KEY as usize);

const EVENT_CAPACITY: usize = 1024;

pub struct FlowDispatcher {
    ctx: Arc<EngineContext>,
    registry: Registry,
    flows: ConnectionCache<TransportConnection>,
}

impl FlowDispatcher {
    pub fn new(ctx: Arc<EngineContext>, registry: Registry) -> Self {
        Self {
            ctx,
            registry,
            flows: ConnectionCache::new(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.flows.contains(key)
    }

    pub fn connection(&self, key: u32) -> Option<&TransportConnection> {
        self.flows.get(key)
    }

    /// Route a validated frame to the flow that owns it, opening one for a
    /// new flow. TCP segments carrying FIN, ACK or RST for no known flow are
    /// answered with a RST.
    pub fn handle_frame(&mut self, frame: &[u8], info: &IpPacketInfo) {
        let transport = match parse_transport(frame, info) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(error = %e, "dropping frame without a transport header");
                self.ctx.stats.record_drop();
                return;
            }
        };
        let key = key_for_packet(info, &transport);
        let env = FlowEnv {
            ctx: self.ctx.as_ref(),
            registry: &self.registry,
        };

        if let Some(connection) = self.flows.get_mut(key) {
            if connection.meta().matches(info, &transport) {
                connection.handle_packet(env, frame, info);
                if connection.is_finished() {
                    evict(&mut self.flows, &self.ctx, key);
                }
                return;
            }

            tracing::warn!(
                key,
                displaced = connection.meta().id,
                remote = %connection.meta().remote,
                "connection key collision, replacing flow"
            );
            connection.close_hard(env);
            evict(&mut self.flows, &self.ctx, key);
        }

        if info.protocol == TransportProtocol::Tcp {
            let segment = match parse_tcp(frame, info) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(key, error = %e, "dropping unparsable tcp segment");
                    self.ctx.stats.record_drop();
                    return;
                }
            };
            if segment.has(tcp_flags::FIN) || segment.has(tcp_flags::ACK) || segment.has(tcp_flags::RST) {
                tracing::debug!(
                    key,
                    src = %info.src_addr,
                    dst = %info.dst_addr,
                    dst_port = segment.dst_port,
                    flags = segment.flags,
                    "stray tcp segment, resetting"
                );
                self.ctx.send_frame(IpPacketBuilder::build_stray(info, &segment));
                self.ctx.stats.record_stray_reset();
                return;
            }
        }

        match TransportConnection::open(env, key, frame, info, &transport) {
            Ok(mut connection) => {
                // the SYN was consumed by open
                if info.protocol == TransportProtocol::Udp {
                    connection.handle_packet(env, frame, info);
                }
                if connection.is_finished() {
                    return;
                }
                if let Some(mut displaced) = self.flows.insert(key, connection) {
                    displaced.close_hard(env);
                }
            }
            Err(e) => {
                tracing::debug!(
                    key,
                    protocol = info.protocol.name(),
                    dst = %info.dst_addr,
                    dst_port = transport.dst_port,
                    error = %e,
                    "failed to open connection"
                );
            }
        }
    }

    /// Readiness of the outward socket registered under `token`.
    pub fn handle_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Ok(key) = u32::try_from(token.0) else {
            return;
        };
        let env = FlowEnv {
            ctx: self.ctx.as_ref(),
            registry: &self.registry,
        };
        let Some(connection) = self.flows.get_mut(key) else {
            tracing::trace!(key, "event for evicted flow");
            return;
        };
        connection.handle_ready(env, readable, writable);
        if connection.is_finished() {
            evict(&mut self.flows, &self.ctx, key);
        }
    }

    /// Hand a forged leaf to the flow that asked for it, if it is still the
    /// one cached under the key.
    pub fn handle_leaf(&mut self, leaf: LeafReady) {
        let env = FlowEnv {
            ctx: self.ctx.as_ref(),
            registry: &self.registry,
        };
        match self.flows.get_mut(leaf.key) {
            Some(connection) if connection.meta().id == leaf.id => {
                connection.leaf_ready(env, leaf.result);
                if connection.is_finished() {
                    evict(&mut self.flows, &self.ctx, leaf.key);
                }
            }
            _ => tracing::debug!(id = leaf.id, "leaf ready for a flow that is gone"),
        }
    }

    /// Close a cached flow and drop it from the cache. Safe to repeat.
    pub fn close(&mut self, key: u32) {
        let env = FlowEnv {
            ctx: self.ctx.as_ref(),
            registry: &self.registry,
        };
        if let Some(connection) = self.flows.get_mut(key) {
            connection.close_hard(env);
        }
        evict(&mut self.flows, &self.ctx, key);
    }

    /// Soft-close every flow and clear the cache.
    pub fn close_all(&mut self) -> usize {
        let env = FlowEnv {
            ctx: self.ctx.as_ref(),
            registry: &self.registry,
        };
        let connections = self.flows.drain();
        let closed = connections.len();
        for mut connection in connections {
            connection.close_soft(env);
        }
        closed
    }
}

/// Drop a flow from the cache. A flow that never reached its remote has its
/// connection record withdrawn.
fn evict(flows: &mut ConnectionCache<TransportConnection>, ctx: &EngineContext, key: u32) {
    let Some(connection) = flows.remove(key) else {
        return;
    };
    let meta = connection.meta();
    tracing::trace!(id = meta.id, key, "flow evicted");
    if !connection.reached_remote() && meta.remote.port() != 53 {
        let id = meta.id;
        ctx.persist(move |db| async move { db.delete_transport_layer_connection(id).await });
    }
}

/// Lock the flow table, recovering it if a flow panicked while holding it.
pub fn lock(flows: &Mutex<FlowDispatcher>) -> MutexGuard<'_, FlowDispatcher> {
    flows.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatch thread: wait on every outward socket and hand ready events and
/// forged leaves to their flows until shutdown.
pub fn run_dispatch(
    mut poll: Poll,
    flows: Arc<Mutex<FlowDispatcher>>,
    mut leaves: mpsc::UnboundedReceiver<LeafReady>,
    signal: Arc<ShutdownSignal>,
) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    tracing::debug!("dispatch loop started");

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "dispatch poll failed, shutting down");
            signal.trigger();
            break;
        }
        if signal.is_triggered() {
            break;
        }

        let mut table = lock(&flows);
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed();
            table.handle_event(event.token(), readable, writable);
        }
        while let Ok(leaf) = leaves.try_recv() {
            table.handle_leaf(leaf);
        }
    }

    tracing::debug!("dispatch loop stopped");
}
