use std::io;
use std::sync::Arc;

use mio::net::UdpSocket;
use mio::Interest;
use netsight_core::mitm::{ForgedCertificate, MitmError};

use super::{deregister, outward_socket, ConnectionError, FlowEnv, FlowMeta, LayerStack, TransportState};
use crate::builder::IpPacketBuilder;
use crate::context::Outbox;
use crate::encryption::EncryptionProtocol;

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpConnection {
    meta: FlowMeta,
    builder: IpPacketBuilder,
    socket: Option<UdpSocket>,
    state: TransportState,
    stack: LayerStack,
    released: bool,
    finished: bool,
}

impl UdpConnection {
    pub fn open(env: FlowEnv<'_>, meta: FlowMeta, builder: IpPacketBuilder) -> Result<Self, ConnectionError> {
        let target = env.ctx.connect_target(meta.remote);
        let socket = outward_socket(target, meta.protocol, env.ctx.config.vpn.socket_mark)?;
        let mut socket = UdpSocket::from_std(socket.into());
        env.registry.register(&mut socket, meta.token(), Interest::READABLE)?;

        tracing::debug!(id = meta.id, target = %target, "udp connected");
        Ok(Self {
            meta,
            builder,
            socket: Some(socket),
            state: TransportState::Connected,
            stack: LayerStack::default(),
            released: false,
            finished: false,
        })
    }

    pub fn meta(&self) -> &FlowMeta {
        &self.meta
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn encryption(&self) -> Option<EncryptionProtocol> {
        self.stack.protocol()
    }

    /// A datagram captured from the client.
    pub fn handle_datagram(&mut self, env: FlowEnv<'_>, payload: &[u8]) {
        if self.state != TransportState::Connected {
            tracing::debug!(id = self.meta.id, state = ?self.state, "udp datagram for closed flow");
            return;
        }
        let out = self.stack.outbound(&self.meta, env.ctx, payload);
        self.apply(env, out);
    }

    pub fn handle_readable(&mut self, env: FlowEnv<'_>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            match socket.recv(&mut buf) {
                Ok(n) => {
                    let out = self.stack.inbound(&self.meta, env.ctx, &buf[..n]);
                    self.apply(env, out);
                    if self.finished {
                        return;
                    }
                    if self.meta.remote.port() == 53 {
                        // one answer per query flow
                        tracing::debug!(id = self.meta.id, "udp dns answered, closing");
                        self.close_hard(env);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(id = self.meta.id, error = %e, "udp receive failed");
                    self.close_hard(env);
                    return;
                }
            }
        }
    }

    pub fn leaf_ready(&mut self, env: FlowEnv<'_>, result: Result<Arc<ForgedCertificate>, MitmError>) {
        let out = self.stack.leaf_ready(&self.meta, result);
        self.apply(env, out);
    }

    fn apply(&mut self, env: FlowEnv<'_>, out: Outbox) {
        for payload in &out.to_client {
            let frame = self
                .builder
                .build_udp(self.meta.local.port(), self.meta.remote.port(), payload);
            env.ctx.send_frame(frame);
        }
        if !out.to_remote.is_empty() {
            if let Some(socket) = self.socket.as_ref() {
                match socket.send(&out.to_remote) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        tracing::debug!(id = self.meta.id, len = out.to_remote.len(), "udp send would block, dropping");
                    }
                    Err(e) => {
                        tracing::debug!(id = self.meta.id, error = %e, "udp send failed");
                        self.close_hard(env);
                        return;
                    }
                }
            }
        }
        if out.abort {
            self.close_hard(env);
        }
    }

    /// Close the outward socket. Safe to repeat.
    pub fn close_soft(&mut self, env: FlowEnv<'_>) {
        if let Some(mut socket) = self.socket.take() {
            deregister(env.registry, &mut socket, self.meta.id);
        }
        if self.state != TransportState::Aborted {
            self.state = TransportState::Closed;
        }
        if !self.released {
            self.released = true;
            env.ctx.stats.record_connection_close();
            tracing::debug!(id = self.meta.id, "udp closed");
        }
    }

    /// Close the outward socket and mark the flow for eviction. Safe to repeat.
    pub fn close_hard(&mut self, env: FlowEnv<'_>) {
        self.close_soft(env);
        self.finished = true;
    }
}
