//! TCP flows: the client's handshake is terminated here and payloads are
//! proxied over an OS socket, which does its own retransmission.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Interest;
use netsight_core::mitm::{ForgedCertificate, MitmError};

use super::{deregister, outward_socket, ConnectionError, FlowEnv, FlowMeta, LayerStack, TransportState};
use crate::builder::IpPacketBuilder;
use crate::context::Outbox;
use crate::encryption::EncryptionProtocol;
use crate::packet::{tcp_flags, TcpSegment, TCP_HEADER_LEN};

const READ_CHUNK: usize = 16 * 1024;
/// Bytes the outward socket may lag behind the client before the flow is dropped.
const MAX_PENDING_WRITE: usize = 4 * 1024 * 1024;

pub struct TcpConnection {
    meta: FlowMeta,
    builder: IpPacketBuilder,
    stream: Option<TcpStream>,
    state: TransportState,
    stack: LayerStack,
    /// Next sequence number we send.
    our_seq: u32,
    /// Next sequence number expected from the client.
    their_seq: u32,
    /// Window advertised back to the client, echoed from its SYN.
    window: u16,
    mss: usize,
    /// The outward connect completed and SYN-ACK went out.
    upstream_ready: bool,
    /// The client sent FIN and the socket's write half is shut.
    client_fin: bool,
    pending_write: Vec<u8>,
    reset_sent: bool,
    released: bool,
    finished: bool,
}

impl TcpConnection {
    pub fn open(
        env: FlowEnv<'_>,
        meta: FlowMeta,
        builder: IpPacketBuilder,
        syn: &TcpSegment<'_>,
    ) -> Result<Self, ConnectionError> {
        let target = env.ctx.connect_target(meta.remote);
        let socket = outward_socket(target, meta.protocol, env.ctx.config.vpn.socket_mark)?;
        let mut stream = TcpStream::from_std(socket.into());
        env.registry.register(&mut stream, meta.token(), Interest::WRITABLE)?;

        let mss = (env.ctx.config.vpn.mtu as usize)
            .saturating_sub(builder.header_len() + TCP_HEADER_LEN)
            .max(1);
        let window = if syn.window == 0 { u16::MAX } else { syn.window };

        tracing::debug!(id = meta.id, target = %target, "tcp connecting");
        Ok(Self {
            meta,
            builder,
            stream: Some(stream),
            state: TransportState::Connecting,
            stack: LayerStack::default(),
            our_seq: rand::random(),
            their_seq: syn.seq.wrapping_add(1),
            window,
            mss,
            upstream_ready: false,
            client_fin: false,
            pending_write: Vec::new(),
            reset_sent: false,
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

    /// The outward connect completed at some point.
    pub fn reached_remote(&self) -> bool {
        self.upstream_ready
    }

    /// A segment captured from the client.
    pub fn handle_segment(&mut self, env: FlowEnv<'_>, segment: &TcpSegment<'_>) {
        let id = self.meta.id;

        if segment.has(tcp_flags::RST) {
            tracing::debug!(id, "tcp reset by client");
            self.state = TransportState::Aborted;
            self.reset_sent = true;
            self.release(env);
            self.finished = true;
            return;
        }

        if segment.has(tcp_flags::SYN) {
            if segment.has(tcp_flags::ACK) {
                tracing::debug!(id, "tcp unexpected SYN+ACK from client");
                self.close_hard(env);
            } else {
                tracing::trace!(id, "tcp duplicate SYN ignored");
            }
            return;
        }

        if !segment.payload.is_empty() {
            self.handle_data(env, segment);
            if self.finished {
                return;
            }
        }

        if segment.has(tcp_flags::FIN) {
            self.handle_fin(env, segment);
        } else if segment.payload.is_empty() && segment.has(tcp_flags::ACK) {
            self.handle_ack(env, segment);
        }
    }

    fn handle_data(&mut self, env: FlowEnv<'_>, segment: &TcpSegment<'_>) {
        match self.state {
            TransportState::Connected => {}
            TransportState::Connecting if self.upstream_ready => {
                self.state = TransportState::Connected;
            }
            TransportState::Closing if !self.client_fin => {}
            _ => {
                tracing::debug!(id = self.meta.id, state = ?self.state, "tcp data in wrong state");
                self.close_hard(env);
                return;
            }
        }

        if segment.seq != self.their_seq {
            // retransmission or reordering; the OS socket already has what we acked
            tracing::trace!(id = self.meta.id, seq = segment.seq, expected = self.their_seq, "tcp out of order");
            self.send_control(env, tcp_flags::ACK);
            return;
        }

        self.their_seq = self.their_seq.wrapping_add(segment.payload.len() as u32);
        self.send_control(env, tcp_flags::ACK);

        let out = self.stack.outbound(&self.meta, env.ctx, segment.payload);
        self.apply(env, out);
    }

    fn handle_ack(&mut self, env: FlowEnv<'_>, segment: &TcpSegment<'_>) {
        match self.state {
            TransportState::Connecting if self.upstream_ready => {
                tracing::debug!(id = self.meta.id, "tcp established");
                self.state = TransportState::Connected;
            }
            TransportState::Connecting => {
                tracing::debug!(id = self.meta.id, "tcp ACK before SYN-ACK");
                self.close_hard(env);
            }
            TransportState::Connected | TransportState::Closed => {}
            TransportState::Closing => {
                if segment.ack == self.our_seq && self.client_fin {
                    // our FIN is acknowledged after the client's own FIN
                    self.state = TransportState::Closed;
                    self.release(env);
                    self.finished = true;
                }
            }
            TransportState::Aborted => self.close_hard(env),
        }
    }

    fn handle_fin(&mut self, env: FlowEnv<'_>, segment: &TcpSegment<'_>) {
        let fin_seq = segment.seq.wrapping_add(segment.payload.len() as u32);
        match self.state {
            TransportState::Closing if !self.client_fin => {
                // remote closed first and the client now answers our FIN
                if fin_seq == self.their_seq {
                    self.their_seq = self.their_seq.wrapping_add(1);
                }
                self.send_control(env, tcp_flags::ACK);
                self.state = TransportState::Closed;
                self.release(env);
                self.finished = true;
            }
            TransportState::Closing => {
                // retransmitted FIN
                self.send_control(env, tcp_flags::ACK);
            }
            TransportState::Closed | TransportState::Aborted => self.close_hard(env),
            TransportState::Connecting | TransportState::Connected => {
                if let Some(stream) = self.stream.as_ref() {
                    if let Err(e) = stream.shutdown(Shutdown::Write) {
                        tracing::debug!(id = self.meta.id, error = %e, "tcp shutdown failed");
                    }
                }
                self.their_seq = self.their_seq.wrapping_add(1);
                self.send_control(env, tcp_flags::FIN | tcp_flags::ACK);
                self.our_seq = self.our_seq.wrapping_add(1);
                self.state = TransportState::Closing;
                self.client_fin = true;
            }
        }
    }

    /// Readiness of the outward socket.
    pub fn handle_ready(&mut self, env: FlowEnv<'_>, readable: bool, writable: bool) {
        if writable {
            if self.state == TransportState::Connecting && !self.upstream_ready {
                self.finish_connect(env);
            } else {
                self.flush_pending(env);
            }
        }
        if readable && !self.finished && self.upstream_ready {
            self.read_remote(env);
        }
    }

    fn finish_connect(&mut self, env: FlowEnv<'_>) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let failure = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => None,
                // spurious wakeup, connect still in progress
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) => Some(e),
            },
        };

        if let Some(e) = failure {
            tracing::debug!(id = self.meta.id, remote = %self.meta.remote, error = %e, "tcp connect failed");
            self.close_hard(env);
            return;
        }

        if let Err(e) = env.registry.reregister(stream, self.meta.token(), Interest::READABLE) {
            tracing::warn!(id = self.meta.id, error = %e, "tcp reregister failed");
            self.close_hard(env);
            return;
        }

        self.upstream_ready = true;
        self.send_control(env, tcp_flags::SYN | tcp_flags::ACK);
        self.our_seq = self.our_seq.wrapping_add(1);
        tracing::debug!(id = self.meta.id, "tcp connected, SYN-ACK sent");
    }

    fn read_remote(&mut self, env: FlowEnv<'_>) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.remote_closed(env);
                    return;
                }
                Ok(n) => {
                    let out = self.stack.inbound(&self.meta, env.ctx, &buf[..n]);
                    self.apply(env, out);
                    if self.finished {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(id = self.meta.id, error = %e, "tcp read failed");
                    self.close_hard(env);
                    return;
                }
            }
        }
    }

    fn remote_closed(&mut self, env: FlowEnv<'_>) {
        tracing::debug!(id = self.meta.id, state = ?self.state, "tcp remote closed");
        if self.state == TransportState::Closing {
            self.state = TransportState::Closed;
            self.release(env);
            self.finished = true;
            return;
        }

        self.send_control(env, tcp_flags::FIN | tcp_flags::ACK);
        self.our_seq = self.our_seq.wrapping_add(1);
        self.state = TransportState::Closing;
    }

    pub fn leaf_ready(&mut self, env: FlowEnv<'_>, result: Result<Arc<ForgedCertificate>, MitmError>) {
        let out = self.stack.leaf_ready(&self.meta, result);
        self.apply(env, out);
    }

    /// Route what the layers produced: client payloads become segments,
    /// remote bytes go to the socket.
    fn apply(&mut self, env: FlowEnv<'_>, out: Outbox) {
        for payload in &out.to_client {
            self.send_data(env, payload);
        }
        if !out.to_remote.is_empty() {
            if let Err(e) = self.write_remote(env, &out.to_remote) {
                tracing::debug!(id = self.meta.id, error = %e, "tcp write failed");
                self.close_hard(env);
                return;
            }
        }
        if out.abort {
            self.close_hard(env);
        }
    }

    /// Split `payload` into MSS sized segments for the client.
    fn send_data(&mut self, env: FlowEnv<'_>, payload: &[u8]) {
        for chunk in payload.chunks(self.mss) {
            let frame = self.builder.build_tcp(
                self.meta.local.port(),
                self.meta.remote.port(),
                self.our_seq,
                self.their_seq,
                tcp_flags::PSH | tcp_flags::ACK,
                self.window,
                chunk,
            );
            self.our_seq = self.our_seq.wrapping_add(chunk.len() as u32);
            env.ctx.send_frame(frame);
        }
    }

    fn send_control(&mut self, env: FlowEnv<'_>, flags: u8) {
        let frame = self.builder.build_tcp(
            self.meta.local.port(),
            self.meta.remote.port(),
            self.our_seq,
            self.their_seq,
            flags,
            self.window,
            &[],
        );
        env.ctx.send_frame(frame);
    }

    fn write_remote(&mut self, env: FlowEnv<'_>, bytes: &[u8]) -> Result<(), ConnectionError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ConnectionError::InvalidState("write without a socket"));
        };

        if !self.pending_write.is_empty() {
            self.pending_write.extend_from_slice(bytes);
        } else {
            let written = write_some(stream, bytes)?;
            if written < bytes.len() {
                self.pending_write.extend_from_slice(&bytes[written..]);
                env.registry.reregister(
                    stream,
                    self.meta.token(),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
        }

        if self.pending_write.len() > MAX_PENDING_WRITE {
            return Err(ConnectionError::WriteOverflow(self.pending_write.len()));
        }
        Ok(())
    }

    fn flush_pending(&mut self, env: FlowEnv<'_>) {
        if self.pending_write.is_empty() {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let result = match write_some(stream, &self.pending_write) {
            Ok(written) => {
                self.pending_write.drain(..written);
                if self.pending_write.is_empty() {
                    env.registry.reregister(stream, self.meta.token(), Interest::READABLE)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!(id = self.meta.id, error = %e, "tcp flush failed");
            self.close_hard(env);
        }
    }

    /// Close the outward socket after a last close_notify. Safe to repeat.
    pub fn close_soft(&mut self, env: FlowEnv<'_>) {
        if self.stream.is_some() && !matches!(self.state, TransportState::Aborted) {
            let out = self.stack.close();
            for payload in &out.to_client {
                self.send_data(env, payload);
            }
            if !out.to_remote.is_empty() {
                if let Some(stream) = self.stream.as_mut() {
                    match write_some(stream, &out.to_remote) {
                        Ok(written) if written < out.to_remote.len() => {
                            tracing::debug!(id = self.meta.id, written, len = out.to_remote.len(), "tcp close_notify truncated");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(id = self.meta.id, error = %e, "tcp close_notify write failed"),
                    }
                }
            }
        }
        if !matches!(self.state, TransportState::Aborted) {
            self.state = TransportState::Closed;
        }
        self.release(env);
    }

    /// Reset the client, close the socket and mark the flow for eviction.
    /// Safe to repeat.
    pub fn close_hard(&mut self, env: FlowEnv<'_>) {
        if !self.reset_sent {
            self.reset_sent = true;
            self.send_control(env, tcp_flags::RST | tcp_flags::ACK);
        }
        self.release(env);
        self.state = TransportState::Aborted;
        self.finished = true;
    }

    fn release(&mut self, env: FlowEnv<'_>) {
        if let Some(mut stream) = self.stream.take() {
            deregister(env.registry, &mut stream, self.meta.id);
        }
        self.pending_write.clear();
        if !self.released {
            self.released = true;
            env.ctx.stats.record_connection_close();
            tracing::debug!(id = self.meta.id, state = ?self.state, "tcp closed");
        }
    }
}

/// Write as much as the socket takes without blocking.
fn write_some(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
