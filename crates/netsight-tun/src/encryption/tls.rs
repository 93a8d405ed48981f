//! TLS interception: terminate the client's session with a forged leaf and
//! re-originate a genuine session to the real server.

use std::io::{Read, Write};
use std::sync::Arc;

use netsight_core::mitm::{server_config_for, ForgedCertificate, MitmError, UpstreamIdentity};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, ServerConnection};

use super::records::{parse_sni, RecordAssembler, RecordType, RECORD_HEADER_LEN};
use crate::app::AppSlot;
use crate::context::{EngineContext, Outbox};
use crate::transport::{ConnectionError, FlowMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Collecting the ClientHello.
    New,
    /// Not intercepted; bytes are forwarded as they are.
    Passthrough,
    /// Handshaking with the real server.
    ServerHandshake,
    /// Server session up, waiting for the forged leaf.
    ServerEstablished,
    /// Handshaking with the client using the forged leaf.
    ClientHandshake,
    ClientEstablished,
    Closed,
}

#[derive(Debug, Default)]
struct Absorbed {
    plaintext: Vec<u8>,
    peer_closed: bool,
}

pub struct TlsLayer {
    state: TlsState,
    records: RecordAssembler,
    /// Raw ClientHello records, replayed into the client-facing session.
    client_hello: Vec<u8>,
    /// Handshake bytes the ClientHello spans, once known.
    hello_len: Option<usize>,
    hostname: String,
    upstream: Option<Connection>,
    downstream: Option<Connection>,
    /// Server plaintext that arrived before the client session was up.
    queued_inbound: Vec<u8>,
    app: AppSlot,
}

impl TlsLayer {
    pub fn new(meta: &FlowMeta) -> Self {
        tracing::debug!(id = meta.id, remote = %meta.remote, host = %meta.remote_host, "tls connection");
        Self {
            state: TlsState::New,
            records: RecordAssembler::new(),
            client_hello: Vec::new(),
            hello_len: None,
            hostname: meta.remote_host.clone(),
            upstream: None,
            downstream: None,
            queued_inbound: Vec::new(),
            app: AppSlot::default(),
        }
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Client bytes headed for the server.
    pub fn outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8], out: &mut Outbox) {
        let result = match self.state {
            TlsState::New => self.collect_client_hello(meta, ctx, payload, out),
            TlsState::Passthrough => {
                out.to_remote.extend_from_slice(payload);
                Ok(())
            }
            TlsState::ServerHandshake | TlsState::ServerEstablished => Err(ConnectionError::InvalidState(
                "client data before the forged handshake",
            )),
            TlsState::ClientHandshake => self.client_handshake(meta, ctx, payload, out),
            TlsState::ClientEstablished => self.decrypt_client(meta, ctx, payload, out),
            TlsState::Closed => Ok(()),
        };
        if let Err(e) = result {
            self.fail(meta, e, out);
        }
    }

    /// Server bytes headed for the client.
    pub fn inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8], out: &mut Outbox) {
        let result = match self.state {
            TlsState::New | TlsState::Passthrough => {
                out.send_client(payload.to_vec());
                Ok(())
            }
            TlsState::ServerHandshake => self.server_handshake(meta, ctx, payload, out),
            TlsState::ServerEstablished | TlsState::ClientHandshake => self.queue_server(payload, out),
            TlsState::ClientEstablished => self.decrypt_server(meta, ctx, payload, out),
            TlsState::Closed => Ok(()),
        };
        if let Err(e) = result {
            self.fail(meta, e, out);
        }
    }

    /// The forged leaf for this flow is ready (or failed).
    pub fn leaf_ready(
        &mut self,
        meta: &FlowMeta,
        result: Result<Arc<ForgedCertificate>, MitmError>,
        out: &mut Outbox,
    ) {
        if self.state != TlsState::ServerEstablished {
            tracing::debug!(id = meta.id, state = ?self.state, "tls leaf arrived late, ignoring");
            return;
        }
        let result = result
            .map_err(ConnectionError::from)
            .and_then(|leaf| self.start_client_session(meta, &leaf, out));
        if let Err(e) = result {
            self.fail(meta, e, out);
        }
    }

    /// Send close_notify on every open session.
    pub fn close(&mut self, out: &mut Outbox) {
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.send_close_notify();
            if let Err(e) = flush(upstream, &mut out.to_remote) {
                tracing::debug!(error = %e, "tls close_notify to server failed");
            }
        }
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.send_close_notify();
            let mut alert = Vec::new();
            if let Err(e) = flush(downstream, &mut alert) {
                tracing::debug!(error = %e, "tls close_notify to client failed");
            }
            out.send_client(alert);
        }
        self.state = TlsState::Closed;
    }

    fn fail(&mut self, meta: &FlowMeta, error: ConnectionError, out: &mut Outbox) {
        tracing::warn!(
            id = meta.id,
            host = %self.hostname,
            state = ?self.state,
            error = %error,
            "tls flow aborted"
        );
        self.state = TlsState::Closed;
        out.abort = true;
    }

    fn collect_client_hello(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let records = match self.records.push(payload) {
            Ok(records) => records,
            Err(invalid) => {
                tracing::debug!(id = meta.id, record_type = invalid.0, "tls invalid record, passing through");
                self.pass_through(out);
                return Ok(());
            }
        };

        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            if self.hello_len.is_none() {
                if !RecordType::of(&record).is_some_and(RecordType::is_client_hello) {
                    self.client_hello.extend_from_slice(&record);
                    records.by_ref().for_each(|rest| self.client_hello.extend_from_slice(&rest));
                    tracing::debug!(id = meta.id, "tls stream does not open with a ClientHello");
                    self.pass_through(out);
                    return Ok(());
                }
                if let Some(sni) = parse_sni(&record) {
                    self.hostname = sni;
                }
                self.hello_len = Some(handshake_len(&record));
            }
            self.client_hello.extend_from_slice(&record);
        }

        let Some(needed) = self.hello_len else {
            return Ok(());
        };
        if hello_body_len(&self.client_hello) < needed {
            // ClientHello spans more records
            return Ok(());
        }

        if !ctx.should_intercept(meta.app(ctx), &self.hostname) {
            tracing::debug!(id = meta.id, host = %self.hostname, "tls not intercepted");
            self.pass_through(out);
            return Ok(());
        }
        self.start_server_session(meta, ctx, out)
    }

    fn pass_through(&mut self, out: &mut Outbox) {
        out.to_remote.append(&mut self.client_hello);
        out.to_remote.extend_from_slice(&self.records.take_pending());
        self.state = TlsState::Passthrough;
    }

    fn start_server_session(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let config = ctx
            .upstream_tls
            .clone()
            .ok_or(ConnectionError::InvalidState("interception without a client config"))?;
        let server_name = ServerName::try_from(self.hostname.as_str())?.to_owned();

        let mut upstream = Connection::Client(ClientConnection::new(config, server_name)?);
        upstream.set_buffer_limit(None);
        flush(&mut upstream, &mut out.to_remote)?;
        self.upstream = Some(upstream);

        tracing::debug!(id = meta.id, host = %self.hostname, "tls intercepting, handshaking with server");
        self.state = TlsState::ServerHandshake;
        Ok(())
    }

    fn server_handshake(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("server handshake without a session"))?;
        let absorbed = absorb(upstream, payload)?;
        flush(upstream, &mut out.to_remote)?;
        self.queued_inbound.extend_from_slice(&absorbed.plaintext);

        if upstream.is_handshaking() {
            return Ok(());
        }

        let certificate = upstream
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or(ConnectionError::InvalidState("server presented no certificate"))?;
        let identity = UpstreamIdentity::from_der(certificate.as_ref(), &self.hostname)?;
        tracing::debug!(
            id = meta.id,
            cn = %identity.common_name,
            alt_names = identity.alt_names.len(),
            "tls server established, forging leaf"
        );

        ctx.request_leaf(meta.key, meta.id, identity);
        self.state = TlsState::ServerEstablished;
        Ok(())
    }

    fn queue_server(&mut self, payload: &[u8], out: &mut Outbox) -> Result<(), ConnectionError> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("server data without a session"))?;
        let absorbed = absorb(upstream, payload)?;
        flush(upstream, &mut out.to_remote)?;
        self.queued_inbound.extend_from_slice(&absorbed.plaintext);
        Ok(())
    }

    fn start_client_session(
        &mut self,
        meta: &FlowMeta,
        leaf: &ForgedCertificate,
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let config = server_config_for(leaf)?;
        let mut downstream = Connection::Server(ServerConnection::new(config)?);
        downstream.set_buffer_limit(None);

        let hello = std::mem::take(&mut self.client_hello);
        absorb(&mut downstream, &hello)?;
        let mut reply = Vec::new();
        flush(&mut downstream, &mut reply)?;
        out.send_client(reply);

        self.downstream = Some(downstream);
        tracing::debug!(id = meta.id, cn = %leaf.common_name, "tls handshaking with client");
        self.state = TlsState::ClientHandshake;
        Ok(())
    }

    fn client_handshake(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let downstream = self
            .downstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("client handshake without a session"))?;

        let absorbed = match absorb(downstream, payload) {
            Ok(absorbed) => absorbed,
            Err(e) => {
                // most likely the client refuses the forged chain
                let mut alert = Vec::new();
                if flush(downstream, &mut alert).is_ok() {
                    out.send_client(alert);
                }
                let app = meta.app(ctx);
                ctx.passthrough.put(app.app_id, &self.hostname);
                tracing::info!(
                    id = meta.id,
                    host = %self.hostname,
                    app = %app.package,
                    "tls client rejected interception, host added to passthrough"
                );
                return Err(e);
            }
        };
        let mut reply = Vec::new();
        flush(downstream, &mut reply)?;
        out.send_client(reply);

        if downstream.is_handshaking() {
            return Ok(());
        }

        tracing::debug!(id = meta.id, host = %self.hostname, "tls client established");
        self.state = TlsState::ClientEstablished;

        let queued = std::mem::take(&mut self.queued_inbound);
        self.forward_to_client(meta, ctx, &queued, out)?;
        self.forward_to_server(meta, ctx, &absorbed.plaintext, out)
    }

    fn decrypt_client(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let downstream = self
            .downstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("client data without a session"))?;
        let absorbed = absorb(downstream, payload)?;
        let mut reply = Vec::new();
        flush(downstream, &mut reply)?;
        out.send_client(reply);

        self.forward_to_server(meta, ctx, &absorbed.plaintext, out)?;
        if absorbed.peer_closed {
            if let Some(upstream) = self.upstream.as_mut() {
                upstream.send_close_notify();
                flush(upstream, &mut out.to_remote)?;
            }
        }
        Ok(())
    }

    fn decrypt_server(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("server data without a session"))?;
        let absorbed = absorb(upstream, payload)?;
        flush(upstream, &mut out.to_remote)?;

        self.forward_to_client(meta, ctx, &absorbed.plaintext, out)?;
        if absorbed.peer_closed {
            if let Some(downstream) = self.downstream.as_mut() {
                downstream.send_close_notify();
                let mut alert = Vec::new();
                flush(downstream, &mut alert)?;
                out.send_client(alert);
            }
        }
        Ok(())
    }

    /// Inspect client plaintext and re-encrypt it for the server.
    fn forward_to_server(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        plaintext: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        if plaintext.is_empty() {
            return Ok(());
        }
        self.app.outbound(meta, ctx, plaintext);
        let upstream = self
            .upstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("no server session"))?;
        upstream.writer().write_all(plaintext)?;
        flush(upstream, &mut out.to_remote)
    }

    /// Inspect server plaintext and re-encrypt it for the client.
    fn forward_to_client(
        &mut self,
        meta: &FlowMeta,
        ctx: &EngineContext,
        plaintext: &[u8],
        out: &mut Outbox,
    ) -> Result<(), ConnectionError> {
        if plaintext.is_empty() {
            return Ok(());
        }
        self.app.inbound(meta, ctx, plaintext);
        let downstream = self
            .downstream
            .as_mut()
            .ok_or(ConnectionError::InvalidState("no client session"))?;
        downstream.writer().write_all(plaintext)?;
        let mut records = Vec::new();
        flush(downstream, &mut records)?;
        out.send_client(records);
        Ok(())
    }
}

/// Handshake message length declared by a ClientHello record, header included.
fn handshake_len(record: &[u8]) -> usize {
    match record.get(RECORD_HEADER_LEN + 1..RECORD_HEADER_LEN + 4) {
        Some(len) => 4 + u32::from_be_bytes([0, len[0], len[1], len[2]]) as usize,
        None => 0,
    }
}

/// Sum of the record bodies in a buffer of whole records.
fn hello_body_len(records: &[u8]) -> usize {
    let mut pos = 0;
    let mut body = 0;
    while pos + RECORD_HEADER_LEN <= records.len() {
        let len = u16::from_be_bytes([records[pos + 3], records[pos + 4]]) as usize;
        body += len;
        pos += RECORD_HEADER_LEN + len;
    }
    body
}

/// Feed received TLS bytes into a session and collect the plaintext they carry.
fn absorb(conn: &mut Connection, mut bytes: &[u8]) -> Result<Absorbed, ConnectionError> {
    let mut absorbed = Absorbed::default();
    while !bytes.is_empty() {
        if conn.read_tls(&mut bytes)? == 0 {
            break;
        }
        let io_state = conn.process_new_packets()?;
        let available = io_state.plaintext_bytes_to_read();
        if available > 0 {
            let start = absorbed.plaintext.len();
            absorbed.plaintext.resize(start + available, 0);
            conn.reader().read_exact(&mut absorbed.plaintext[start..])?;
        }
        absorbed.peer_closed |= io_state.peer_has_closed();
    }
    Ok(absorbed)
}

/// Move every pending TLS record of a session into `sink`.
fn flush(conn: &mut Connection, sink: &mut Vec<u8>) -> Result<(), ConnectionError> {
    while conn.wants_write() {
        conn.write_tls(sink)?;
    }
    Ok(())
}
