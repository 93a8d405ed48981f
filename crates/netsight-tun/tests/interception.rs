//! Runs the TLS interception layer between a real rustls client and a real
//! rustls server, both in memory. The server is signed by its own CA, which
//! only the engine trusts; the client trusts the engine's CA or not at all.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use netsight_core::config::Config;
use netsight_core::mitm::{
    server_config_for, upstream_client_config, Authority, CertificateAuthority, CertificateStore,
    MergeVerifier, UpstreamIdentity,
};
use netsight_core::persist::TracingConnector;
use netsight_core::tracker::TrackerTrie;
use netsight_tun::cache::key_for_packet;
use netsight_tun::context::{ContextParts, EngineContext, LeafReady, Outbox};
use netsight_tun::encryption::{TlsLayer, TlsState};
use netsight_tun::packet::{IpPacketInfo, TransportInfo, TransportProtocol};
use netsight_tun::process::{AppFinder, AppInfo};
use netsight_tun::transport::FlowMeta;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, ServerConnection};
use tempfile::TempDir;
use tokio::sync::mpsc;

const HOST: &str = "example.com";

struct FixedFinder;

impl AppFinder for FixedFinder {
    fn find(&self, _local: SocketAddr, _remote: SocketAddr, _protocol: TransportProtocol) -> AppInfo {
        AppInfo {
            app_id: 1000,
            package: "curl".to_string(),
        }
    }
}

fn authority(dir: &TempDir, name: &str) -> CertificateAuthority {
    CertificateAuthority::load_or_create(Authority {
        key_store_dir: dir.path().to_path_buf(),
        alias: name.to_string(),
        password: "changeit".to_string(),
        issuer_cn: format!("{name} Root"),
        issuer_o: name.to_string(),
        issuer_ou: name.to_string(),
        subject_o: name.to_string(),
        subject_ou: name.to_string(),
    })
    .unwrap()
}

/// One intercepted flow with both real endpoints.
struct Interception {
    _runtime: tokio::runtime::Runtime,
    _dirs: (TempDir, TempDir),
    _frames: mpsc::Receiver<Vec<u8>>,
    ctx: EngineContext,
    leaves: mpsc::UnboundedReceiver<LeafReady>,
    meta: FlowMeta,
    engine_ca: Arc<CertificateAuthority>,
    server: Connection,
}

impl Interception {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let engine_dir = tempfile::tempdir().unwrap();
        let server_dir = tempfile::tempdir().unwrap();
        let engine_ca = Arc::new(authority(&engine_dir, "engine"));
        let server_ca = authority(&server_dir, "upstream");

        let server_leaf = server_ca.forge_leaf(&UpstreamIdentity::for_host(HOST)).unwrap();
        let server = Connection::Server(ServerConnection::new(server_config_for(&server_leaf).unwrap()).unwrap());

        let verifier = MergeVerifier::with_custom_roots(&[server_ca.ca_cert_der().clone()]).unwrap();
        let mut config = Config::default_config();
        config.mitm.enabled = true;

        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (leaf_tx, leaf_rx) = mpsc::unbounded_channel();
        let parts = ContextParts {
            config,
            trackers: TrackerTrie::from_lines(["tracker.example"]),
            certificates: Some(CertificateStore::new(engine_ca.clone(), 16)),
            upstream_tls: Some(upstream_client_config(Arc::new(verifier)).unwrap()),
            persistence: Arc::new(TracingConnector),
            app_finder: Arc::new(FixedFinder),
            runtime: runtime.handle().clone(),
        };
        let ctx = EngineContext::new(parts, frame_tx, leaf_tx, None);

        let info = IpPacketInfo {
            version: 4,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 120, 0, 2)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            protocol: TransportProtocol::Tcp,
            header_len: 20,
            total_len: 40,
            tos: 0,
            ident: 0,
            flow_label: 0,
        };
        let transport = TransportInfo {
            src_port: 40000,
            dst_port: 443,
            protocol: TransportProtocol::Tcp,
        };
        let meta = FlowMeta::resolve(&ctx, key_for_packet(&info, &transport), &info, &transport);

        Self {
            _runtime: runtime,
            _dirs: (engine_dir, server_dir),
            _frames: frame_rx,
            ctx,
            leaves: leaf_rx,
            meta,
            engine_ca,
            server,
        }
    }

    /// A client trusting only `root`.
    fn client_trusting(&self, root: &CertificateAuthority) -> Connection {
        let verifier = MergeVerifier::with_custom_roots(&[root.ca_cert_der().clone()]).unwrap();
        let config = upstream_client_config(Arc::new(verifier)).unwrap();
        let name = ServerName::try_from(HOST).unwrap().to_owned();
        Connection::Client(ClientConnection::new(config, name).unwrap())
    }

    fn outbound(&self, layer: &mut TlsLayer, bytes: &[u8]) -> Outbox {
        let mut out = Outbox::new();
        layer.outbound(&self.meta, &self.ctx, bytes, &mut out);
        out
    }

    fn inbound(&self, layer: &mut TlsLayer, bytes: &[u8]) -> Outbox {
        let mut out = Outbox::new();
        layer.inbound(&self.meta, &self.ctx, bytes, &mut out);
        out
    }

    /// Feed the ClientHello and run the server side until the layer asks for
    /// a leaf, then hand it the forged one.
    fn intercept(&mut self, layer: &mut TlsLayer, client: &mut Connection) -> Outbox {
        let out = self.outbound(layer, &drain(client));
        assert!(!out.abort);
        assert_eq!(layer.state(), TlsState::ServerHandshake);
        assert_eq!(layer.hostname(), HOST);

        let mut to_server = out.to_remote;
        for _ in 0..10 {
            if layer.state() == TlsState::ServerEstablished {
                break;
            }
            feed(&mut self.server, &to_server).unwrap();
            let bytes = drain(&mut self.server);
            let out = self.inbound(layer, &bytes);
            assert!(!out.abort);
            to_server = out.to_remote;
        }
        assert_eq!(layer.state(), TlsState::ServerEstablished);
        feed(&mut self.server, &to_server).unwrap();

        let leaf = self.leaves.blocking_recv().unwrap();
        assert_eq!(leaf.key, self.meta.key);
        assert_eq!(leaf.id, self.meta.id);

        let mut out = Outbox::new();
        layer.leaf_ready(&self.meta, leaf.result, &mut out);
        assert!(!out.abort);
        assert_eq!(layer.state(), TlsState::ClientHandshake);
        out
    }
}

/// Deliver TLS bytes and return the plaintext they carried.
fn feed(conn: &mut Connection, mut bytes: &[u8]) -> Result<Vec<u8>, rustls::Error> {
    let mut plaintext = Vec::new();
    while !bytes.is_empty() {
        if conn.read_tls(&mut bytes).unwrap() == 0 {
            break;
        }
        let state = conn.process_new_packets()?;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let start = plaintext.len();
            plaintext.resize(start + available, 0);
            conn.reader().read_exact(&mut plaintext[start..]).unwrap();
        }
    }
    Ok(plaintext)
}

fn drain(conn: &mut Connection) -> Vec<u8> {
    let mut bytes = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut bytes).unwrap();
    }
    bytes
}

#[test]
fn test_intercepted_session_relays_plaintext_both_ways() {
    let mut flow = Interception::new();
    let mut client = flow.client_trusting(&flow.engine_ca.clone());
    let mut layer = TlsLayer::new(&flow.meta);

    let mut out = flow.intercept(&mut layer, &mut client);
    for _ in 0..10 {
        for payload in &out.to_client {
            feed(&mut client, payload).unwrap();
        }
        let reply = drain(&mut client);
        if reply.is_empty() {
            break;
        }
        out = flow.outbound(&mut layer, &reply);
        assert!(!out.abort);
    }
    assert!(!client.is_handshaking());
    assert_eq!(layer.state(), TlsState::ClientEstablished);

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    client.writer().write_all(request).unwrap();
    let out = flow.outbound(&mut layer, &drain(&mut client));
    assert!(!out.abort);
    assert_eq!(feed(&mut flow.server, &out.to_remote).unwrap(), request);

    let response = b"HTTP/1.1 204 No Content\r\n\r\n";
    flow.server.writer().write_all(response).unwrap();
    let bytes = drain(&mut flow.server);
    let out = flow.inbound(&mut layer, &bytes);
    assert!(!out.abort);
    let mut plaintext = Vec::new();
    for payload in &out.to_client {
        plaintext.extend(feed(&mut client, payload).unwrap());
    }
    assert_eq!(plaintext, response);
    assert!(!flow.ctx.passthrough.contains(1000, HOST));
}

#[test]
fn test_rejected_forgery_marks_host_as_passthrough() {
    let mut flow = Interception::new();
    // trusts neither the engine nor the real server
    let stranger_dir = tempfile::tempdir().unwrap();
    let stranger = authority(&stranger_dir, "stranger");
    let mut client = flow.client_trusting(&stranger);
    let mut layer = TlsLayer::new(&flow.meta);

    let out = flow.intercept(&mut layer, &mut client);
    let refused = out.to_client.iter().any(|payload| feed(&mut client, payload).is_err());
    assert!(refused);

    let alert = drain(&mut client);
    assert!(!alert.is_empty());
    let out = flow.outbound(&mut layer, &alert);
    assert!(out.abort);
    assert_eq!(layer.state(), TlsState::Closed);
    assert!(flow.ctx.passthrough.contains(1000, HOST));

    // the next session from the same app is forwarded untouched
    let mut retry = flow.client_trusting(&stranger);
    let hello = drain(&mut retry);
    let mut next = TlsLayer::new(&flow.meta);
    let out = flow.outbound(&mut next, &hello);
    assert_eq!(next.state(), TlsState::Passthrough);
    assert_eq!(out.to_remote, hello);
    assert!(flow.leaves.try_recv().is_err());
}
