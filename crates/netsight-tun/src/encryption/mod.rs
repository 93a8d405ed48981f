//! Encryption layer of a flow, chosen from its first payload.

pub mod records;
pub mod tls;

use std::sync::Arc;

use netsight_core::mitm::{ForgedCertificate, MitmError};

use crate::app::AppSlot;
use crate::context::{EngineContext, Outbox};
use crate::transport::FlowMeta;

pub use tls::{TlsLayer, TlsState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionProtocol {
    Plaintext,
    Quic,
    Tls,
}

impl EncryptionProtocol {
    /// Classify the first outbound payload of a flow.
    pub fn detect(payload: &[u8]) -> Self {
        if is_client_hello(payload) {
            EncryptionProtocol::Tls
        } else if is_quic_long_header(payload) {
            EncryptionProtocol::Quic
        } else {
            EncryptionProtocol::Plaintext
        }
    }
}

fn is_client_hello(payload: &[u8]) -> bool {
    payload.len() > 6 && payload[0] == 0x16 && payload[5] == 0x01
}

fn is_quic_long_header(payload: &[u8]) -> bool {
    if payload.len() < 5 || payload[0] & 0xC0 != 0xC0 {
        return false;
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    version == 0 || version == 1
}

pub enum EncryptionLayer {
    Plaintext(AppSlot),
    /// Forwarded without interception.
    Quic(AppSlot),
    Tls(Box<TlsLayer>),
}

impl EncryptionLayer {
    /// Layer for a flow whose first payload is `payload`. Flows that start
    /// with inbound data are plaintext.
    pub fn for_first_payload(meta: &FlowMeta, payload: &[u8], inbound: bool) -> Self {
        let protocol = if inbound {
            EncryptionProtocol::Plaintext
        } else {
            EncryptionProtocol::detect(payload)
        };
        match protocol {
            EncryptionProtocol::Plaintext => EncryptionLayer::Plaintext(AppSlot::default()),
            EncryptionProtocol::Quic => {
                tracing::debug!(id = meta.id, remote = %meta.remote, host = %meta.remote_host, "quic connection");
                EncryptionLayer::Quic(AppSlot::default())
            }
            EncryptionProtocol::Tls => EncryptionLayer::Tls(Box::new(TlsLayer::new(meta))),
        }
    }

    pub fn protocol(&self) -> EncryptionProtocol {
        match self {
            EncryptionLayer::Plaintext(_) => EncryptionProtocol::Plaintext,
            EncryptionLayer::Quic(_) => EncryptionProtocol::Quic,
            EncryptionLayer::Tls(_) => EncryptionProtocol::Tls,
        }
    }

    pub fn outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8], out: &mut Outbox) {
        match self {
            EncryptionLayer::Plaintext(app) | EncryptionLayer::Quic(app) => {
                app.outbound(meta, ctx, payload);
                out.to_remote.extend_from_slice(payload);
            }
            EncryptionLayer::Tls(tls) => tls.outbound(meta, ctx, payload, out),
        }
    }

    pub fn inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8], out: &mut Outbox) {
        match self {
            EncryptionLayer::Plaintext(app) | EncryptionLayer::Quic(app) => {
                app.inbound(meta, ctx, payload);
                out.send_client(payload.to_vec());
            }
            EncryptionLayer::Tls(tls) => tls.inbound(meta, ctx, payload, out),
        }
    }

    pub fn leaf_ready(
        &mut self,
        meta: &FlowMeta,
        result: Result<Arc<ForgedCertificate>, MitmError>,
        out: &mut Outbox,
    ) {
        match self {
            EncryptionLayer::Tls(tls) => tls.leaf_ready(meta, result, out),
            _ => tracing::debug!(id = meta.id, "leaf for a flow that is not tls"),
        }
    }

    pub fn close(&mut self, out: &mut Outbox) {
        if let EncryptionLayer::Tls(tls) = self {
            tls.close(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::records::tests::client_hello;
    use super::*;

    #[test]
    fn test_detect_tls() {
        assert_eq!(EncryptionProtocol::detect(&client_hello("example.com")), EncryptionProtocol::Tls);
        // server hello is not an opener
        assert_eq!(
            EncryptionProtocol::detect(&[0x16, 0x03, 0x03, 0x00, 0x04, 0x02, 0x00]),
            EncryptionProtocol::Plaintext
        );
        assert_eq!(EncryptionProtocol::detect(&[0x16, 0x03, 0x01, 0x00, 0x04, 0x01]), EncryptionProtocol::Plaintext);
    }

    #[test]
    fn test_detect_quic() {
        #[rustfmt::skip]
        let initial = [
            0xC3,                   // long header, initial
            0x00, 0x00, 0x00, 0x01, // version 1
            0x08,
        ];
        assert_eq!(EncryptionProtocol::detect(&initial), EncryptionProtocol::Quic);

        let draft = [0xC3, 0xFF, 0x00, 0x00, 0x1D, 0x08];
        assert_eq!(EncryptionProtocol::detect(&draft), EncryptionProtocol::Plaintext);
        // short header
        assert_eq!(EncryptionProtocol::detect(&[0x43, 0, 0, 0, 1]), EncryptionProtocol::Plaintext);
    }

    #[test]
    fn test_detect_plaintext() {
        assert_eq!(EncryptionProtocol::detect(b"GET / HTTP/1.1\r\n"), EncryptionProtocol::Plaintext);
        assert_eq!(EncryptionProtocol::detect(&[]), EncryptionProtocol::Plaintext);
    }
}
