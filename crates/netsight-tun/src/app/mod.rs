//! Application protocol handlers sitting on top of the encryption layer.
//!
//! Handlers only observe; the encryption layer forwards every byte unchanged.

pub mod dns;
pub mod http;

use crate::context::EngineContext;
use crate::transport::FlowMeta;

pub use dns::DnsHandler;
pub use http::HttpHandler;

const HTTP_KEYWORDS: [&str; 9] = [
    "GET", "POST", "CONNECT", "PUT", "DELETE", "HEAD", "OPTIONS", "TRACE", "PATCH",
];

/// Bytes of the first payload inspected for an HTTP keyword.
const CLASSIFY_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProtocol {
    Dns,
    Http,
    Raw,
}

/// Pick the handler for a flow from its first outbound payload.
pub fn classify(remote_port: u16, payload: &[u8]) -> AppProtocol {
    if remote_port == 53 {
        return AppProtocol::Dns;
    }
    if payload.len() > 7 && is_http_start(payload) {
        return AppProtocol::Http;
    }
    AppProtocol::Raw
}

fn is_http_start(payload: &[u8]) -> bool {
    let window = &payload[..payload.len().min(CLASSIFY_WINDOW)];
    let text = String::from_utf8_lossy(window);
    let token = text.split(' ').next().unwrap_or("");
    token.starts_with("HTTP/") || HTTP_KEYWORDS.contains(&token)
}

#[derive(Debug)]
pub enum AppLayer {
    Dns(DnsHandler),
    Http(HttpHandler),
    Raw,
}

impl AppLayer {
    pub fn new(protocol: AppProtocol) -> Self {
        match protocol {
            AppProtocol::Dns => AppLayer::Dns(DnsHandler),
            AppProtocol::Http => AppLayer::Http(HttpHandler::default()),
            AppProtocol::Raw => AppLayer::Raw,
        }
    }

    /// Handler for a flow whose first payload is `payload`. Flows that start
    /// with inbound data are always raw.
    pub fn for_first_payload(meta: &FlowMeta, payload: &[u8], inbound: bool) -> Self {
        let protocol = if inbound {
            AppProtocol::Raw
        } else {
            classify(meta.remote.port(), payload)
        };
        tracing::debug!(id = meta.id, protocol = ?protocol, "app layer selected");
        Self::new(protocol)
    }

    pub fn protocol(&self) -> AppProtocol {
        match self {
            AppLayer::Dns(_) => AppProtocol::Dns,
            AppLayer::Http(_) => AppProtocol::Http,
            AppLayer::Raw => AppProtocol::Raw,
        }
    }

    pub fn unwrap_outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        match self {
            AppLayer::Dns(dns) => dns.unwrap_outbound(meta, payload),
            AppLayer::Http(http) => http.unwrap_outbound(meta, ctx, payload),
            AppLayer::Raw => {}
        }
    }

    pub fn unwrap_inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        match self {
            AppLayer::Dns(dns) => dns.unwrap_inbound(meta, ctx, payload),
            AppLayer::Http(http) => http.unwrap_inbound(meta, ctx, payload),
            AppLayer::Raw => {}
        }
    }
}

/// Lazily created app layer of one flow.
#[derive(Debug, Default)]
pub struct AppSlot(Option<AppLayer>);

impl AppSlot {
    pub fn outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        self.0
            .get_or_insert_with(|| AppLayer::for_first_payload(meta, payload, false))
            .unwrap_outbound(meta, ctx, payload);
    }

    pub fn inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        self.0
            .get_or_insert_with(|| AppLayer::for_first_payload(meta, payload, true))
            .unwrap_inbound(meta, ctx, payload);
    }

    pub fn protocol(&self) -> Option<AppProtocol> {
        self.0.as_ref().map(AppLayer::protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_selects_http() {
        assert_eq!(classify(80, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"), AppProtocol::Http);
        assert_eq!(classify(8080, b"POST /upload HTTP/1.1\r\n"), AppProtocol::Http);
        assert_eq!(classify(80, b"HTTP/1.1 200 OK\r\n"), AppProtocol::Http);
    }

    #[test]
    fn test_port_53_selects_dns_regardless_of_payload() {
        assert_eq!(classify(53, b"GET / HTTP/1.1\r\n"), AppProtocol::Dns);
        assert_eq!(classify(53, &[]), AppProtocol::Dns);
    }

    #[test]
    fn test_other_payloads_are_raw() {
        assert_eq!(classify(443, &[0x16, 0x03, 0x01, 0x02, 0x00, 0x01]), AppProtocol::Raw);
        assert_eq!(classify(80, b"GET /"), AppProtocol::Raw);
        assert_eq!(classify(80, b"GETTING STARTED"), AppProtocol::Raw);
        assert_eq!(classify(80, &[0xFF; 12]), AppProtocol::Raw);
    }
}
