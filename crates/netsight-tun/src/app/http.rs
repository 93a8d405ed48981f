use std::collections::BTreeMap;

use netsight_core::persist::{now_millis, HttpRequestRecord, HttpResponseRecord, MessageEndpoints};

use crate::context::EngineContext;
use crate::transport::FlowMeta;

/// Messages larger than this are dropped unrecorded.
const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// One reassembled HTTP/1.x message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `(method, path)` of a request line.
    pub fn request_line(&self) -> Option<(&str, &str)> {
        let mut parts = self.start_line.splitn(3, ' ');
        let method = parts.next()?;
        let path = parts.next()?;
        parts.next()?;
        Some((method, path))
    }

    /// `(code, reason)` of a status line.
    pub fn status_line(&self) -> Option<(u16, &str)> {
        let mut parts = self.start_line.splitn(3, ' ');
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        let code = parts.next()?.parse().ok()?;
        Some((code, parts.next().unwrap_or("")))
    }
}

enum Chunks {
    Incomplete,
    Invalid,
    Complete { body: Vec<u8>, consumed: usize },
}

/// Collects the bytes of one direction until whole messages are available.
///
/// Bodies framed by `Content-Length` wait for the stated length; chunked
/// bodies wait for the terminating zero-length chunk and are de-chunked.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<HttpMessage> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_MESSAGE_BYTES {
            tracing::warn!(len = self.buffer.len(), "http message too large, discarding");
            self.buffer.clear();
            return Vec::new();
        }

        let mut messages = Vec::new();
        while let Some((message, consumed)) = self.next_message() {
            messages.push(message);
            self.buffer.drain(..consumed);
        }
        messages
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_message(&self) -> Option<(HttpMessage, usize)> {
        let head_end = find(&self.buffer, b"\r\n\r\n")?;
        let head = String::from_utf8_lossy(&self.buffer[..head_end]);
        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or("").to_string();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers
                    .entry(name.trim().to_string())
                    .and_modify(|v| {
                        v.push_str(", ");
                        v.push_str(value.trim());
                    })
                    .or_insert_with(|| value.trim().to_string());
            }
        }

        let mut message = HttpMessage {
            start_line,
            headers,
            body: Vec::new(),
        };
        let body_start = head_end + 4;
        let rest = &self.buffer[body_start..];

        let chunked = message
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        if chunked {
            return match dechunk(rest) {
                Chunks::Incomplete => None,
                Chunks::Complete { body, consumed } => {
                    message.body = body;
                    Some((message, body_start + consumed))
                }
                Chunks::Invalid => {
                    tracing::debug!("invalid chunked body, recording raw bytes");
                    message.body = rest.to_vec();
                    Some((message, self.buffer.len()))
                }
            };
        }

        let length = message
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok());
        match length {
            Some(length) if rest.len() < length => None,
            Some(length) => {
                message.body = rest[..length].to_vec();
                Some((message, body_start + length))
            }
            // without framing, whatever arrived with the head is the body
            None => {
                message.body = rest.to_vec();
                Some((message, self.buffer.len()))
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(data: &[u8]) -> Chunks {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = find(&data[pos..], b"\r\n") else {
            return Chunks::Incomplete;
        };
        let size_line = String::from_utf8_lossy(&data[pos..pos + line_len]);
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = match usize::from_str_radix(size_field, 16) {
            Ok(size) if size <= MAX_MESSAGE_BYTES => size,
            _ => return Chunks::Invalid,
        };
        pos += line_len + 2;

        if size == 0 {
            // trailer section ends with an empty line
            loop {
                let Some(trailer_len) = find(&data[pos..], b"\r\n") else {
                    return Chunks::Incomplete;
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Chunks::Complete { body, consumed: pos };
                }
            }
        }

        let Some(end) = pos.checked_add(size) else {
            return Chunks::Invalid;
        };
        match end.checked_add(2) {
            Some(next) if next <= data.len() => {
                body.extend_from_slice(&data[pos..end]);
                pos = next;
            }
            Some(_) => return Chunks::Incomplete,
            None => return Chunks::Invalid,
        }
    }
}

/// Records HTTP requests and responses of a flow.
#[derive(Debug, Default)]
pub struct HttpHandler {
    requests: MessageAssembler,
    responses: MessageAssembler,
}

impl HttpHandler {
    pub fn unwrap_outbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        for message in self.requests.push(payload) {
            let Some((method, path)) = message
                .request_line()
                .map(|(m, p)| (m.to_string(), p.to_string()))
            else {
                tracing::debug!(id = meta.id, line = %message.start_line, "http invalid request line");
                continue;
            };
            tracing::debug!(id = meta.id, method = %method, path = %path, "http request");

            let record = HttpRequestRecord {
                endpoints: endpoints(meta, ctx),
                timestamp: now_millis(),
                method,
                remote_path: path,
                content: String::from_utf8_lossy(&message.body).to_string(),
                content_length: message.body.len(),
                headers: message.headers,
            };
            ctx.persist(|db| async move { db.persist_http_request(record).await });
        }
    }

    pub fn unwrap_inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        for message in self.responses.push(payload) {
            let Some((status_code, status_msg)) = message
                .status_line()
                .map(|(c, m)| (c, m.to_string()))
            else {
                tracing::debug!(id = meta.id, line = %message.start_line, "http invalid status line");
                continue;
            };
            tracing::debug!(id = meta.id, status_code, "http response");

            let record = HttpResponseRecord {
                endpoints: endpoints(meta, ctx),
                timestamp: now_millis(),
                status_code,
                status_msg,
                content: String::from_utf8_lossy(&message.body).to_string(),
                content_length: message.body.len(),
                headers: message.headers,
            };
            ctx.persist(|db| async move { db.persist_http_response(record).await });
        }
    }
}

fn endpoints(meta: &FlowMeta, ctx: &EngineContext) -> MessageEndpoints {
    let app = meta.app(ctx);
    MessageEndpoints {
        connection_id: meta.id,
        remote_host: meta.remote_host.clone(),
        remote_ip: meta.remote.ip().to_string(),
        remote_port: meta.remote.port(),
        local_ip: meta.local.ip().to_string(),
        local_port: meta.local.port(),
        initiator_id: app.app_id,
        initiator_pkg: app.package.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_request() {
        let mut assembler = MessageAssembler::default();
        let messages = assembler.push(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].request_line(), Some(("GET", "/index.html")));
        assert_eq!(messages[0].header("host"), Some("example.com"));
        assert!(messages[0].body.is_empty());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_content_length_waits_for_body() {
        let mut assembler = MessageAssembler::default();
        assert!(assembler
            .push(b"POST /api HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello")
            .is_empty());
        assert!(assembler.pending() > 0);

        let messages = assembler.push(b" world");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, b"hello world");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_chunked_response_is_dechunked() {
        let mut assembler = MessageAssembler::default();
        assert!(assembler
            .push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .is_empty());

        let messages = assembler.push(b"6\r\n world\r\n0\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status_line(), Some((200, "OK")));
        assert_eq!(messages[0].body, b"hello world");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_pipelined_messages_split() {
        let mut assembler = MessageAssembler::default();
        let messages = assembler.push(
            b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status_line(), Some((204, "No Content")));
        assert_eq!(messages[1].body, b"ok");
    }

    #[test]
    fn test_headers_only_partial() {
        let mut assembler = MessageAssembler::default();
        assert!(assembler.push(b"GET / HTTP/1.1\r\nHost: a").is_empty());
        assert_eq!(assembler.push(b"\r\n\r\n").len(), 1);
    }

    #[test]
    fn test_oversized_chunk_is_invalid() {
        let mut assembler = MessageAssembler::default();
        let messages = assembler
            .push(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nFFFFFFFFFFFFFFFF\r\nabcdef");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].request_line(), Some(("POST", "/")));
        assert_eq!(messages[0].body, b"FFFFFFFFFFFFFFFF\r\nabcdef");
        assert_eq!(assembler.pending(), 0);

        let messages = assembler.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n900000\r\nab");
        assert_eq!(messages.len(), 1);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_status_line_rejects_request() {
        let message = HttpMessage {
            start_line: "GET / HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            body: vec![],
        };
        assert!(message.status_line().is_none());
        assert!(message.request_line().is_some());
    }
}
