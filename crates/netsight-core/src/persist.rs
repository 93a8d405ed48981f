//! Hand-off of observed sessions, connections and HTTP messages to storage.
//!
//! The engine never waits on these calls: every record is spawned onto the
//! runtime and errors are only logged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A transport-layer flow as first seen by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: u64,
    pub session_id: u64,
    pub protocol: String,
    pub ip_version: u8,
    pub initial_timestamp: u64,
    pub initiator_id: i64,
    pub initiator_pkg: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub is_tracker: bool,
}

/// Addressing shared by request and response records.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEndpoints {
    pub connection_id: u64,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub initiator_id: i64,
    pub initiator_pkg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestRecord {
    #[serde(flatten)]
    pub endpoints: MessageEndpoints,
    pub timestamp: u64,
    pub method: String,
    pub remote_path: String,
    pub headers: BTreeMap<String, String>,
    pub content: String,
    pub content_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseRecord {
    #[serde(flatten)]
    pub endpoints: MessageEndpoints,
    pub timestamp: u64,
    pub status_code: u16,
    pub status_msg: String,
    pub headers: BTreeMap<String, String>,
    pub content: String,
    pub content_length: usize,
}

/// Storage collaborator for observed metadata.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Record the start of an engine session and return its id.
    async fn persist_session(&self, start_time: u64) -> Result<u64, PersistError>;

    async fn update_session(&self, id: u64, end_time: u64) -> Result<(), PersistError>;

    async fn persist_transport_layer_connection(
        &self,
        record: ConnectionRecord,
    ) -> Result<(), PersistError>;

    async fn delete_transport_layer_connection(&self, id: u64) -> Result<(), PersistError>;

    async fn persist_http_request(&self, record: HttpRequestRecord) -> Result<(), PersistError>;

    async fn persist_http_response(&self, record: HttpResponseRecord) -> Result<(), PersistError>;
}

/// Emits every record as a structured log line.
#[derive(Debug, Default)]
pub struct TracingConnector;

#[async_trait]
impl DatabaseConnector for TracingConnector {
    async fn persist_session(&self, start_time: u64) -> Result<u64, PersistError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = id, start_time, "session started");
        Ok(id)
    }

    async fn update_session(&self, id: u64, end_time: u64) -> Result<(), PersistError> {
        tracing::info!(session = id, end_time, "session ended");
        Ok(())
    }

    async fn persist_transport_layer_connection(
        &self,
        record: ConnectionRecord,
    ) -> Result<(), PersistError> {
        tracing::info!(
            id = record.id,
            protocol = %record.protocol,
            remote = %format!("{}:{}", record.remote_ip, record.remote_port),
            host = %record.remote_host,
            app = %record.initiator_pkg,
            tracker = record.is_tracker,
            "connection"
        );
        Ok(())
    }

    async fn delete_transport_layer_connection(&self, id: u64) -> Result<(), PersistError> {
        tracing::debug!(id, "connection record withdrawn");
        Ok(())
    }

    async fn persist_http_request(&self, record: HttpRequestRecord) -> Result<(), PersistError> {
        tracing::info!(
            id = record.endpoints.connection_id,
            method = %record.method,
            host = %record.endpoints.remote_host,
            path = %record.remote_path,
            length = record.content_length,
            "http request"
        );
        Ok(())
    }

    async fn persist_http_response(&self, record: HttpResponseRecord) -> Result<(), PersistError> {
        tracing::info!(
            id = record.endpoints.connection_id,
            status = record.status_code,
            host = %record.endpoints.remote_host,
            length = record.content_length,
            "http response"
        );
        Ok(())
    }
}

/// One JSON object per line, tagged with its record kind.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonLine<'a> {
    SessionStart { id: u64, start_time: u64 },
    SessionEnd { id: u64, end_time: u64 },
    Connection(&'a ConnectionRecord),
    ConnectionDeleted { id: u64 },
    HttpRequest(&'a HttpRequestRecord),
    HttpResponse(&'a HttpResponseRecord),
}

/// Appends records as JSON lines to a file.
pub struct JsonLinesConnector {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesConnector {
    pub async fn open(path: &Path) -> Result<Self, PersistError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tracing::info!(path = %path.display(), "writing records as JSON lines");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: JsonLine<'_>) -> Result<(), PersistError> {
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnector for JsonLinesConnector {
    async fn persist_session(&self, start_time: u64) -> Result<u64, PersistError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        self.append(JsonLine::SessionStart { id, start_time }).await?;
        Ok(id)
    }

    async fn update_session(&self, id: u64, end_time: u64) -> Result<(), PersistError> {
        self.append(JsonLine::SessionEnd { id, end_time }).await
    }

    async fn persist_transport_layer_connection(
        &self,
        record: ConnectionRecord,
    ) -> Result<(), PersistError> {
        self.append(JsonLine::Connection(&record)).await
    }

    async fn delete_transport_layer_connection(&self, id: u64) -> Result<(), PersistError> {
        self.append(JsonLine::ConnectionDeleted { id }).await
    }

    async fn persist_http_request(&self, record: HttpRequestRecord) -> Result<(), PersistError> {
        self.append(JsonLine::HttpRequest(&record)).await
    }

    async fn persist_http_response(&self, record: HttpResponseRecord) -> Result<(), PersistError> {
        self.append(JsonLine::HttpResponse(&record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> MessageEndpoints {
        MessageEndpoints {
            connection_id: 42,
            remote_host: "example.com".to_string(),
            remote_ip: "93.184.216.34".to_string(),
            remote_port: 80,
            local_ip: "10.120.0.1".to_string(),
            local_port: 40000,
            initiator_id: 1000,
            initiator_pkg: "curl".to_string(),
        }
    }

    #[tokio::test]
    async fn test_json_lines_appends_tagged_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonLinesConnector::open(&path).await.unwrap();

        let session = sink.persist_session(1).await.unwrap();
        sink.persist_http_request(HttpRequestRecord {
            endpoints: endpoints(),
            timestamp: 2,
            method: "GET".to_string(),
            remote_path: "/".to_string(),
            headers: BTreeMap::from([("Host".to_string(), "example.com".to_string())]),
            content: String::new(),
            content_length: 0,
        })
        .await
        .unwrap();
        sink.update_session(session, 3).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "session_start");
        assert_eq!(lines[1]["kind"], "http_request");
        assert_eq!(lines[1]["method"], "GET");
        assert_eq!(lines[1]["connection_id"], 42);
        assert_eq!(lines[2]["kind"], "session_end");
    }

    #[tokio::test]
    async fn test_tracing_connector_accepts_everything() {
        let sink = TracingConnector;
        let id = sink.persist_session(now_millis()).await.unwrap();
        assert!(id > 0);
        sink.delete_transport_layer_connection(5).await.unwrap();
    }
}
