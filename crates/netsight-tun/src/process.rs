//! Owning-application lookup for intercepted flows.
//!
//! Given the client-side address of a flow, determines which application
//! opened the socket.

use std::net::SocketAddr;

use crate::packet::TransportProtocol;

/// The application owning a flow. `app_id` is the owning uid on Linux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: i64,
    pub package: String,
}

impl AppInfo {
    pub const UNKNOWN_ID: i64 = -1;

    pub fn unknown() -> Self {
        Self {
            app_id: Self::UNKNOWN_ID,
            package: "unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.app_id == Self::UNKNOWN_ID
    }
}

pub trait AppFinder: Send + Sync {
    /// Resolve the owner of the socket bound to `local`, or `AppInfo::unknown()`.
    fn find(&self, local: SocketAddr, remote: SocketAddr, protocol: TransportProtocol) -> AppInfo;
}

/// Scans the `/proc/net` socket tables, matching on the local port.
#[derive(Debug, Clone)]
pub struct ProcNetFinder {
    proc_root: std::path::PathBuf,
}

impl Default for ProcNetFinder {
    fn default() -> Self {
        Self {
            proc_root: std::path::PathBuf::from("/proc"),
        }
    }
}

impl ProcNetFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different proc mount, e.g. a fixture directory.
    pub fn with_root(proc_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn tables(&self, protocol: TransportProtocol) -> Option<[std::path::PathBuf; 2]> {
        let net = self.proc_root.join("net");
        match protocol {
            TransportProtocol::Tcp => Some([net.join("tcp6"), net.join("tcp")]),
            TransportProtocol::Udp => Some([net.join("udp6"), net.join("udp")]),
            _ => None,
        }
    }

    /// Find `(uid, inode)` of the socket bound to `local_port`.
    fn find_socket(&self, local_port: u16, protocol: TransportProtocol) -> Option<(u32, u64)> {
        for table in self.tables(protocol)? {
            let Ok(content) = std::fs::read_to_string(&table) else {
                continue;
            };
            if let Some(found) = match_socket_table(&content, local_port) {
                return Some(found);
            }
        }
        None
    }

    fn find_pid_by_inode(&self, inode: u64) -> Option<u32> {
        let target = format!("socket:[{inode}]");

        for entry in std::fs::read_dir(&self.proc_root).ok()?.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = std::fs::read_link(fd.path()) {
                    if link.to_string_lossy() == target {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let exe = std::fs::read_link(self.proc_root.join(pid.to_string()).join("exe")).ok()?;
        let name = exe
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| exe.to_string_lossy().to_string());
        Some(name)
    }
}

impl AppFinder for ProcNetFinder {
    fn find(&self, local: SocketAddr, _remote: SocketAddr, protocol: TransportProtocol) -> AppInfo {
        let Some((uid, inode)) = self.find_socket(local.port(), protocol) else {
            tracing::trace!(port = local.port(), "no socket owner found");
            return AppInfo::unknown();
        };

        let package = self
            .find_pid_by_inode(inode)
            .and_then(|pid| self.process_name(pid))
            .unwrap_or_else(|| format!("uid:{uid}"));

        AppInfo {
            app_id: uid as i64,
            package,
        }
    }
}

/// Match a `/proc/net/{tcp,udp}[6]` table on the local port.
///
/// Row format: `sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode`,
/// with addresses as `HEXIP:HEXPORT`.
fn match_socket_table(content: &str, local_port: u16) -> Option<(u32, u64)> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let port = fields[1]
            .rsplit(':')
            .next()
            .and_then(|p| u16::from_str_radix(p, 16).ok());
        if port != Some(local_port) {
            continue;
        }
        let uid = fields[7].parse::<u32>().ok()?;
        let inode = fields[9].parse::<u64>().ok()?;
        return Some((uid, inode));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100780A:9C40 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 67890 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_match_socket_table() {
        assert_eq!(match_socket_table(TCP_TABLE, 40000), Some((1000, 67890)));
        assert_eq!(match_socket_table(TCP_TABLE, 8080), Some((0, 12345)));
        assert_eq!(match_socket_table(TCP_TABLE, 1), None);
    }

    #[test]
    fn test_finder_with_fixture_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP_TABLE).unwrap();

        let finder = ProcNetFinder::with_root(dir.path());
        let local: SocketAddr = "10.120.0.1:40000".parse().unwrap();
        let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();

        let app = finder.find(local, remote, TransportProtocol::Tcp);
        assert_eq!(app.app_id, 1000);
        assert_eq!(app.package, "uid:1000");

        let missing = finder.find(local, remote, TransportProtocol::Udp);
        assert!(missing.is_unknown());
    }
}
