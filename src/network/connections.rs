use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::{Result, NetGeoError};

/// Display value for a connection without a remote endpoint.
pub const NO_REMOTE_ENDPOINT: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl ConnectionStatus {
    /// Maps a Linux `tcp_states.h` code. Codes outside the known set,
    /// including TCP_CLOSE and TCP_NEW_SYN_RECV, map to `Unknown`.
    pub fn from_tcp_state(code: u8) -> Self {
        match code {
            0x01 => ConnectionStatus::Established,
            0x02 => ConnectionStatus::SynSent,
            0x03 => ConnectionStatus::SynRecv,
            0x04 => ConnectionStatus::FinWait1,
            0x05 => ConnectionStatus::FinWait2,
            0x06 => ConnectionStatus::TimeWait,
            0x08 => ConnectionStatus::CloseWait,
            0x09 => ConnectionStatus::LastAck,
            0x0A => ConnectionStatus::Listen,
            0x0B => ConnectionStatus::Closing,
            _ => ConnectionStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Established => "ESTABLISHED",
            ConnectionStatus::SynSent => "SYN_SENT",
            ConnectionStatus::SynRecv => "SYN_RECV",
            ConnectionStatus::FinWait1 => "FIN_WAIT1",
            ConnectionStatus::FinWait2 => "FIN_WAIT2",
            ConnectionStatus::TimeWait => "TIME_WAIT",
            ConnectionStatus::CloseWait => "CLOSE_WAIT",
            ConnectionStatus::LastAck => "LAST_ACK",
            ConnectionStatus::Listen => "LISTEN",
            ConnectionStatus::Closing => "CLOSING",
            ConnectionStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the OS connection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub status: ConnectionStatus,
    pub pid: Option<u32>,
}

impl ConnectionRecord {
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote.map(|addr| addr.ip().to_canonical())
    }

    pub fn local_display(&self) -> String {
        format_endpoint(&self.local)
    }

    pub fn remote_display(&self) -> String {
        match self.remote {
            Some(ref addr) => format_endpoint(addr),
            None => NO_REMOTE_ENDPOINT.to_string(),
        }
    }
}

/// `ip:port` without the brackets `SocketAddr` puts around IPv6 hosts.
pub fn format_endpoint(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

pub trait ConnectionSource: Send + Sync {
    /// Reads the whole connection table in one shot.
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>>;
}

/// Connection table backed by `/proc/net/{tcp,tcp6,udp,udp6}`.
pub struct ProcfsConnectionSource {
    root: PathBuf,
}

const PROC_NET_TABLES: [(&str, Protocol); 4] = [
    ("tcp", Protocol::Tcp),
    ("tcp6", Protocol::Tcp),
    ("udp", Protocol::Udp),
    ("udp6", Protocol::Udp),
];

impl ProcfsConnectionSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn read_table(&self, name: &str) -> Result<Option<String>> {
        let path = self.root.join("net").join(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Connection table {} not present, skipping", path.display());
                Ok(None)
            }
            Err(e) => Err(NetGeoError::ConnectionTable(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Maps socket inodes to the pid holding them open. Processes whose
    /// fd directory cannot be read are skipped.
    fn socket_owners(&self) -> HashMap<u64, u32> {
        let mut owners = HashMap::new();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot list {}: {}", self.root.display(), e);
                return owners;
            }
        };

        for entry in entries.flatten() {
            let pid: u32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };

            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };

            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path()) {
                    if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                        owners.entry(inode).or_insert(pid);
                    }
                }
            }
        }

        owners
    }
}

impl ConnectionSource for ProcfsConnectionSource {
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let mut tables = Vec::new();
        for (name, protocol) in PROC_NET_TABLES {
            if let Some(content) = self.read_table(name)? {
                tables.push((name, protocol, content));
            }
        }

        if tables.is_empty() {
            return Err(NetGeoError::ConnectionTable(format!(
                "no connection tables found under {}",
                self.root.join("net").display()
            )));
        }

        let owners = self.socket_owners();
        let mut connections = Vec::new();

        for (name, protocol, content) in tables {
            // First line is the column header
            for line in content.lines().skip(1) {
                match parse_proc_net_line(line, protocol) {
                    Some((mut record, inode)) => {
                        if inode != 0 {
                            record.pid = owners.get(&inode).copied();
                        }
                        connections.push(record);
                    }
                    None => {
                        if !line.trim().is_empty() {
                            log::debug!("Skipping malformed {} entry: {}", name, line.trim());
                        }
                    }
                }
            }
        }

        log::debug!("Read {} connections from {}", connections.len(), self.root.display());
        Ok(connections)
    }
}

/// The platform's connection table.
#[cfg(target_os = "linux")]
pub fn system_connection_source(procfs_root: &str) -> Result<Arc<dyn ConnectionSource>> {
    Ok(Arc::new(ProcfsConnectionSource::new(procfs_root)))
}

#[cfg(not(target_os = "linux"))]
pub fn system_connection_source(_procfs_root: &str) -> Result<Arc<dyn ConnectionSource>> {
    Err(NetGeoError::Unsupported(format!(
        "no connection table reader for {}",
        std::env::consts::OS
    )))
}

/// Parses one data row of a `/proc/net` socket table, returning the
/// record (without pid) and its socket inode.
pub fn parse_proc_net_line(line: &str, protocol: Protocol) -> Option<(ConnectionRecord, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let local = parse_hex_endpoint(fields[1])?;
    let remote = parse_hex_endpoint(fields[2])?;
    let state = u8::from_str_radix(fields[3], 16).ok()?;
    let inode: u64 = fields[9].parse().ok()?;

    let status = match protocol {
        Protocol::Tcp => ConnectionStatus::from_tcp_state(state),
        Protocol::Udp => ConnectionStatus::Unknown,
    };

    let record = ConnectionRecord {
        protocol,
        local,
        remote: if remote.port() == 0 { None } else { Some(remote) },
        status,
        pid: None,
    };

    Some((record, inode))
}

/// Decodes a kernel `ADDR:PORT` pair. The address is printed as native
/// (little-endian) 32-bit words, the port as a plain hex number.
fn parse_hex_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    // Dual-stack sockets report IPv4 peers as ::ffff:a.b.c.d
    Some(SocketAddr::new(ip.to_canonical(), port))
}

fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
