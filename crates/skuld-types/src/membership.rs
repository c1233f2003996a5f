use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{parse_etag, SkuldError};

/// Identity of a runtime process: endpoint plus a restart epoch.
///
/// Two addresses are equal only when ip, port and generation all match, so a
/// restarted process on the same endpoint is a different node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct NodeAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub generation: i32,
}

impl NodeAddress {
    pub fn new(ip: IpAddr, port: u16, generation: i32) -> Self {
        NodeAddress { ip, port, generation }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Raw octets as stored in the address column (4 bytes for IPv4, 16 for IPv6).
    pub fn address_bytes(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    /// Rebuilds an address from its stored columns.
    pub fn from_columns(bytes: &[u8], port: i32, generation: i32) -> Result<Self, SkuldError> {
        let ip = match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| SkuldError::Backend("short ipv4 address column".into()))?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| SkuldError::Backend("short ipv6 address column".into()))?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => {
                return Err(SkuldError::Backend(format!(
                    "address column has {n} bytes, expected 4 or 16"
                )))
            }
        };
        let port = u16::try_from(port)
            .map_err(|_| SkuldError::Backend(format!("port column {port} out of range")))?;
        Ok(NodeAddress { ip, port, generation })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint(), self.generation)
    }
}

/// Lifecycle of a node as recorded in the roster.
///
/// The directory stores whatever status the caller supplies; transition
/// validity is checked by the runtime, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeStatus {
    Joining,
    Active,
    ShuttingDown,
    Stopping,
    Dead,
}

impl NodeStatus {
    pub fn code(self) -> i16 {
        match self {
            NodeStatus::Joining => 2,
            NodeStatus::Active => 3,
            NodeStatus::ShuttingDown => 4,
            NodeStatus::Stopping => 5,
            NodeStatus::Dead => 6,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, SkuldError> {
        match code {
            2 => Ok(NodeStatus::Joining),
            3 => Ok(NodeStatus::Active),
            4 => Ok(NodeStatus::ShuttingDown),
            5 => Ok(NodeStatus::Stopping),
            6 => Ok(NodeStatus::Dead),
            other => Err(SkuldError::Backend(format!("unknown node status code {other}"))),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Active => "active",
            NodeStatus::ShuttingDown => "shutting-down",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// One accusation that `accuser` considers the owning node unreachable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SuspectEntry {
    pub accuser: NodeAddress,
    pub at_ns: i64,
}

/// One roster row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeEntry {
    pub address: NodeAddress,
    pub name: String,
    pub host: String,
    pub status: NodeStatus,
    pub proxy_port: u16,
    pub start_time_ns: i64,
    pub heartbeat_ns: i64,
    /// Ordered; written as a whole on every update.
    pub suspects: Vec<SuspectEntry>,
}

impl NodeEntry {
    pub fn new(address: NodeAddress, name: impl Into<String>, host: impl Into<String>) -> Self {
        NodeEntry {
            address,
            name: name.into(),
            host: host.into(),
            status: NodeStatus::Joining,
            proxy_port: 0,
            start_time_ns: 0,
            heartbeat_ns: 0,
            suspects: Vec::new(),
        }
    }

    pub fn add_suspect(&mut self, accuser: NodeAddress, at_ns: i64) {
        self.suspects.push(SuspectEntry { accuser, at_ns });
    }
}

/// The single per-cluster row every roster mutation is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TableVersion {
    pub version: i64,
    pub etag: String,
}

impl TableVersion {
    pub fn new(version: i64, etag: impl Into<String>) -> Self {
        TableVersion { version, etag: etag.into() }
    }

    /// Version row written at cluster bootstrap.
    pub fn initial() -> Self {
        TableVersion::new(0, "0")
    }

    pub fn etag_no(&self) -> Result<i64, SkuldError> {
        parse_etag(&self.etag)
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {}>", self.version, self.etag)
    }
}

/// A roster row together with the etag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub entry: NodeEntry,
    pub etag: String,
}

/// Roster rows and the table version, read in one atomic backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub version: TableVersion,
    members: BTreeMap<NodeAddress, MemberRecord>,
}

impl MembershipSnapshot {
    pub fn new(version: TableVersion) -> Self {
        MembershipSnapshot { version, members: BTreeMap::new() }
    }

    pub fn insert(&mut self, record: MemberRecord) {
        self.members.insert(record.entry.address, record);
    }

    pub fn get(&self, address: &NodeAddress) -> Option<&MemberRecord> {
        self.members.get(address)
    }

    pub fn get_mut(&mut self, address: &NodeAddress) -> Option<&mut MemberRecord> {
        self.members.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }
}

/// Anomaly found while cross-checking a row against the table version.
///
/// Never blocks a read; the row is still returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionWarning {
    EtagMismatch { address: NodeAddress, row_etag: i64, version_etag: i64 },
    VersionAhead { address: NodeAddress, row_version: i64, table_version: i64 },
}

impl fmt::Display for CorruptionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionWarning::EtagMismatch { address, row_etag, version_etag } => write!(
                f,
                "member {address} etag {row_etag} does not match version table etag {version_etag}"
            ),
            CorruptionWarning::VersionAhead { address, row_version, table_version } => write!(
                f,
                "member {address} version {row_version} is greater than version table version {table_version}"
            ),
        }
    }
}
