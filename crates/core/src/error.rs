use packet_parser::ParseError;
use std::net::SocketAddrV4;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection table full ({capacity} entries)")]
    TableFull { capacity: usize },

    #[error("connection {client} -> {server} already tracked")]
    AlreadyTracked {
        client: SocketAddrV4,
        server: SocketAddrV4,
    },

    #[error("no connection {client} -> {server}")]
    NotFound {
        client: SocketAddrV4,
        server: SocketAddrV4,
    },

    #[error("connection {client} -> {server} is not proxied")]
    NotProxied {
        client: SocketAddrV4,
        server: SocketAddrV4,
    },

    #[error("proxy-as-client port already set to {0}")]
    ProxyPortAlreadySet(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("ports {src_port}/{dst_port} are not served by a proxy")]
    NotProxiedPort { src_port: u16, dst_port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForgeError {
    #[error("cannot forge a packet for an unmatched side")]
    InvalidSide,

    #[error("connection has no {0} port to forge with")]
    MissingProxyPort(&'static str),

    #[error("packet: {0}")]
    Packet(#[from] ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("expected 9 fields, found {0}")]
    FieldCount(usize),

    #[error("rule name longer than {max} characters: {name}")]
    NameTooLong { name: String, max: usize },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl SnapshotError {
    pub(crate) fn field(field: &'static str, value: &str) -> Self {
        SnapshotError::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}
