use crate::types::{Node, PeerId};
use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};
use thiserror::Error;
use url::{Host, Url};

const ENODE_SCHEME: &str = "enode";
const ENODE_PREFIX: &str = "enode://";

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NodeParseError {
    #[error("malformed node url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}")]
    InvalidScheme(String),
    #[error("node id is missing")]
    EmptyId,
    #[error("node id is not 64 hex encoded bytes")]
    InvalidId,
    #[error("host must be an IP address")]
    InvalidHost,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unsupported query parameter {0:?}")]
    InvalidQuery(String),
}

/// Parses `enode://<id>[@host[:port[?discport=N]]]`; the scheme is optional.
///
/// Incomplete nodes carry only the id and get an empty host. The discovery
/// port falls back to the TCP port.
pub fn parse_enode(uri: &str) -> Result<Node, NodeParseError> {
    let uri = uri.trim();
    if !uri.contains('@') {
        return Ok(Node {
            id: parse_id(uri.strip_prefix(ENODE_PREFIX).unwrap_or(uri))?,
            host: String::new(),
            port: 0,
            discovery_port: 0,
        });
    }

    let url = if uri.contains("://") {
        Url::parse(uri)?
    } else {
        Url::parse(&format!("{}{}", ENODE_PREFIX, uri))?
    };
    if url.scheme() != ENODE_SCHEME {
        return Err(NodeParseError::InvalidScheme(url.scheme().to_string()));
    }

    let id = parse_id(url.username())?;
    let ip = match url.host() {
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
        // Hosts of non-special schemes stay opaque, IPv4 included.
        Some(Host::Domain(domain)) => domain
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| NodeParseError::InvalidHost)?,
        None => return Err(NodeParseError::InvalidHost),
    };
    let port = url.port().unwrap_or_default();

    let mut discovery_port = port;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "discport" => {
                discovery_port = value
                    .parse()
                    .map_err(|_| NodeParseError::InvalidPort(value.to_string()))?;
            }
            _ => return Err(NodeParseError::InvalidQuery(key.to_string())),
        }
    }

    Ok(Node {
        id,
        host: ip.to_string(),
        port,
        discovery_port,
    })
}

fn parse_id(id: &str) -> Result<PeerId, NodeParseError> {
    if id.is_empty() {
        return Err(NodeParseError::EmptyId);
    }
    let bytes = hex::decode(id).map_err(|_| NodeParseError::InvalidId)?;
    if bytes.len() != PeerId::len_bytes() {
        return Err(NodeParseError::InvalidId);
    }
    Ok(PeerId::from_slice(&bytes))
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_enode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> String {
        "1b".repeat(64)
    }

    #[test]
    fn complete_node() {
        let node: Node = format!("enode://{}@10.3.58.6:30303?discport=30301", id())
            .parse()
            .unwrap();
        assert_eq!(node.id, PeerId::repeat_byte(0x1b));
        assert_eq!(node.host, "10.3.58.6");
        assert_eq!(node.port, 30303);
        assert_eq!(node.discovery_port, 30301);
    }

    #[test]
    fn discovery_port_defaults_to_tcp_port() {
        let node = parse_enode(&format!("enode://{}@127.0.0.1:30303", id())).unwrap();
        assert_eq!(node.discovery_port, 30303);
    }

    #[test]
    fn incomplete_nodes() {
        for uri in [format!("enode://{}", id()), id()] {
            let node = parse_enode(&uri).unwrap();
            assert_eq!(node.id, PeerId::repeat_byte(0x1b));
            assert!(node.host.is_empty());
            assert_eq!(node.port, 0);
        }
    }

    #[test]
    fn ipv6_hosts() {
        let node = parse_enode(&format!("enode://{}@[::1]:30303", id())).unwrap();
        assert_eq!(node.host, "::1");
        assert_eq!(node.port, 30303);
        assert_eq!(node.to_string(), format!("enode://{}@[::1]:30303", id()));
    }

    #[test]
    fn display_roundtrip() {
        let uri = format!("enode://{}@10.3.58.6:30303?discport=30301", id());
        assert_eq!(parse_enode(&uri).unwrap().to_string(), uri);
    }

    #[test]
    fn scheme_is_optional() {
        let node = parse_enode(&format!("{}@10.3.58.6:30303", id())).unwrap();
        assert_eq!(node.host, "10.3.58.6");
        assert_eq!(node.port, 30303);
    }

    #[test]
    fn missing_port_is_zero() {
        let node = parse_enode(&format!("enode://{}@10.3.58.6", id())).unwrap();
        assert_eq!(node.port, 0);
        assert_eq!(node.discovery_port, 0);
    }

    #[test]
    fn errors() {
        assert_eq!(parse_enode("enode://"), Err(NodeParseError::EmptyId));
        assert_eq!(
            parse_enode("enode://@127.0.0.1:1"),
            Err(NodeParseError::EmptyId)
        );
        assert_eq!(
            parse_enode("enode://zz@127.0.0.1:1"),
            Err(NodeParseError::InvalidId)
        );
        assert_eq!(
            parse_enode("enode://abcd@127.0.0.1:1"),
            Err(NodeParseError::InvalidId)
        );
        assert_eq!(
            parse_enode(&format!("http://{}@127.0.0.1:1", id())),
            Err(NodeParseError::InvalidScheme("http".into()))
        );
        assert_eq!(
            parse_enode(&format!("enode://{}@example.org:30303", id())),
            Err(NodeParseError::InvalidHost)
        );
        assert_eq!(
            parse_enode(&format!("enode://{}@127.0.0.1:http", id())),
            Err(NodeParseError::Url(url::ParseError::InvalidPort))
        );
        assert_eq!(
            parse_enode(&format!("enode://{}@127.0.0.1:1?discport=x", id())),
            Err(NodeParseError::InvalidPort("x".into()))
        );
        assert_eq!(
            parse_enode(&format!("enode://{}@127.0.0.1:1?x=2", id())),
            Err(NodeParseError::InvalidQuery("x".into()))
        );
    }
}
