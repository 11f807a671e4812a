#![forbid(unsafe_code)]

use crate::conntrack::Connection;
use crate::error::ProxyError;
use packet_parser::TcpHeader;
use tracing::error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A service port whose traffic is spliced through a local proxy listening on
/// `proxy_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ProxyRoute {
    pub name: String,
    pub service_port: u16,
    pub proxy_port: u16,
}

impl ProxyRoute {
    pub fn new(name: &str, service_port: u16, proxy_port: u16) -> Self {
        ProxyRoute {
            name: name.to_string(),
            service_port,
            proxy_port,
        }
    }
}

pub fn default_routes() -> Vec<ProxyRoute> {
    vec![
        ProxyRoute::new("smtp", 25, 2500),
        ProxyRoute::new("http", 80, 8001),
        ProxyRoute::new("orientdb", 2424, 24801),
    ]
}

#[derive(Debug, Clone)]
pub struct ProxyClassifier {
    routes: Vec<ProxyRoute>,
}

impl Default for ProxyClassifier {
    fn default() -> Self {
        ProxyClassifier::new(default_routes())
    }
}

impl ProxyClassifier {
    pub fn new(routes: Vec<ProxyRoute>) -> Self {
        ProxyClassifier { routes }
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    /// Route serving either port, first configured route wins.
    pub fn route_for(&self, src_port: u16, dst_port: u16) -> Option<&ProxyRoute> {
        self.routes
            .iter()
            .find(|r| r.service_port == src_port || r.service_port == dst_port)
    }

    pub fn is_proxied_port(&self, tcp: &TcpHeader<'_>) -> bool {
        self.route_for(tcp.source_port, tcp.destination_port).is_some()
    }

    /// Mark `conn` as proxied and record the local proxy port for its service.
    /// A packet for an unrouted service leaves the connection untouched.
    pub fn assign_proxy_port(
        &self,
        conn: &mut Connection,
        tcp: &TcpHeader<'_>,
    ) -> Result<u16, ProxyError> {
        let Some(route) = self.route_for(tcp.source_port, tcp.destination_port) else {
            error!(
                src_port = tcp.source_port,
                dst_port = tcp.destination_port,
                client = %conn.client(),
                "proxy port requested for unproxied service"
            );
            return Err(ProxyError::NotProxiedPort {
                src_port: tcp.source_port,
                dst_port: tcp.destination_port,
            });
        };
        conn.proxy_as_server_port = Some(route.proxy_port);
        conn.proxied = true;
        Ok(route.proxy_port)
    }
}
