use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, Copy)]
enum CidrNet {
    V4 { addr: u32, prefix: u8 },
    V6 { addr: u128, prefix: u8 },
}

impl CidrNet {
    fn parse(raw: &str) -> Option<Self> {
        let (addr_part, prefix_part) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        match addr_part.parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) => {
                let prefix = match prefix_part {
                    Some(p) => p.parse::<u8>().ok().filter(|p| *p <= 32)?,
                    None => 32,
                };
                Some(CidrNet::V4 {
                    addr: u32::from(addr),
                    prefix,
                })
            }
            IpAddr::V6(addr) => {
                let prefix = match prefix_part {
                    Some(p) => p.parse::<u8>().ok().filter(|p| *p <= 128)?,
                    None => 128,
                };
                Some(CidrNet::V6 {
                    addr: u128::from(addr),
                    prefix,
                })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (CidrNet::V4 { addr, prefix }, IpAddr::V4(ip)) => {
                if *prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - *prefix as u32);
                (u32::from(ip) & mask) == (*addr & mask)
            }
            (CidrNet::V6 { addr, prefix }, IpAddr::V6(ip)) => {
                if *prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - *prefix as u32);
                (u128::from(ip) & mask) == (*addr & mask)
            }
            _ => false,
        }
    }
}

/// Source-address gate. An empty list admits everyone; otherwise the peer
/// address must fall inside one of the configured CIDRs.
#[derive(Debug, Clone, Default)]
pub struct IpAllowlist {
    nets: Arc<Vec<CidrNet>>,
}

impl IpAllowlist {
    pub fn parse(entries: &[String]) -> Result<Self, AllowlistError> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = CidrNet::parse(entry.trim())
                .ok_or_else(|| AllowlistError::InvalidCidr(entry.clone()))?;
            nets.push(net);
        }
        Ok(Self {
            nets: Arc::new(nets),
        })
    }

    pub fn is_open(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        // Dual-stack listeners hand v4 peers to us as v4-mapped v6 addrs.
        let ip = ip.to_canonical();
        self.nets.iter().any(|net| net.contains(ip))
    }
}

pub async fn ip_gate(
    State(allowlist): State<IpAllowlist>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if allowlist.is_open() {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let permitted = match peer {
        Some(addr) => allowlist.permits(addr.ip()),
        None => {
            // No peer address available: fail closed when a list is set.
            warn!("peer address unavailable, denying under active ip_allowlist");
            false
        }
    };

    if !permitted {
        return (
            StatusCode::FORBIDDEN,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":"forbidden","type":"ip_denied","message":"source address not in allow-list"}"#,
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> IpAllowlist {
        IpAllowlist::parse(
            &entries
                .iter()
                .map(|entry| entry.to_string())
                .collect::<Vec<_>>(),
        )
        .expect("valid allowlist")
    }

    #[test]
    fn empty_list_admits_everyone() {
        let allowlist = list(&[]);
        assert!(allowlist.is_open());
        assert!(allowlist.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn cidr_membership() {
        let allowlist = list(&["10.0.0.0/8", "192.168.1.0/24"]);
        assert!(allowlist.permits("10.250.3.4".parse().unwrap()));
        assert!(allowlist.permits("192.168.1.77".parse().unwrap()));
        assert!(!allowlist.permits("192.168.2.1".parse().unwrap()));
        assert!(!allowlist.permits("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_a_host_route() {
        let allowlist = list(&["127.0.0.1"]);
        assert!(allowlist.permits("127.0.0.1".parse().unwrap()));
        assert!(!allowlist.permits("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn v4_mapped_v6_peers_match_v4_rules() {
        let allowlist = list(&["10.0.0.0/8"]);
        assert!(allowlist.permits("::ffff:10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn v6_cidr() {
        let allowlist = list(&["fd00::/8"]);
        assert!(allowlist.permits("fd12::1".parse().unwrap()));
        assert!(!allowlist.permits("fe80::1".parse().unwrap()));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!(IpAllowlist::parse(&["not-a-cidr".to_string()]).is_err());
        assert!(IpAllowlist::parse(&["10.0.0.0/40".to_string()]).is_err());
    }
}
