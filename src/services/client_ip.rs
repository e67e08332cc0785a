use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

use crate::config::TrustConfig;

/// Resolves the canonical client IP for a request, optionally honoring
/// forwarded-for/real-ip style headers when the immediate peer is a trusted
/// proxy (spec §4.1).
pub struct ClientIpResolver {
    trust_forwarded_headers: bool,
    trusted_proxy_cidrs: Vec<IpNet>,
}

impl ClientIpResolver {
    pub fn new(config: &TrustConfig) -> Self {
        Self {
            trust_forwarded_headers: config.trust_forwarded_headers,
            trusted_proxy_cidrs: config.trusted_proxy_cidrs.clone(),
        }
    }

    fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trusted_proxy_cidrs.iter().any(|net| net.contains(&ip))
    }

    /// `peer`: the immediate TCP peer address of the connection.
    /// `forwarded_for`: the raw `Forwarded-For`-style header value, if any.
    /// `real_ip`: the raw `Real-IP`-style header value, if any.
    pub fn resolve(
        &self,
        peer: Option<SocketAddr>,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
    ) -> String {
        let peer_ip = peer.map(|p| p.ip());

        let peer_is_trusted = self.trust_forwarded_headers
            && peer_ip.is_some_and(|ip| self.is_trusted_proxy(ip));

        if !peer_is_trusted {
            return peer_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string());
        }

        // Walk the forwarded-for chain right to left; return the first entry
        // whose IP is not itself a trusted proxy. This defeats an attacker
        // prepending spoofed values to the left of the header.
        if let Some(raw) = forwarded_for {
            for entry in raw.split(',').rev() {
                if let Some(ip) = parse_host_ip(entry.trim()) {
                    if !self.is_trusted_proxy(ip) {
                        return ip.to_string();
                    }
                }
            }
        }

        if let Some(raw) = real_ip {
            if let Some(ip) = parse_host_ip(raw.trim()) {
                return ip.to_string();
            }
        }

        peer_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string())
    }
}

/// Accepts `host`, `host:port`, and `[ipv6]:port`.
fn parse_host_ip(s: &str) -> Option<IpAddr> {
    if s.is_empty() {
        return None;
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some(stripped) = s.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return stripped[..end].parse::<IpAddr>().ok();
        }
    }
    if let Some((host, _port)) = s.rsplit_once(':') {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn resolver(trust: bool, cidrs: &[&str]) -> ClientIpResolver {
        ClientIpResolver {
            trust_forwarded_headers: trust,
            trusted_proxy_cidrs: cidrs.iter().map(|c| c.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn untrusted_peer_returns_peer_verbatim() {
        let r = resolver(true, &["10.0.0.0/8"]);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 1234);
        assert_eq!(
            r.resolve(Some(peer), Some("1.2.3.4"), None),
            "203.0.113.9"
        );
    }

    #[test]
    fn trust_disabled_returns_peer_even_if_trusted_cidr_matches() {
        let r = resolver(false, &["127.0.0.0/8"]);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        assert_eq!(r.resolve(Some(peer), Some("1.2.3.4"), None), "127.0.0.1");
    }

    // Matches spec §8 scenario S6: XFF trust with rightmost-untrusted selection.
    #[test]
    fn xff_trust_returns_rightmost_untrusted_entry() {
        let r = resolver(true, &["127.0.0.0/8"]);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        let result = r.resolve(Some(peer), Some("1.2.3.4, 10.0.0.1"), None);
        assert_eq!(result, "10.0.0.1");
    }

    #[test]
    fn falls_back_to_real_ip_when_no_untrusted_xff_entry() {
        let r = resolver(true, &["127.0.0.0/8", "10.0.0.0/8"]);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        let result = r.resolve(Some(peer), Some("10.0.0.1, 10.0.0.2"), Some("9.9.9.9"));
        assert_eq!(result, "9.9.9.9");
    }

    #[test]
    fn falls_back_to_peer_when_nothing_else_available() {
        let r = resolver(true, &["127.0.0.0/8"]);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        let result = r.resolve(Some(peer), None, None);
        assert_eq!(result, "127.0.0.1");
    }

    #[test]
    fn bracketed_ipv6_with_port_parses() {
        assert_eq!(
            parse_host_ip("[2001:db8::1]:443"),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn host_with_port_parses() {
        assert_eq!(parse_host_ip("1.2.3.4:8080"), Some("1.2.3.4".parse().unwrap()));
    }
}
