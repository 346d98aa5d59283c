//! Address helpers shared by endpoints and transports

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use tracing::warn;

use crate::error::{LocalError, Result};

/// True for the hosts that mean "every local interface"
pub fn is_wildcard(host: &str) -> bool {
    host.is_empty() || host == "0.0.0.0" || host == "::" || host == "*"
}

/// Concrete local addresses used to publish a wildcard endpoint: the IPv4
/// address of every interface, without loopback unless nothing else is up.
pub fn local_hosts() -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                let ip = interface.ip();
                if interface.is_loopback() || !ip.is_ipv4() || ip.is_unspecified() {
                    continue;
                }
                let host = ip.to_string();
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        Err(e) => warn!("cannot enumerate network interfaces: {}", e),
    }

    if hosts.is_empty() {
        hosts.push(Ipv4Addr::LOCALHOST.to_string());
    }
    hosts
}

/// Resolve a host/port pair for listening. An empty host binds every
/// interface.
pub fn bind_address(host: &str, port: u16) -> Result<SocketAddr> {
    if is_wildcard(host) {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    resolve(host, port)
}

/// Every address a host/port pair resolves to for connecting, in resolver
/// order. An empty host means loopback.
pub async fn connect_addresses(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if is_wildcard(host) {
        return Ok(vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)]);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| LocalError::ConnectFailed(format!("cannot resolve `{}': {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(LocalError::ConnectFailed(format!("no address found for `{}'", host)));
    }
    Ok(addrs)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| LocalError::ConnectFailed(format!("cannot resolve `{}': {}", host, e)))?
        .next()
        .ok_or_else(|| LocalError::ConnectFailed(format!("no address found for `{}'", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(is_wildcard(""));
        assert!(is_wildcard("0.0.0.0"));
        assert!(!is_wildcard("127.0.0.1"));
    }

    #[test]
    fn test_local_hosts_cover_every_interface() {
        let hosts = local_hosts();
        assert!(!hosts.is_empty());
        assert!(hosts.iter().all(|h| !is_wildcard(h)));

        let expected: Vec<String> = if_addrs::get_if_addrs()
            .unwrap()
            .into_iter()
            .filter(|i| !i.is_loopback() && i.ip().is_ipv4())
            .map(|i| i.ip().to_string())
            .collect();
        for host in &expected {
            assert!(hosts.contains(host), "missing interface address {}", host);
        }
        if expected.is_empty() {
            assert_eq!(hosts, vec!["127.0.0.1".to_string()]);
        } else {
            assert!(!hosts.contains(&"127.0.0.1".to_string()));
        }
    }

    #[tokio::test]
    async fn test_connect_addresses() {
        assert_eq!(
            connect_addresses("", 4061).await.unwrap(),
            vec!["127.0.0.1:4061".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(
            connect_addresses("::1", 1).await.unwrap(),
            vec!["[::1]:1".parse::<SocketAddr>().unwrap()]
        );
        let resolved = connect_addresses("localhost", 4061).await.unwrap();
        assert!(!resolved.is_empty());
        assert!(resolved.iter().all(|a| a.ip().is_loopback() && a.port() == 4061));
    }

    #[test]
    fn test_addresses() {
        assert_eq!(
            bind_address("", 4061).unwrap(),
            "0.0.0.0:4061".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            bind_address("::1", 1).unwrap(),
            "[::1]:1".parse::<SocketAddr>().unwrap()
        );
    }
}
