//! Networking helpers: UDP binding and default source address discovery.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
};

const IPV4_ROUTES: &str = "/proc/net/route";
const IPV6_ROUTES: &str = "/proc/net/ipv6_route";

/// Bind a non-blocking UDP socket with `SO_REUSEADDR` (IPv6-only for IPv6 addresses).
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(
        domain,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    match addr {
        SocketAddr::V4(v4) => {
            socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(io::Error::from)?;
        }
    }

    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Address of the interface carrying the default route.
///
/// Falls back to the first address of any interface that is not loopback or
/// docker. Returns `None` when nothing usable is configured.
pub fn default_source_ip() -> Option<IpAddr> {
    let addrs = interface_addrs();

    let v4_iface = std::fs::read_to_string(IPV4_ROUTES)
        .ok()
        .and_then(|table| default_iface_v4(&table));
    let v6_iface = std::fs::read_to_string(IPV6_ROUTES)
        .ok()
        .and_then(|table| default_iface_v6(&table));

    if let Some(iface) = v4_iface {
        if let Some(ip) = first_addr(&addrs, &iface, true) {
            return Some(ip);
        }
    }
    if let Some(iface) = v6_iface {
        if let Some(ip) = first_addr(&addrs, &iface, false) {
            return Some(ip);
        }
    }

    let mut seen = Vec::new();
    for (iface, _) in &addrs {
        if iface.starts_with("lo") || iface.starts_with("docker") || seen.contains(iface) {
            continue;
        }
        seen.push(iface.clone());
        if let Some(ip) = first_addr(&addrs, iface, true).or_else(|| first_addr(&addrs, iface, false))
        {
            return Some(ip);
        }
    }
    None
}

fn interface_addrs() -> Vec<(String, IpAddr)> {
    let ifaddrs = match nix::ifaddrs::getifaddrs() {
        Ok(ifaddrs) => ifaddrs,
        Err(e) => {
            tracing::error!("Can't list interface addresses: {}", e);
            return Vec::new();
        }
    };

    ifaddrs
        .filter_map(|ifa| {
            let addr = ifa.address?;
            let ip = if let Some(v4) = addr.as_sockaddr_in() {
                IpAddr::V4(v4.ip())
            } else if let Some(v6) = addr.as_sockaddr_in6() {
                IpAddr::V6(v6.ip())
            } else {
                return None;
            };
            Some((ifa.interface_name, ip))
        })
        .collect()
}

fn first_addr(addrs: &[(String, IpAddr)], iface: &str, v4: bool) -> Option<IpAddr> {
    addrs
        .iter()
        .filter(|(name, _)| name == iface)
        .map(|(_, ip)| *ip)
        .find(|ip| ip.is_ipv4() == v4)
}

/// Interface of the IPv4 default route in `/proc/net/route` format
fn default_iface_v4(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

/// Interface of the IPv6 default route in `/proc/net/ipv6_route` format
fn default_iface_v6(table: &str) -> Option<String> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        let is_default = fields[0].chars().all(|c| c == '0') && fields[1] == "00";
        let iface = fields[9];
        (is_default && iface != "lo").then(|| iface.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_iface_v4() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\n\
                     wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\n";
        assert_eq!(default_iface_v4(table), Some("wlan0".to_string()));
        assert_eq!(default_iface_v4("Iface\tDestination\n"), None);
    }

    #[test]
    fn test_default_iface_v6() {
        let table = "fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001     eth0\n\
                     00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003     eth1\n";
        assert_eq!(default_iface_v6(table), Some("eth1".to_string()));
    }

    #[test]
    fn test_first_addr_by_family() {
        let addrs = vec![
            ("eth0".to_string(), "fe80::1".parse().unwrap()),
            ("eth0".to_string(), "192.168.1.5".parse().unwrap()),
        ];
        assert_eq!(
            first_addr(&addrs, "eth0", true),
            Some("192.168.1.5".parse().unwrap())
        );
        assert_eq!(
            first_addr(&addrs, "eth0", false),
            Some("fe80::1".parse().unwrap())
        );
        assert_eq!(first_addr(&addrs, "eth1", true), None);
    }

    #[test]
    fn test_bind_udp_socket() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
