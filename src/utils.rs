use std::net::{IpAddr, SocketAddr};

/// Generate a compact correlation ID (8 hex characters) from the first 4 bytes of a UUID v4.
pub fn generate_correlation_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.as_bytes()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Collapse IPv4-mapped IPv6 addresses to plain IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Render a socket address for display, with IPv4-mapped addresses shown as IPv4.
pub fn display_addr(addr: &SocketAddr) -> String {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port()).to_string()
}

/// Session identity: `<client-ip>:<port>-><local-ip>:<port>`.
///
/// Both ports are included: concurrent sessions from one host never share a name.
pub fn session_name(client: &SocketAddr, local: &SocketAddr) -> String {
    format!("{}->{}", display_addr(client), display_addr(local))
}
