use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Host part of an URI or Via sent-by, either an IP address or a DNS name
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Host {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Name(String),
}

impl Host {
    /// Parse a host. IPv6 addresses must be enclosed in brackets.
    pub fn parse(i: &str) -> Option<Host> {
        let i = i.trim();

        if let Some(stripped) = i.strip_prefix('[') {
            let inner = stripped.strip_suffix(']')?;
            return inner.parse().ok().map(Host::Ip6);
        }

        if let Ok(ip) = i.parse::<Ipv4Addr>() {
            return Some(Host::Ip4(ip));
        }

        if i.is_empty()
            || !i
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
        {
            return None;
        }

        Some(Host::Name(i.to_owned()))
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Host::Ip4(ip),
            IpAddr::V6(ip) => Host::Ip6(ip),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip4(ip) => write!(f, "{ip}"),
            Host::Ip6(ip) => write!(f, "[{ip}]"),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// Host with an optional port
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    /// Parse a `host[:port]` string
    pub fn parse(i: &str) -> Option<HostPort> {
        let i = i.trim();

        // bracketed ipv6 may be followed by a port
        let (host_str, port_str) = if let Some(end) = i.strip_prefix('[').map(|_| i.find(']')) {
            let end = end?;
            match i[end + 1..].strip_prefix(':') {
                Some(port) => (&i[..=end], Some(port)),
                None if i[end + 1..].is_empty() => (&i[..=end], None),
                None => return None,
            }
        } else {
            match i.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (i, None),
            }
        };

        let port = match port_str {
            Some(port) => Some(port.parse().ok()?),
            None => None,
        };

        Some(HostPort {
            host: Host::parse(host_str)?,
            port,
        })
    }

    /// Port with the given default applied
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().into(),
            port: Some(addr.port()),
        }
    }
}

impl From<IpAddr> for HostPort {
    fn from(ip: IpAddr) -> Self {
        HostPort {
            host: ip.into(),
            port: None,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_port_v4() {
        let hp = HostPort::parse("192.0.2.1:5060").unwrap();
        assert_eq!(hp.host, Host::Ip4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(hp.port, Some(5060));
        assert_eq!(hp.to_string(), "192.0.2.1:5060");
    }

    #[test]
    fn host_port_v6() {
        let hp = HostPort::parse("[2001:db8::1]:5060").unwrap();
        assert_eq!(hp.port, Some(5060));
        assert_eq!(hp.to_string(), "[2001:db8::1]:5060");
    }

    #[test]
    fn host_name_without_port() {
        let hp = HostPort::parse("gw.example.com").unwrap();
        assert_eq!(hp.host, Host::Name("gw.example.com".into()));
        assert_eq!(hp.port, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Host::parse("not a host").is_none());
        assert!(HostPort::parse("host:notaport").is_none());
    }
}
