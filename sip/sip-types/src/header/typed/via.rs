use crate::header::{HeaderError, HeaderValue};
use crate::host::HostPort;
use crate::uri::{Param, Params};
use crate::Name;
use bytesstr::BytesStr;
use std::fmt;

/// `Via` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: HostPort,
    pub params: Params,
}

impl Via {
    pub fn new<T, S, B>(transport: T, sent_by: S, branch: B) -> Via
    where
        T: Into<BytesStr>,
        S: Into<HostPort>,
        B: Into<BytesStr>,
    {
        Via {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params: Params::new().with(Param::value("branch", branch)),
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }
}

impl HeaderValue for Via {
    fn name() -> Name {
        Name::VIA
    }

    fn parse(value: &BytesStr) -> Result<Self, HeaderError> {
        let malformed = || HeaderError::malformed(Name::VIA, value.to_string());

        let rest = value
            .trim()
            .strip_prefix("SIP/2.0/")
            .ok_or_else(malformed)?;

        let (transport, rest) = rest.split_once(char::is_whitespace).ok_or_else(malformed)?;

        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by, Params::parse(params)),
            None => (rest, Params::new()),
        };

        Ok(Via {
            transport: BytesStr::from(transport),
            sent_by: HostPort::parse(sent_by).ok_or_else(malformed)?,
            params,
        })
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn via() {
        let input = BytesStr::from_static("SIP/2.0/TCP 192.168.123.222:53983;branch=z9hG4bKabc123");

        let via = Via::parse(&input).unwrap();

        assert_eq!(via.transport, "TCP");
        assert_eq!(via.sent_by.host, Host::Ip4(Ipv4Addr::new(192, 168, 123, 222)));
        assert_eq!(via.sent_by.port, Some(53983));
        assert_eq!(via.branch().unwrap(), "z9hG4bKabc123");
    }

    #[test]
    fn via_print() {
        let via = Via::new(
            "UDP",
            SocketAddr::from((Ipv4Addr::new(192, 168, 123, 222), 53983)),
            "z9hG4bKabc123",
        );

        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 192.168.123.222:53983;branch=z9hG4bKabc123"
        );
    }

    #[test]
    fn via_received_rport() {
        let input = BytesStr::from_static("SIP/2.0/UDP host.example.com;branch=z9hG4bK1;rport");

        let mut via = Via::parse(&input).unwrap();
        via.params.push_or_edit("received", "198.51.100.7");
        via.params.push_or_edit("rport", "49152");

        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP host.example.com;branch=z9hG4bK1;rport=49152;received=198.51.100.7"
        );
    }
}
