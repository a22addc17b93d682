use crate::host::HostPort;
use bytesstr::BytesStr;
use std::fmt;

/// `;name=value` / `;flag` parameter list as found on URIs, Via and From/To
/// headers
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Params {
    entries: Vec<Param>,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    pub fn flag(name: impl Into<BytesStr>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value(name: impl Into<BytesStr>, value: impl Into<BytesStr>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, param: Param) -> Self {
        self.entries.push(param);
        self
    }

    /// Parse everything after (and excluding) the first `;`
    pub fn parse(i: &str) -> Params {
        let entries = i
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((name, value)) => Param::value(name.trim(), value.trim().trim_matches('"')),
                None => Param::flag(part),
            })
            .collect();

        Params { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries
            .iter()
            .find(|param| param.name.eq_ignore_ascii_case(name))
    }

    pub fn get_val(&self, name: &str) -> Option<&BytesStr> {
        self.get(name)?.value.as_ref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set the value of `name`, adding the parameter if absent
    pub fn push_or_edit(&mut self, name: &str, value: impl Into<BytesStr>) {
        if let Some(param) = self
            .entries
            .iter_mut()
            .find(|param| param.name.eq_ignore_ascii_case(name))
        {
            param.value = Some(value.into());
        } else {
            self.entries.push(Param::value(name, value));
        }
    }

    /// Remove and return the value of `name`
    pub fn take(&mut self, name: &str) -> Option<BytesStr> {
        let pos = self
            .entries
            .iter()
            .position(|param| param.name.eq_ignore_ascii_case(name))?;

        self.entries.remove(pos).value
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.entries {
            match &param.value {
                Some(value) => write!(f, ";{}={}", param.name, value)?,
                None => write!(f, ";{}", param.name)?,
            }
        }

        Ok(())
    }
}

/// A `sip:` / `sips:` URI, reduced to the parts the B2BUA routes on
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<BytesStr>,
    pub host_port: HostPort,
    pub params: Params,
}

/// Error parsing an URI or name-addr
#[derive(Debug, thiserror::Error)]
#[error("invalid uri: {0}")]
pub struct UriError(pub String);

impl SipUri {
    pub fn new(host_port: HostPort) -> Self {
        Self {
            sips: false,
            user: None,
            host_port,
            params: Params::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<BytesStr>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Parse an URI in its `sip:user@host:port;params` form
    pub fn parse(i: &str) -> Result<SipUri, UriError> {
        let i = i.trim();

        let (sips, rest) = if let Some(rest) = strip_prefix_ignore_case(i, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(i, "sip:") {
            (false, rest)
        } else {
            return Err(UriError(format!("unsupported scheme in {i:?}")));
        };

        // uri headers are not used by the routing core
        let rest = rest.split('?').next().unwrap_or(rest);

        let (addr, params) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Params::parse(params)),
            None => (rest, Params::new()),
        };

        let (user, host) = match addr.rsplit_once('@') {
            Some((user_info, host)) => {
                // strip an optional password
                let user = user_info.split(':').next().unwrap_or(user_info);
                (Some(BytesStr::from(user)), host)
            }
            None => (None, addr),
        };

        let host_port = HostPort::parse(host)
            .ok_or_else(|| UriError(format!("invalid host part in {i:?}")))?;

        Ok(SipUri {
            sips,
            user,
            host_port,
            params,
        })
    }

    /// The default port for this URI's scheme
    pub fn default_port(&self) -> u16 {
        if self.sips { 5061 } else { 5060 }
    }
}

fn strip_prefix_ignore_case<'i>(i: &'i str, prefix: &str) -> Option<&'i str> {
    if i.len() >= prefix.len() && i[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&i[prefix.len()..])
    } else {
        None
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.sips { "sips:" } else { "sip:" })?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        write!(f, "{}{}", self.host_port, self.params)
    }
}

impl std::str::FromStr for SipUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `display-name <uri>` or bare `uri` as used in From/To/Contact/Route
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NameAddr {
    pub display: Option<BytesStr>,
    pub uri: SipUri,
}

impl NameAddr {
    pub fn uri(uri: SipUri) -> Self {
        Self { display: None, uri }
    }

    /// Parse a name-addr. Returns the parsed form plus any parameters
    /// trailing the `<>` enclosed URI.
    pub fn parse(i: &str) -> Result<(NameAddr, Params), UriError> {
        let i = i.trim();

        if let Some(open) = i.find('<') {
            let close = i[open..]
                .find('>')
                .map(|c| open + c)
                .ok_or_else(|| UriError(format!("unclosed angle bracket in {i:?}")))?;

            let display = i[..open].trim().trim_matches('"');
            let display = (!display.is_empty()).then(|| BytesStr::from(display));

            let uri = SipUri::parse(&i[open + 1..close])?;

            let params = match i[close + 1..].trim().strip_prefix(';') {
                Some(params) => Params::parse(params),
                None => Params::new(),
            };

            Ok((NameAddr { display, uri }, params))
        } else {
            // bare uri form, everything after `;` belongs to the header
            let (addr, params) = match i.split_once(';') {
                Some((addr, params)) => (addr, Params::parse(params)),
                None => (i, Params::new()),
            };

            Ok((
                NameAddr {
                    display: None,
                    uri: SipUri::parse(addr)?,
                },
                params,
            ))
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{display}\" <{}>", self.uri)
        } else {
            write!(f, "<{}>", self.uri)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;

    #[test]
    fn parse_full_uri() {
        let uri = SipUri::parse("sip:alice:secret@example.com:5080;transport=tcp").unwrap();

        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host_port.host, Host::Name("example.com".into()));
        assert_eq!(uri.host_port.port, Some(5080));
        assert_eq!(uri.params.get_val("transport").unwrap(), "tcp");
    }

    #[test]
    fn print_canonical() {
        let uri = SipUri::parse("sip:999@example.com").unwrap();
        assert_eq!(uri.to_string(), "sip:999@example.com");
    }

    #[test]
    fn sips_default_port() {
        let uri = SipUri::parse("sips:bob@example.com").unwrap();
        assert!(uri.sips);
        assert_eq!(uri.default_port(), 5061);
    }

    #[test]
    fn name_addr_with_display() {
        let (addr, params) = NameAddr::parse("\"Bob\" <sip:bob@example.com>;tag=abc").unwrap();

        assert_eq!(addr.display.as_deref(), Some("Bob"));
        assert_eq!(addr.uri.user.as_deref(), Some("bob"));
        assert_eq!(params.get_val("tag").unwrap(), "abc");
    }

    #[test]
    fn name_addr_bare_uri() {
        let (addr, params) = NameAddr::parse("sip:bob@example.com;tag=xyz").unwrap();

        assert!(addr.display.is_none());
        assert_eq!(params.get_val("tag").unwrap(), "xyz");
        // uri params stay inside the brackets on bare form per RFC 3261 20.10,
        // everything after `;` is a header parameter here
        assert!(addr.uri.params.is_empty());
    }

    #[test]
    fn angle_uri_keeps_uri_params() {
        let (addr, params) = NameAddr::parse("<sip:h.example.com;lr>").unwrap();

        assert!(addr.uri.params.contains("lr"));
        assert!(params.is_empty());
    }
}
