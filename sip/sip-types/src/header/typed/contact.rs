use crate::header::{HeaderError, HeaderValue};
use crate::uri::{NameAddr, Params};
use crate::Name;
use std::fmt;

/// Single `Contact` header entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Contact {
    pub addr: NameAddr,
    pub params: Params,
}

impl Contact {
    pub fn new(addr: NameAddr) -> Self {
        Self {
            addr,
            params: Params::new(),
        }
    }

    /// `expires` parameter if present
    pub fn expires(&self) -> Option<u32> {
        self.params.get_val("expires")?.parse().ok()
    }
}

impl HeaderValue for Contact {
    fn name() -> Name {
        Name::CONTACT
    }

    fn parse(value: &bytesstr::BytesStr) -> Result<Self, HeaderError> {
        let (addr, params) = NameAddr::parse(value)
            .map_err(|e| HeaderError::malformed(Name::CONTACT, e.to_string()))?;

        Ok(Contact { addr, params })
    }

    fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;

    #[test]
    fn contact_with_expires() {
        let input = BytesStr::from_static("<sip:787@198.51.100.4:5060>;expires=3600");

        let contact = Contact::parse(&input).unwrap();

        assert_eq!(contact.expires(), Some(3600));
        assert_eq!(contact.addr.uri.user.as_deref(), Some("787"));
    }
}
